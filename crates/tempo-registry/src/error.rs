use tempo_core::CoreError;
use thiserror::Error;

/// Errors raised while loading or mutating process entries.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No entry with the given schedulable name exists.
    #[error("Process not found: {name}")]
    ProcessNotFound { name: String },

    #[error("Duplicate managed process: {0}")]
    DuplicateProcess(String),

    #[error("Duplicate freerun entry: {process_name}::{entry_name}")]
    DuplicateFreerun {
        process_name: String,
        entry_name: String,
    },

    #[error("Duplicate tree: {0}")]
    DuplicateTree(String),

    #[error("Tree {tree} references unknown process {process}")]
    UnknownProcess { tree: String, process: String },

    #[error("Tree {tree} depends on unknown tree {dependency}")]
    UnknownTree { tree: String, dependency: String },

    #[error("Process {process} belongs to both {first} and {second}")]
    ProcessInMultipleTrees {
        process: String,
        first: String,
        second: String,
    },

    /// The name would read as a `process::entry` freerun key.
    #[error("Process name {0} must not contain \"::\"")]
    ReservedSeparator(String),

    #[error("Managed process {0} is not part of any tree")]
    OrphanProcess(String),

    #[error("Invalid tree {tree}: {reason}")]
    InvalidTree { tree: String, reason: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}

impl RegistryError {
    /// Short error code string used in operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Database(_) => "DATABASE_ERROR",
            RegistryError::Core(e) => e.code(),
            RegistryError::Serialization(_) => "SERIALIZATION_ERROR",
            RegistryError::ProcessNotFound { .. } => "NOT_FOUND",
            RegistryError::DependencyCycle(_) => "DEPENDENCY_CYCLE",
            RegistryError::DuplicateProcess(_)
            | RegistryError::DuplicateFreerun { .. }
            | RegistryError::DuplicateTree(_)
            | RegistryError::UnknownProcess { .. }
            | RegistryError::UnknownTree { .. }
            | RegistryError::ProcessInMultipleTrees { .. }
            | RegistryError::OrphanProcess(_)
            | RegistryError::ReservedSeparator(_)
            | RegistryError::InvalidTree { .. } => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
