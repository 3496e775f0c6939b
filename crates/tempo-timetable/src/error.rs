use tempo_core::CoreError;
use tempo_registry::RegistryError;
use tempo_store::StoreError;
use thiserror::Error;

/// Errors raised by tree reads and state machine operations.
#[derive(Debug, Error)]
pub enum TimetableError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    /// No unit of work exists for the bucket.
    #[error("No unit of work for {process_name} at {timeperiod}")]
    UowNotFound {
        process_name: String,
        timeperiod: String,
    },
}

impl TimetableError {
    /// Short error code string used in operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            TimetableError::Store(e) => e.code(),
            TimetableError::Registry(e) => e.code(),
            TimetableError::Core(e) => e.code(),
            TimetableError::TreeNotFound(_)
            | TimetableError::ProcessNotFound(_)
            | TimetableError::UowNotFound { .. } => "NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, TimetableError>;
