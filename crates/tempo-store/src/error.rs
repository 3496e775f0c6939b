use tempo_core::CoreError;
use thiserror::Error;

/// Errors raised by the unit-of-work store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Unit of work not found: {id}")]
    NotFound { id: i64 },

    /// The insert was rejected but no conflicting record could be read back.
    #[error("Conflicting unit of work for {process_name} at {timeperiod}")]
    Conflict {
        process_name: String,
        timeperiod: String,
    },
}

impl StoreError {
    /// Short error code string used in operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Core(e) => e.code(),
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Conflict { .. } => "CONFLICT",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
