use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timeperiod: {0}")]
    InvalidTimeperiod(String),

    #[error("Invalid trigger frequency: {0}")]
    InvalidFrequency(String),

    #[error("Unknown time qualifier: {0}")]
    UnknownQualifier(String),

    #[error("Unknown variant: {0}")]
    UnknownVariant(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Short error code string used in operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidTimeperiod(_) => "INVALID_TIMEPERIOD",
            CoreError::InvalidFrequency(_) => "INVALID_FREQUENCY",
            CoreError::UnknownQualifier(_) => "UNKNOWN_QUALIFIER",
            CoreError::UnknownVariant(_) => "UNKNOWN_VARIANT",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
