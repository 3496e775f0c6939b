use tempo_core::CoreError;
use tempo_registry::RegistryError;
use tempo_store::StoreError;
use tempo_timetable::TimetableError;
use thiserror::Error;

/// Errors surfaced by the trigger API and the timer tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Timetable(#[from] TimetableError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Timetable(e) => e.code(),
            SchedulerError::Registry(e) => e.code(),
            SchedulerError::Store(e) => e.code(),
            SchedulerError::Core(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
