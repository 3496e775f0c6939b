use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::{CoreError, TimeQualifier, Timeperiod};

/// Processing state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UowState {
    #[serde(rename = "state_embryo")]
    Embryo,
    #[serde(rename = "state_in_progress")]
    InProgress,
    #[serde(rename = "state_processed")]
    Processed,
    #[serde(rename = "state_final_run")]
    FinalRun,
    #[serde(rename = "state_skipped")]
    Skipped,
    #[serde(rename = "state_noop")]
    Noop,
    #[serde(rename = "state_inconsistent")]
    Inconsistent,
    #[serde(rename = "state_inactive")]
    Inactive,
}

impl UowState {
    /// States covered by the one-live-record-per-timeperiod index.
    pub const LIVE: [UowState; 3] = [UowState::Embryo, UowState::InProgress, UowState::Processed];

    pub fn as_str(&self) -> &'static str {
        match self {
            UowState::Embryo => "state_embryo",
            UowState::InProgress => "state_in_progress",
            UowState::Processed => "state_processed",
            UowState::FinalRun => "state_final_run",
            UowState::Skipped => "state_skipped",
            UowState::Noop => "state_noop",
            UowState::Inconsistent => "state_inconsistent",
            UowState::Inactive => "state_inactive",
        }
    }

    /// `final_run`, `skipped` and `noop` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UowState::FinalRun | UowState::Skipped | UowState::Noop)
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

impl std::fmt::Display for UowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UowState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "state_embryo" => Ok(UowState::Embryo),
            "state_in_progress" => Ok(UowState::InProgress),
            "state_processed" => Ok(UowState::Processed),
            "state_final_run" => Ok(UowState::FinalRun),
            "state_skipped" => Ok(UowState::Skipped),
            "state_noop" => Ok(UowState::Noop),
            "state_inconsistent" => Ok(UowState::Inconsistent),
            "state_inactive" => Ok(UowState::Inactive),
            other => Err(CoreError::UnknownVariant(format!("unit of work state {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UowType {
    Managed,
    Freerun,
}

impl UowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UowType::Managed => "managed",
            UowType::Freerun => "freerun",
        }
    }
}

impl std::str::FromStr for UowType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(UowType::Managed),
            "freerun" => Ok(UowType::Freerun),
            other => Err(CoreError::UnknownVariant(format!("unit of work type {other}"))),
        }
    }
}

/// One attempt at processing a (process, timeperiod) bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// SQLite rowid.
    pub id: i64,
    /// Managed process name, or `process::entry` for freerun work.
    pub process_name: String,
    /// Canonical timeperiod for managed work, session key for freerun work.
    pub timeperiod: String,
    pub start_marker: i64,
    pub end_marker: i64,
    pub state: UowState,
    pub number_of_failures: u32,
    pub uow_type: UowType,
    /// Set for managed work only.
    pub time_qualifier: Option<TimeQualifier>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitOfWork {
    /// Timeperiod of managed work; `None` for freerun session keys.
    pub fn managed_timeperiod(&self) -> Option<Timeperiod> {
        match self.uow_type {
            UowType::Managed => Timeperiod::parse(&self.timeperiod).ok(),
            UowType::Freerun => None,
        }
    }
}

/// Request to create a unit of work. Markers are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUnitOfWork {
    pub process_name: String,
    pub timeperiod: String,
    pub uow_type: UowType,
    pub time_qualifier: Option<TimeQualifier>,
}

impl NewUnitOfWork {
    pub fn managed(process_name: &str, timeperiod: &Timeperiod, qualifier: TimeQualifier) -> Self {
        Self {
            process_name: process_name.to_string(),
            timeperiod: timeperiod.to_string(),
            uow_type: UowType::Managed,
            time_qualifier: Some(qualifier),
        }
    }

    pub fn freerun(schedulable_name: &str, session: &str) -> Self {
        Self {
            process_name: schedulable_name.to_string(),
            timeperiod: session.to_string(),
            uow_type: UowType::Freerun,
            time_qualifier: None,
        }
    }
}

/// Result of an optimistic insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(UnitOfWork),
    /// A live record already holds the timeperiod; this is the winner.
    AlreadyScheduled(UnitOfWork),
}

impl InsertOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }

    pub fn into_inner(self) -> UnitOfWork {
        match self {
            InsertOutcome::Created(uow) | InsertOutcome::AlreadyScheduled(uow) => uow,
        }
    }
}

/// Result of a compare-and-set state change.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(UnitOfWork),
    /// The record was not in an expected state; carries its current value.
    Unchanged(UnitOfWork),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn record(&self) -> &UnitOfWork {
        match self {
            Transition::Applied(uow) | Transition::Unchanged(uow) => uow,
        }
    }

    pub fn into_record(self) -> UnitOfWork {
        match self {
            Transition::Applied(uow) | Transition::Unchanged(uow) => uow,
        }
    }
}

/// Latest state of a (process, timeperiod) bucket, as kept in `job_<qualifier>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub process_name: String,
    pub timeperiod: Timeperiod,
    pub time_qualifier: TimeQualifier,
    pub state: UowState,
    pub related_unit_of_work: i64,
    pub number_of_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_live_partition_the_stored_states() {
        for state in [
            UowState::Embryo,
            UowState::InProgress,
            UowState::Processed,
            UowState::FinalRun,
            UowState::Skipped,
            UowState::Noop,
        ] {
            assert_ne!(state.is_terminal(), state.is_live(), "{state}");
            assert_eq!(state.as_str().parse::<UowState>().unwrap(), state);
        }
        assert!(!UowState::Inconsistent.is_terminal());
        assert!(!UowState::Inconsistent.is_live());
    }

    #[test]
    fn serde_names_match_display() {
        let json = serde_json::to_string(&UowState::FinalRun).unwrap();
        assert_eq!(json, "\"state_final_run\"");
    }
}
