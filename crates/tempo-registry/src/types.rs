use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tempo_core::{BlockingType, StateMachineKind, TimeQualifier, Timeperiod, TriggerFrequency};

/// Separator between process and entry name in a freerun schedulable name.
pub const FREERUN_SEPARATOR: &str = "::";

/// A process that takes part in exactly one timetable tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedProcessEntry {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
    pub state_machine_name: StateMachineKind,
    pub blocking_type: BlockingType,
    pub trigger_frequency: TriggerFrequency,
    /// Administratively enabled.
    pub is_on: bool,
    /// Some supervisor box reports the process as running.
    pub is_alive: bool,
    /// `None` until the first scheduler fire.
    pub next_timeperiod: Option<Timeperiod>,
    pub reprocessing_queue: BTreeSet<Timeperiod>,
}

impl ManagedProcessEntry {
    pub fn liveness(&self) -> Liveness {
        Liveness::of(self.is_on, self.is_alive)
    }
}

/// A process scheduled by trigger frequency alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreerunProcessEntry {
    pub process_name: String,
    pub entry_name: String,
    pub trigger_frequency: TriggerFrequency,
    pub is_on: bool,
    pub is_alive: bool,
    pub description: Option<String>,
}

impl FreerunProcessEntry {
    /// `process::entry`, the name freerun units of work are stored under.
    pub fn schedulable_name(&self) -> String {
        format!("{}{FREERUN_SEPARATOR}{}", self.process_name, self.entry_name)
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::of(self.is_on, self.is_alive)
    }
}

/// Addresses one scheduler timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScheduleKey {
    Managed(String),
    Freerun {
        process_name: String,
        entry_name: String,
    },
}

impl ScheduleKey {
    /// Parse a schedulable name: `process` or `process::entry`.
    pub fn parse(name: &str) -> Self {
        match name.split_once(FREERUN_SEPARATOR) {
            Some((process, entry)) => ScheduleKey::Freerun {
                process_name: process.to_string(),
                entry_name: entry.to_string(),
            },
            None => ScheduleKey::Managed(name.to_string()),
        }
    }

    /// Process name as reported by supervisor boxes.
    pub fn process_name(&self) -> &str {
        match self {
            ScheduleKey::Managed(name) => name,
            ScheduleKey::Freerun { process_name, .. } => process_name,
        }
    }
}

impl std::fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleKey::Managed(name) => f.write_str(name),
            ScheduleKey::Freerun {
                process_name,
                entry_name,
            } => write!(f, "{process_name}{FREERUN_SEPARATOR}{entry_name}"),
        }
    }
}

/// Diagnostic derived from `is_on` and `is_alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    #[serde(rename = "healthy")]
    Healthy,
    /// Switched on but not running, or running while switched off.
    #[serde(rename = "state_inconsistent")]
    Inconsistent,
    /// Switched off and not running.
    #[serde(rename = "state_inactive")]
    Inactive,
}

impl Liveness {
    pub fn of(is_on: bool, is_alive: bool) -> Self {
        match (is_on, is_alive) {
            (true, true) => Liveness::Healthy,
            (false, false) => Liveness::Inactive,
            _ => Liveness::Inconsistent,
        }
    }
}

/// Process state as reported by a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    #[serde(rename = "state_on")]
    On,
    #[serde(rename = "state_off")]
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxProcess {
    pub state: ProcessState,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Per-host process table written by an external supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxConfiguration {
    pub box_id: String,
    #[serde(default)]
    pub process_list: BTreeMap<String, BoxProcess>,
}

impl BoxConfiguration {
    pub fn reports_running(&self, process_name: &str) -> bool {
        self.process_list
            .get(process_name)
            .is_some_and(|p| p.state == ProcessState::On)
    }
}
