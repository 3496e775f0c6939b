use serde::{Deserialize, Serialize};
use tempo_core::{BlockingType, CoreError, StateMachineKind, TimeQualifier, Timeperiod};
use tempo_registry::{Liveness, ManagedProcessEntry};
use tempo_store::{JobRecord, UowState};

/// A (process, timeperiod) position of a tree. Derived from the job tables,
/// never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
    pub timeperiod: Timeperiod,
    pub parent_timeperiod: Option<Timeperiod>,
    pub state: UowState,
    pub number_of_failures: u32,
    pub related_unit_of_work: i64,
    /// False for the finest level of the tree.
    pub has_children: bool,
}

impl TreeNode {
    pub(crate) fn from_job(job: JobRecord, has_children: bool) -> Self {
        let parent_timeperiod = tempo_core::timeperiod::parent(&job.timeperiod, job.time_qualifier);
        Self {
            process_name: job.process_name,
            time_qualifier: job.time_qualifier,
            timeperiod: job.timeperiod,
            parent_timeperiod,
            state: job.state,
            number_of_failures: job.number_of_failures,
            related_unit_of_work: job.related_unit_of_work,
            has_children,
        }
    }
}

/// Per-process header of a tree view.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
    pub state_machine_name: StateMachineKind,
    pub blocking_type: BlockingType,
    pub trigger_frequency: String,
    pub is_on: bool,
    pub is_alive: bool,
    pub liveness: Liveness,
    /// Declared `next_timeperiod` when a bucket exists for it, otherwise the
    /// greatest existing bucket.
    pub next_timeperiod: Option<Timeperiod>,
    pub reprocessing_queue: Vec<Timeperiod>,
}

impl ProcessSummary {
    pub(crate) fn new(entry: ManagedProcessEntry, next_timeperiod: Option<Timeperiod>) -> Self {
        let liveness = entry.liveness();
        Self {
            process_name: entry.process_name,
            time_qualifier: entry.time_qualifier,
            state_machine_name: entry.state_machine_name,
            blocking_type: entry.blocking_type,
            trigger_frequency: entry.trigger_frequency.to_string(),
            is_on: entry.is_on,
            is_alive: entry.is_alive,
            liveness,
            next_timeperiod,
            reprocessing_queue: entry.reprocessing_queue.into_iter().collect(),
        }
    }
}

/// Whole-tree view: process headers coarsest first, plus the top-level nodes.
/// Deeper levels are read with `Timetable::get_tree_nodes`.
#[derive(Debug, Clone, Serialize)]
pub struct TreeView {
    pub tree_name: String,
    pub dependent_on: Vec<String>,
    pub dependant_trees: Vec<String>,
    pub processes: Vec<ProcessSummary>,
    pub nodes: Vec<TreeNode>,
}

/// What a worker reports back for a dispatched unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Success,
    Failure,
    /// The bucket had nothing to process.
    NoData,
}

impl std::str::FromStr for CompletionOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CompletionOutcome::Success),
            "failure" => Ok(CompletionOutcome::Failure),
            "no_data" | "no-data" => Ok(CompletionOutcome::NoData),
            other => Err(CoreError::UnknownVariant(format!("completion outcome {other}"))),
        }
    }
}
