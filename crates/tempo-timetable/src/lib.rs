//! `tempo-timetable`: the timetable tree view, blocking policies and the
//! per-process state machine engine.
//!
//! # State machine
//!
//! ```text
//!   embryo ──dispatch──▶ in_progress ──success──▶ processed ──policy ok──▶ final_run
//!     ▲                      │  │                     │
//!     └──────failure─────────┘  └──no data──▶ noop    └─(continuous, open period)─▶ in_progress
//!
//!   any ──skip──▶ skipped          live ──reprocess──▶ embryo (counter reset)
//!   terminal ──reprocess──▶ new embryo with fresh markers
//! ```
//!
//! Nothing here owns a timer: the engine is driven by explicit calls carrying
//! the current instant, which keeps every transition reproducible in tests.

pub mod blocking;
pub mod cache;
pub mod engine;
pub mod error;
pub mod tree;
pub mod types;

pub use blocking::DependencyState;
pub use cache::TreeCache;
pub use engine::{EngineSettings, GcReport, StateMachineEngine};
pub use error::{Result, TimetableError};
pub use tree::Timetable;
pub use types::{CompletionOutcome, ProcessSummary, TreeNode, TreeView};
