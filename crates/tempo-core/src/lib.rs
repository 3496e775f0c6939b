//! `tempo-core`: shared vocabulary of the tempo orchestrator.
//!
//! Holds the configuration model, the calendar/timeperiod utility, the
//! trigger-frequency grammar and the closed enums that select a state machine
//! and a blocking policy for every managed process.

pub mod config;
pub mod error;
pub mod frequency;
pub mod timeperiod;
pub mod types;

pub use error::{CoreError, Result};
pub use frequency::{EventTime, TriggerFrequency};
pub use timeperiod::{TimeQualifier, Timeperiod};
pub use types::{BlockingType, StateMachineKind};
