//! `tempo-registry`: process entries, timetable tree topology and supervisor
//! box configuration.
//!
//! The [`Topology`] is built once from configuration and is immutable for the
//! lifetime of the process; it owns the tree layout and the cycle-checked
//! dependency graph between trees. The [`ProcessRegistry`] persists the
//! runtime attributes of each entry (`is_on`, trigger frequency,
//! `next_timeperiod`, reprocessing queue) in SQLite.

pub mod db;
pub mod error;
pub mod registry;
pub mod topology;
pub mod types;

pub use error::{RegistryError, Result};
pub use registry::ProcessRegistry;
pub use topology::{Topology, TreeLevel, TreeTopology};
pub use types::{
    BoxConfiguration, BoxProcess, FreerunProcessEntry, Liveness, ManagedProcessEntry,
    ProcessState, ScheduleKey,
};
