//! `tempo-store`: durable unit-of-work records and per-granularity job tables.
//!
//! # Mutual exclusion
//!
//! Two constraints on `unit_of_work` are the only locking mechanism:
//!
//! | Constraint                                          | Scope            |
//! |-----------------------------------------------------|------------------|
//! | `UNIQUE (process_name, timeperiod, start_marker, end_marker)` | every record |
//! | partial unique `(process_name, timeperiod)`         | embryo, in_progress, processed |
//!
//! [`UowStore::create`] is an insert-or-detect-conflict: the loser of a race
//! receives [`InsertOutcome::AlreadyScheduled`] with the winning record. Every
//! state change is a compare-and-set on the current state.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::UowStore;
pub use types::{InsertOutcome, JobRecord, NewUnitOfWork, Transition, UnitOfWork, UowState, UowType};
