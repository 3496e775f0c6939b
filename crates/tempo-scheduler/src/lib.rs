//! `tempo-scheduler`: tokio timers driving the timetable state machine.
//!
//! Every managed and freerun entry gets its own task that sleeps until the
//! next fire of its trigger frequency (or until `trigger_now` wakes it),
//! skips the fire while the entry is off, and otherwise asks the
//! [`tempo_timetable::StateMachineEngine`] for work. A separate task runs
//! the garbage-collector sweep on its own interval.
//!
//! | Frequency          | Fires                                   |
//! |--------------------|-----------------------------------------|
//! | `every N`          | N seconds after the previous fire       |
//! | `at HH:MM`         | daily at HH:MM UTC                      |
//! | `at D-HH:MM`       | weekly on weekday D (0 = Monday)        |

pub mod error;
pub mod schedule;
pub mod scheduler;

pub use error::{Result, SchedulerError};
pub use schedule::compute_next_fire;
pub use scheduler::{Completion, Scheduler, SchedulerStatus, TriggerNow};
