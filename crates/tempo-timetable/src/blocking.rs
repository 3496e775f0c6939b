//! Blocking checks evaluated before a bucket may start or finalize.

use serde::Serialize;
use tempo_core::timeperiod::{cast, children};
use tempo_core::Timeperiod;
use tempo_store::UowState;
use tracing::debug;

use crate::error::Result;
use crate::tree::Timetable;

/// Combined state of the counterparts of a bucket in every tree its own
/// tree depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    /// Every counterpart is terminal (or has no comparable level).
    Ready,
    /// At least one counterpart is missing or still live.
    Waiting,
    /// At least one counterpart was skipped; the dependant is skipped too.
    SkippedPresent,
}

impl Timetable {
    /// True once every child bucket of `timeperiod` one level down is
    /// terminal. Always true for the finest level.
    pub fn children_terminal(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<bool> {
        let qualifier = self.qualifier(process_name)?;
        let Some(child) = self.topology().child_level(process_name) else {
            return Ok(true);
        };

        for bucket in children(timeperiod, qualifier) {
            let job = self
                .store()
                .job(&child.process_name, child.time_qualifier, &bucket)?;
            match job {
                Some(job) if job.state.is_terminal() => {}
                other => {
                    debug!(
                        child = %child.process_name,
                        timeperiod = %bucket,
                        state = other.as_ref().map(|j| j.state.as_str()).unwrap_or("missing"),
                        "child not terminal"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Look up the counterpart of `(process_name, timeperiod)` in each tree
    /// the process's tree depends on.
    ///
    /// The counterpart is the level with the same qualifier, or failing that
    /// the nearest coarser level with the timeperiod cast to it. A dependency
    /// tree with neither is ignored.
    pub fn dependency_state(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<DependencyState> {
        let qualifier = self.qualifier(process_name)?;
        let mut waiting = false;

        for tree in self.topology().dependencies_of(process_name) {
            let Some(level) = tree
                .level_for(qualifier)
                .or_else(|| tree.nearest_coarser(qualifier))
            else {
                continue;
            };
            let counterpart = cast(timeperiod, level.time_qualifier);
            let job = self
                .store()
                .job(&level.process_name, level.time_qualifier, &counterpart)?;
            match job.map(|j| j.state) {
                Some(UowState::Skipped) => {
                    debug!(tree = %tree.name, process = %level.process_name, timeperiod = %counterpart, "dependency skipped");
                    return Ok(DependencyState::SkippedPresent);
                }
                Some(state) if state.is_terminal() => {}
                _ => waiting = true,
            }
        }

        Ok(if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Ready
        })
    }
}
