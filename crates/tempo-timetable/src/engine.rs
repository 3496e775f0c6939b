use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tempo_core::config::SchedulerConfig;
use tempo_core::timeperiod::{actual_timeperiod, cast, end_of, next, session_timeperiod};
use tempo_core::{BlockingType, StateMachineKind, Timeperiod};
use tempo_registry::{ManagedProcessEntry, ProcessRegistry, ScheduleKey};
use tempo_store::{NewUnitOfWork, UnitOfWork, UowState, UowStore, UowType};
use tracing::{debug, info, instrument, warn};

use crate::blocking::DependencyState;
use crate::error::{Result, TimetableError};
use crate::tree::Timetable;
use crate::types::CompletionOutcome;

/// Upper bound on buckets one fire may open, so a long-idle process catches
/// up over several ticks instead of one burst.
pub const MAX_ADVANCE_PER_FIRE: usize = 64;

/// Every state a record may leave for `skipped`.
const SKIPPABLE: [UowState; 5] = [
    UowState::Embryo,
    UowState::InProgress,
    UowState::Processed,
    UowState::FinalRun,
    UowState::Noop,
];

/// Tunables of the state machine, taken from `[scheduler]`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lag: Duration,
    pub max_number_of_failures: u32,
    pub start_timeperiod: Option<Timeperiod>,
    pub gc_repost_after: Duration,
    pub gc_life_support: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            lag: Duration::minutes(config.lag_minutes),
            max_number_of_failures: config.max_number_of_failures,
            start_timeperiod: config.start_timeperiod.clone(),
            gc_repost_after: Duration::hours(config.gc_repost_after_hours),
            gc_life_support: Duration::hours(config.gc_life_support_hours),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Result of one garbage-collector sweep.
#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    /// Records to hand to workers: flushed embryos and reposted work.
    pub dispatched: Vec<UnitOfWork>,
    /// Records moved to skipped by life support.
    pub expired: usize,
}

/// Drives units of work through their lifecycle.
///
/// Every operation takes the current instant explicitly. Records returned
/// from `fire_*`, `flush` and `gc_sweep` have already been moved to
/// in_progress and must be delivered to a worker; if delivery fails the
/// caller reverts them with [`StateMachineEngine::revert_dispatch`].
pub struct StateMachineEngine {
    timetable: Arc<Timetable>,
    registry: Arc<ProcessRegistry>,
    store: Arc<UowStore>,
    settings: EngineSettings,
}

impl StateMachineEngine {
    pub fn new(
        timetable: Arc<Timetable>,
        registry: Arc<ProcessRegistry>,
        store: Arc<UowStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            timetable,
            registry,
            store,
            settings,
        }
    }

    pub fn timetable(&self) -> &Arc<Timetable> {
        &self.timetable
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ── Managed processes ────────────────────────────────────────────────

    /// One tick of a managed process: settle its live records, then open
    /// every bucket that has become due.
    #[instrument(skip(self, now))]
    pub fn fire_managed(&self, process_name: &str, now: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let entry = self.registry.managed_entry(process_name)?;
        let qualifier = entry.time_qualifier;
        let active = actual_timeperiod(qualifier, now);
        let mut dispatched = Vec::new();

        for uow in self.store.live_for_process(process_name)? {
            match uow.state {
                UowState::Processed => {
                    let finalized = self.try_finalize(&entry, &uow, now)?;
                    let open = uow.managed_timeperiod().as_ref() == Some(&active);
                    if !finalized && open && entry.state_machine_name == StateMachineKind::Continuous {
                        let rerun = self.store.transition(
                            uow.id,
                            &[UowState::Processed],
                            UowState::InProgress,
                            now,
                        )?;
                        if rerun.applied() {
                            debug!(uow_id = uow.id, timeperiod = %uow.timeperiod, "open timeperiod re-run");
                            dispatched.push(rerun.into_record());
                        }
                    }
                }
                UowState::Embryo if uow.number_of_failures < self.settings.max_number_of_failures => {
                    let Some(tp) = uow.managed_timeperiod() else {
                        continue;
                    };
                    match self.dispatch_gate(&entry, &tp)? {
                        DependencyState::Waiting => {
                            debug!(uow_id = uow.id, timeperiod = %tp, "embryo held back");
                        }
                        DependencyState::SkippedPresent => self.skip_for_dependency(&entry, &tp, now)?,
                        DependencyState::Ready => {
                            if let Some(sent) = self.dispatch(&uow, now)? {
                                dispatched.push(sent);
                            }
                        }
                    }
                }
                UowState::Embryo => {
                    if let Some(tp) = uow.managed_timeperiod() {
                        self.registry.enqueue(process_name, &tp)?;
                    }
                }
                _ => {}
            }
        }

        let mut cursor = match &entry.next_timeperiod {
            Some(tp) => tp.clone(),
            None => self
                .settings
                .start_timeperiod
                .as_ref()
                .map(|start| cast(start, qualifier))
                .unwrap_or_else(|| active.clone()),
        };

        for _ in 0..MAX_ADVANCE_PER_FIRE {
            if cursor > active || !self.is_due(&entry, &cursor, now) {
                break;
            }
            match self.dispatch_gate(&entry, &cursor)? {
                DependencyState::Waiting => break,
                DependencyState::SkippedPresent => {
                    self.skip_for_dependency(&entry, &cursor, now)?;
                }
                DependencyState::Ready => {
                    let settled = self
                        .store
                        .latest(process_name, cursor.as_str())?
                        .is_some_and(|u| u.state.is_terminal());
                    if !settled {
                        let outcome = self
                            .store
                            .create(&NewUnitOfWork::managed(process_name, &cursor, qualifier), now)?;
                        if outcome.is_created() {
                            if let Some(sent) = self.dispatch(&outcome.into_inner(), now)? {
                                dispatched.push(sent);
                            }
                        }
                    }
                }
            }

            if entry.state_machine_name == StateMachineKind::Continuous && cursor == active {
                break;
            }
            cursor = next(&cursor, qualifier);
        }

        if entry.next_timeperiod.as_ref() != Some(&cursor) {
            self.registry.set_next_timeperiod(process_name, &cursor)?;
        }
        self.timetable.invalidate_process(process_name);

        info!(
            dispatched = dispatched.len(),
            next_timeperiod = %cursor,
            "managed process fired"
        );
        Ok(dispatched)
    }

    /// Continuous machines work the open bucket; the others wait until it
    /// has closed and the lag has passed.
    fn is_due(&self, entry: &ManagedProcessEntry, timeperiod: &Timeperiod, now: DateTime<Utc>) -> bool {
        match entry.state_machine_name {
            StateMachineKind::Continuous => true,
            _ => now >= end_of(timeperiod, entry.time_qualifier) + self.settings.lag,
        }
    }

    /// Whether a bucket of `entry` may go to a worker now. Discrete machines
    /// wait for terminal children; dependency blocking waits for the
    /// counterparts in the trees it depends on.
    fn dispatch_gate(&self, entry: &ManagedProcessEntry, timeperiod: &Timeperiod) -> Result<DependencyState> {
        if entry.state_machine_name == StateMachineKind::Discrete
            && !self
                .timetable
                .children_terminal(&entry.process_name, timeperiod)?
        {
            return Ok(DependencyState::Waiting);
        }
        match entry.blocking_type {
            BlockingType::BlockingDependencies => self
                .timetable
                .dependency_state(&entry.process_name, timeperiod),
            _ => Ok(DependencyState::Ready),
        }
    }

    /// A dependency counterpart was skipped: record the bucket and skip it too.
    fn skip_for_dependency(
        &self,
        entry: &ManagedProcessEntry,
        timeperiod: &Timeperiod,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let uow = self
            .store
            .create(
                &NewUnitOfWork::managed(&entry.process_name, timeperiod, entry.time_qualifier),
                now,
            )?
            .into_inner();
        if uow.state == UowState::Skipped {
            return Ok(());
        }
        let skipped = self
            .store
            .transition(uow.id, &UowState::LIVE, UowState::Skipped, now)?;
        if skipped.applied() {
            warn!(
                process = %entry.process_name,
                timeperiod = %timeperiod,
                "dependency skipped, skipping dependant"
            );
            self.registry.dequeue(&entry.process_name, timeperiod)?;
            self.on_terminal(&entry.process_name, timeperiod, now)?;
        }
        Ok(())
    }

    /// Move a processed record to final_run once its timeperiod has closed
    /// and the blocking policy allows it.
    pub fn try_finalize(
        &self,
        entry: &ManagedProcessEntry,
        uow: &UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if uow.state != UowState::Processed {
            return Ok(false);
        }
        let Some(timeperiod) = uow.managed_timeperiod() else {
            return Ok(false);
        };
        if now < end_of(&timeperiod, entry.time_qualifier) {
            return Ok(false);
        }
        if entry.blocking_type == BlockingType::BlockingChildren
            && !self
                .timetable
                .children_terminal(&entry.process_name, &timeperiod)?
        {
            debug!(process = %entry.process_name, %timeperiod, "waiting for children");
            return Ok(false);
        }

        let finalized = self
            .store
            .transition(uow.id, &[UowState::Processed], UowState::FinalRun, now)?;
        if !finalized.applied() {
            return Ok(false);
        }
        info!(process = %entry.process_name, %timeperiod, uow_id = uow.id, "final run");
        self.registry.dequeue(&entry.process_name, &timeperiod)?;
        self.on_terminal(&entry.process_name, &timeperiod, now)?;
        Ok(true)
    }

    /// A bucket reached a terminal state: give the parent bucket a chance to
    /// finalize.
    fn on_terminal(&self, process_name: &str, timeperiod: &Timeperiod, now: DateTime<Utc>) -> Result<()> {
        self.timetable.invalidate_process(process_name);
        let Some(parent) = self.timetable.topology().parent_level(process_name) else {
            return Ok(());
        };
        let parent_tp = cast(timeperiod, parent.time_qualifier);
        let Some(uow) = self.store.live(&parent.process_name, parent_tp.as_str())? else {
            return Ok(());
        };
        if uow.state == UowState::Processed {
            let entry = self.registry.managed_entry(&parent.process_name)?;
            self.try_finalize(&entry, &uow, now)?;
        }
        Ok(())
    }

    // ── Dispatch and completion ──────────────────────────────────────────

    /// embryo → in_progress. `None` if another caller got there first.
    pub fn dispatch(&self, uow: &UnitOfWork, now: DateTime<Utc>) -> Result<Option<UnitOfWork>> {
        let sent = self
            .store
            .transition(uow.id, &[UowState::Embryo], UowState::InProgress, now)?;
        if sent.applied() {
            info!(uow_id = uow.id, process = %uow.process_name, timeperiod = %uow.timeperiod, "dispatched");
            Ok(Some(sent.into_record()))
        } else {
            Ok(None)
        }
    }

    /// Undo a dispatch whose delivery failed: in_progress → embryo, counter
    /// untouched.
    pub fn revert_dispatch(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let reverted = self
            .store
            .transition(id, &[UowState::InProgress], UowState::Embryo, now)?;
        if reverted.applied() {
            warn!(uow_id = id, "dispatch reverted");
        }
        Ok(reverted.applied())
    }

    /// Apply a worker's report. Reports for records that are no longer in
    /// progress are ignored.
    #[instrument(skip(self, now))]
    pub fn complete(&self, id: i64, outcome: CompletionOutcome, now: DateTime<Utc>) -> Result<UnitOfWork> {
        let uow = self.store.get(id)?;
        if uow.state != UowState::InProgress {
            warn!(state = %uow.state, "late completion ignored");
            return Ok(uow);
        }
        let managed_tp = uow.managed_timeperiod();

        let updated = match (outcome, uow.uow_type) {
            (CompletionOutcome::Success, UowType::Managed) => {
                let processed = self
                    .store
                    .transition(id, &[UowState::InProgress], UowState::Processed, now)?;
                if processed.applied() {
                    let entry = self.registry.managed_entry(&uow.process_name)?;
                    self.try_finalize(&entry, processed.record(), now)?;
                }
                self.store.get(id)?
            }
            (CompletionOutcome::Success, UowType::Freerun) => self
                .store
                .transition(id, &[UowState::InProgress], UowState::FinalRun, now)?
                .into_record(),
            (CompletionOutcome::Failure, _) => {
                let failed = self.store.record_failure(id, now)?.into_record();
                if failed.number_of_failures >= self.settings.max_number_of_failures {
                    warn!(failures = failed.number_of_failures, "failure threshold reached");
                    if let Some(tp) = &managed_tp {
                        self.registry.enqueue(&failed.process_name, tp)?;
                    }
                }
                failed
            }
            (CompletionOutcome::NoData, _) => {
                let noop = self
                    .store
                    .transition(id, &[UowState::InProgress], UowState::Noop, now)?;
                if noop.applied() {
                    if let Some(tp) = &managed_tp {
                        self.registry.dequeue(&uow.process_name, tp)?;
                        self.on_terminal(&uow.process_name, tp, now)?;
                    }
                }
                noop.into_record()
            }
        };

        if managed_tp.is_some() {
            self.timetable.invalidate_process(&uow.process_name);
        }
        Ok(updated)
    }

    // ── Operator actions ─────────────────────────────────────────────────

    /// Force the most recent record of a bucket to skipped. Skipping a
    /// skipped record is a no-op.
    #[instrument(skip(self, now))]
    pub fn skip(&self, name: &str, timeperiod: &str, now: DateTime<Utc>) -> Result<UnitOfWork> {
        let (process_name, key, managed_tp) = self.resolve_target(name, timeperiod)?;
        let uow = self
            .store
            .latest(&process_name, &key)?
            .ok_or_else(|| TimetableError::UowNotFound {
                process_name: process_name.clone(),
                timeperiod: key.clone(),
            })?;
        if uow.state == UowState::Skipped {
            return Ok(uow);
        }

        let skipped = self
            .store
            .transition(uow.id, &SKIPPABLE, UowState::Skipped, now)?;
        if skipped.applied() {
            info!(uow_id = uow.id, from = %uow.state, "skipped");
            if let Some(tp) = &managed_tp {
                self.registry.dequeue(&process_name, tp)?;
                self.on_terminal(&process_name, tp, now)?;
            }
        }
        Ok(skipped.into_record())
    }

    /// Schedule a bucket to run again, cascading to the parent bucket and to
    /// the same-qualifier level of every dependant tree.
    ///
    /// Terminal records get a fresh embryo (history kept); live records are
    /// reset to embryo with a zeroed counter. Returns the embryos.
    #[instrument(skip(self, now))]
    pub fn reprocess(&self, name: &str, timeperiod: &str, now: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let (process_name, key, managed_tp) = self.resolve_target(name, timeperiod)?;
        if self.store.latest(&process_name, &key)?.is_none() {
            return Err(TimetableError::UowNotFound {
                process_name,
                timeperiod: key,
            });
        }

        let Some(root_tp) = managed_tp else {
            let embryo = self.reprocess_freerun(&process_name, &key, now)?;
            return Ok(embryo.into_iter().collect());
        };

        let mut visited = HashSet::new();
        let mut pending = VecDeque::from([(process_name, root_tp)]);
        let mut embryos = Vec::new();

        while let Some((process, tp)) = pending.pop_front() {
            if !visited.insert((process.clone(), tp.clone())) {
                continue;
            }
            if let Some(embryo) = self.reprocess_bucket(&process, &tp, now)? {
                embryos.push(embryo);
            }

            let topology = self.timetable.topology();
            if let Some(parent) = topology.parent_level(&process) {
                pending.push_back((parent.process_name.clone(), cast(&tp, parent.time_qualifier)));
            }
            let qualifier = self.timetable.qualifier(&process)?;
            for tree in topology.dependants_of(&process) {
                if let Some(level) = tree.level_for(qualifier) {
                    pending.push_back((level.process_name.clone(), tp.clone()));
                }
            }
            self.timetable.invalidate_process(&process);
        }

        info!(reprocessed = embryos.len(), "reprocess cascade done");
        Ok(embryos)
    }

    fn reprocess_bucket(
        &self,
        process_name: &str,
        timeperiod: &Timeperiod,
        now: DateTime<Utc>,
    ) -> Result<Option<UnitOfWork>> {
        let qualifier = self.timetable.qualifier(process_name)?;
        let embryo = match self.store.latest(process_name, timeperiod.as_str())? {
            None => return Ok(None),
            Some(uow) if uow.state.is_terminal() => self
                .store
                .create(&NewUnitOfWork::managed(process_name, timeperiod, qualifier), now)?
                .into_inner(),
            Some(uow) => self.store.reset_to_embryo(uow.id, now)?.into_record(),
        };
        self.registry.enqueue(process_name, timeperiod)?;
        debug!(process = process_name, %timeperiod, uow_id = embryo.id, "bucket reprocessed");
        Ok(Some(embryo))
    }

    fn reprocess_freerun(&self, schedulable: &str, session: &str, now: DateTime<Utc>) -> Result<Option<UnitOfWork>> {
        let Some(uow) = self.store.latest(schedulable, session)? else {
            return Ok(None);
        };
        let embryo = if uow.state.is_terminal() {
            self.store
                .create(&NewUnitOfWork::freerun(schedulable, session), now)?
                .into_inner()
        } else {
            self.store.reset_to_embryo(uow.id, now)?.into_record()
        };
        Ok(Some(embryo))
    }

    /// Dispatch queued embryos whose gate is open and drop entries whose
    /// record has moved on. Ignores `is_on`.
    #[instrument(skip(self, now))]
    pub fn flush(&self, process_name: &str, now: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let entry = self.registry.managed_entry(process_name)?;
        let mut dispatched = Vec::new();

        for tp in &entry.reprocessing_queue {
            match self.store.live(process_name, tp.as_str())? {
                Some(uow) if uow.state == UowState::Embryo => match self.dispatch_gate(&entry, tp)? {
                    DependencyState::Waiting => continue,
                    DependencyState::SkippedPresent => self.skip_for_dependency(&entry, tp, now)?,
                    DependencyState::Ready => {
                        if let Some(sent) = self.dispatch(&uow, now)? {
                            dispatched.push(sent);
                        }
                        self.registry.dequeue(process_name, tp)?;
                    }
                },
                _ => {
                    self.registry.dequeue(process_name, tp)?;
                }
            }
        }

        if !entry.reprocessing_queue.is_empty() {
            self.timetable.invalidate_process(process_name);
        }
        Ok(dispatched)
    }

    /// Garbage-collector pass: expire work stuck past life support, re-send
    /// in-progress work nobody answered, then flush every active queue.
    pub fn gc_sweep(&self, now: DateTime<Utc>) -> Result<GcReport> {
        let mut report = GcReport::default();

        for uow in self
            .store
            .unfinished_created_before(now - self.settings.gc_life_support)?
        {
            let expired = self.store.transition(
                uow.id,
                &[UowState::Embryo, UowState::InProgress],
                UowState::Skipped,
                now,
            )?;
            if !expired.applied() {
                continue;
            }
            warn!(uow_id = uow.id, process = %uow.process_name, timeperiod = %uow.timeperiod, "life support expired");
            report.expired += 1;
            if let Some(tp) = uow.managed_timeperiod() {
                self.registry.dequeue(&uow.process_name, &tp)?;
                self.on_terminal(&uow.process_name, &tp, now)?;
            }
        }

        for uow in self
            .store
            .in_progress_submitted_before(now - self.settings.gc_repost_after)?
        {
            let touched = self.store.touch_submitted(uow.id, now)?;
            if touched.applied() {
                info!(uow_id = uow.id, process = %uow.process_name, "reposting");
                report.dispatched.push(touched.into_record());
            }
        }

        for entry in self.registry.managed_entries()? {
            if !entry.is_on {
                continue;
            }
            match self.flush(&entry.process_name, now) {
                Ok(sent) => report.dispatched.extend(sent),
                Err(e) => warn!(process = %entry.process_name, error = %e, "flush failed"),
            }
        }

        debug!(dispatched = report.dispatched.len(), expired = report.expired, "gc sweep done");
        Ok(report)
    }

    // ── Freerun entries ──────────────────────────────────────────────────

    /// One tick of a freerun entry: at most one record per entry is worked
    /// at a time.
    #[instrument(skip(self, now))]
    pub fn fire_freerun(&self, process_name: &str, entry_name: &str, now: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let entry = self.registry.freerun_entry(process_name, entry_name)?;
        let schedulable = entry.schedulable_name();

        let latest = self.store.latest_for_process(&schedulable)?;
        let fresh = match latest {
            None => true,
            Some(uow) if uow.state.is_terminal() => true,
            Some(uow)
                if uow.state == UowState::Embryo
                    && uow.number_of_failures < self.settings.max_number_of_failures =>
            {
                return Ok(self.dispatch(&uow, now)?.into_iter().collect());
            }
            Some(uow) if uow.state == UowState::Embryo => {
                warn!(uow_id = uow.id, failures = uow.number_of_failures, "freerun gave up, skipping");
                self.store
                    .transition(uow.id, &[UowState::Embryo], UowState::Skipped, now)?;
                true
            }
            Some(uow) => {
                debug!(uow_id = uow.id, state = %uow.state, "freerun busy");
                false
            }
        };
        if !fresh {
            return Ok(Vec::new());
        }

        let created = self
            .store
            .create(&NewUnitOfWork::freerun(&schedulable, &session_timeperiod(now)), now)?
            .into_inner();
        Ok(self.dispatch(&created, now)?.into_iter().collect())
    }

    /// Map an operator target onto `(store name, timeperiod key, managed
    /// timeperiod)`. Managed timeperiods are cast to the process qualifier.
    fn resolve_target(&self, name: &str, timeperiod: &str) -> Result<(String, String, Option<Timeperiod>)> {
        match ScheduleKey::parse(name) {
            ScheduleKey::Managed(process) => {
                let qualifier = self.timetable.qualifier(&process)?;
                let tp = cast(&Timeperiod::parse(timeperiod)?, qualifier);
                Ok((process, tp.to_string(), Some(tp)))
            }
            ScheduleKey::Freerun {
                process_name,
                entry_name,
            } => {
                let entry = self.registry.freerun_entry(&process_name, &entry_name)?;
                Ok((entry.schedulable_name(), timeperiod.to_string(), None))
            }
        }
    }
}
