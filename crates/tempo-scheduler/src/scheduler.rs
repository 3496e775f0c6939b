use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempo_core::{Timeperiod, TriggerFrequency};
use tempo_registry::{BoxConfiguration, FreerunProcessEntry, ProcessRegistry, ScheduleKey};
use tempo_store::UnitOfWork;
use tempo_timetable::{CompletionOutcome, ProcessSummary, StateMachineEngine, TreeNode, TreeView};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::schedule::compute_next_fire;

/// A worker's report for a dispatched unit of work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Completion {
    pub uow_id: i64,
    pub outcome: CompletionOutcome,
}

/// What `trigger_now` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum TriggerNow {
    /// The running timer was woken and fires on its own task.
    Woken,
    /// No timer runs in this process; the entry fired inline.
    Fired { dispatched: usize },
    /// The entry is off; nothing happened.
    Inactive,
}

/// Snapshot of every entry for operator output.
#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub managed: Vec<ProcessSummary>,
    pub freerun: Vec<FreerunProcessEntry>,
    pub boxes: Vec<BoxConfiguration>,
}

struct TimerHandle {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

/// One timer task per entry plus a garbage-collector task, all feeding
/// dispatched units of work into one channel.
///
/// Dispatch is non-blocking (`try_send`); a record that cannot be delivered
/// is reverted to embryo and picked up again on a later fire.
pub struct Scheduler {
    engine: Arc<StateMachineEngine>,
    registry: Arc<ProcessRegistry>,
    dispatch_tx: mpsc::Sender<UnitOfWork>,
    timers: DashMap<ScheduleKey, TimerHandle>,
    gc_interval: Duration,
}

impl Scheduler {
    pub fn new(
        engine: Arc<StateMachineEngine>,
        registry: Arc<ProcessRegistry>,
        dispatch_tx: mpsc::Sender<UnitOfWork>,
        gc_interval: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            dispatch_tx,
            timers: DashMap::new(),
            gc_interval,
        }
    }

    pub fn engine(&self) -> &StateMachineEngine {
        &self.engine
    }

    // ── Tasks ────────────────────────────────────────────────────────────

    /// Spawn a timer per configured entry and the GC task. Returns the GC
    /// task handle; timer handles stay in the scheduler until [`Scheduler::join`].
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let keys = self.engine.timetable().topology().schedule_keys().to_vec();
        for key in keys {
            let wake = Arc::new(Notify::new());
            let task = tokio::spawn(Arc::clone(self).timer_loop(
                key.clone(),
                Arc::clone(&wake),
                shutdown.clone(),
            ));
            self.timers.insert(key, TimerHandle { wake, task });
        }
        info!(timers = self.timers.len(), "scheduler started");
        tokio::spawn(Arc::clone(self).gc_loop(shutdown))
    }

    /// Wait for every timer task to stop.
    pub async fn join(&self) {
        let keys: Vec<ScheduleKey> = self.timers.iter().map(|t| t.key().clone()).collect();
        for key in keys {
            if let Some((key, handle)) = self.timers.remove(&key) {
                if let Err(e) = handle.task.await {
                    error!(entry = %key, "timer task failed: {e}");
                }
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.timers.contains_key(&ScheduleKey::parse(name))
    }

    async fn timer_loop(
        self: Arc<Self>,
        key: ScheduleKey,
        wake: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(entry = %key, "timer started");
        loop {
            // Re-read every cycle so interval changes apply on the next fire.
            let delay = match self.registry.schedule_state(&key) {
                Ok((frequency, _)) => next_delay(&frequency, Utc::now()),
                Err(e) => {
                    error!(entry = %key, "timer stopped: {e}");
                    return;
                }
            };
            let sleep = async {
                match delay {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => {}
                _ = wake.notified() => {
                    debug!(entry = %key, "timer woken");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.tick(&key, Utc::now()) {
                error!(entry = %key, code = e.code(), "tick failed: {e}");
            }
        }
        debug!(entry = %key, "timer stopped");
    }

    async fn gc_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.gc_interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.gc_tick(Utc::now()) {
                        error!(code = e.code(), "gc sweep failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("gc task shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Apply worker reports until the channel closes or shutdown is signalled.
    pub async fn run_completions(
        self: Arc<Self>,
        mut completions: mpsc::Receiver<Completion>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = completions.recv() => {
                    let Some(report) = received else { break };
                    if let Err(e) = self.report_completion(report.uow_id, report.outcome) {
                        warn!(uow_id = report.uow_id, code = e.code(), "completion rejected: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("completion listener stopped");
    }

    /// One timer fire: skipped while the entry is off. Returns how many units
    /// of work were handed to the dispatch channel.
    pub fn tick(&self, key: &ScheduleKey, now: DateTime<Utc>) -> Result<usize> {
        let (_, is_on) = self.registry.schedule_state(key)?;
        if !is_on {
            debug!(entry = %key, "entry is off, tick skipped");
            return Ok(0);
        }
        self.fire(key, now)
    }

    fn fire(&self, key: &ScheduleKey, now: DateTime<Utc>) -> Result<usize> {
        let dispatched = match key {
            ScheduleKey::Managed(name) => self.engine.fire_managed(name, now)?,
            ScheduleKey::Freerun {
                process_name,
                entry_name,
            } => self.engine.fire_freerun(process_name, entry_name, now)?,
        };
        Ok(self.send_all(dispatched))
    }

    /// One GC sweep; reposted and flushed work goes to the dispatch channel.
    pub fn gc_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let report = self.engine.gc_sweep(now)?;
        if report.expired > 0 {
            warn!(expired = report.expired, "units of work expired");
        }
        Ok(self.send_all(report.dispatched))
    }

    fn send_all(&self, dispatched: Vec<UnitOfWork>) -> usize {
        dispatched.into_iter().map(|uow| self.send(uow)).filter(|sent| *sent).count()
    }

    fn send(&self, uow: UnitOfWork) -> bool {
        match self.dispatch_tx.try_send(uow) {
            Ok(()) => true,
            Err(e) => {
                let uow = e.into_inner();
                warn!(uow_id = uow.id, process = %uow.process_name, "dispatch channel full or closed, reverting");
                if let Err(e) = self.engine.revert_dispatch(uow.id, Utc::now()) {
                    error!(uow_id = uow.id, "revert failed: {e}");
                }
                false
            }
        }
    }

    // ── Trigger API ──────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub fn activate(&self, name: &str) -> Result<()> {
        self.set_on(name, true)
    }

    #[instrument(skip(self))]
    pub fn deactivate(&self, name: &str) -> Result<()> {
        self.set_on(name, false)
    }

    fn set_on(&self, name: &str, is_on: bool) -> Result<()> {
        let key = ScheduleKey::parse(name);
        self.registry.set_on(&key, is_on)?;
        self.engine.timetable().invalidate_process(key.process_name());
        info!(entry = %key, is_on, "entry switched");
        Ok(())
    }

    /// Persist a new trigger frequency. A running timer picks it up after
    /// its current wait.
    #[instrument(skip(self))]
    pub fn change_interval(&self, name: &str, frequency: &str) -> Result<TriggerFrequency> {
        let key = ScheduleKey::parse(name);
        let frequency: TriggerFrequency = frequency.parse()?;
        self.registry.set_trigger_frequency(&key, &frequency)?;
        self.engine.timetable().invalidate_process(key.process_name());
        info!(entry = %key, %frequency, "trigger frequency changed");
        Ok(frequency)
    }

    pub fn skip(&self, name: &str, timeperiod: &str) -> Result<UnitOfWork> {
        Ok(self.engine.skip(name, timeperiod, Utc::now())?)
    }

    pub fn reprocess(&self, name: &str, timeperiod: &str) -> Result<Vec<UnitOfWork>> {
        Ok(self.engine.reprocess(name, timeperiod, Utc::now())?)
    }

    /// Fire an entry now. Respects `is_on`.
    #[instrument(skip(self))]
    pub fn trigger_now(&self, name: &str) -> Result<TriggerNow> {
        let key = ScheduleKey::parse(name);
        let (_, is_on) = self.registry.schedule_state(&key)?;
        if !is_on {
            return Ok(TriggerNow::Inactive);
        }
        if let Some(timer) = self.timers.get(&key) {
            timer.wake.notify_one();
            return Ok(TriggerNow::Woken);
        }
        let dispatched = self.fire(&key, Utc::now())?;
        Ok(TriggerNow::Fired { dispatched })
    }

    /// Drain one process's reprocessing queue. Ignores `is_on`.
    pub fn flush_reprocessing_queue(&self, name: &str) -> Result<usize> {
        let dispatched = self.engine.flush(name, Utc::now())?;
        Ok(self.send_all(dispatched))
    }

    pub fn get_tree(&self, tree_name: &str) -> Result<Arc<TreeView>> {
        Ok(self.engine.timetable().get_tree(tree_name)?)
    }

    pub fn get_tree_nodes(&self, process_name: &str, timeperiod: &str) -> Result<Arc<Vec<TreeNode>>> {
        let timeperiod = Timeperiod::parse(timeperiod)?;
        Ok(self
            .engine
            .timetable()
            .get_tree_nodes(process_name, &timeperiod)?)
    }

    pub fn report_completion(&self, uow_id: i64, outcome: CompletionOutcome) -> Result<UnitOfWork> {
        Ok(self.engine.complete(uow_id, outcome, Utc::now())?)
    }

    /// Record what a supervisor box reports running.
    pub fn report_box(&self, config: &BoxConfiguration) -> Result<()> {
        self.registry.upsert_box(config)?;
        self.engine.timetable().invalidate_all();
        Ok(())
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        Ok(SchedulerStatus {
            managed: self.engine.timetable().process_summaries()?,
            freerun: self.registry.freerun_entries()?,
            boxes: self.registry.box_configurations()?,
        })
    }
}

fn next_delay(frequency: &TriggerFrequency, now: DateTime<Utc>) -> Option<Duration> {
    compute_next_fire(frequency, now).map(|at| (at - now).to_std().unwrap_or_default())
}
