//! Trigger API and timer behaviour of the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tempo_core::config::{FreerunEntryConfig, ManagedEntryConfig, SchedulerConfig, TempoConfig, TreeConfig};
use tempo_core::{BlockingType, StateMachineKind, TimeQualifier, Timeperiod, TriggerFrequency};
use tempo_registry::{BoxConfiguration, BoxProcess, Liveness, ProcessRegistry, ProcessState, ScheduleKey, Topology};
use tempo_scheduler::{Completion, Scheduler, TriggerNow};
use tempo_store::{UnitOfWork, UowState, UowStore};
use tempo_timetable::{CompletionOutcome, EngineSettings, StateMachineEngine, Timetable};
use tokio::sync::{mpsc, watch};

const HOURLY: &str = "SiteHourlyAggregator";
const NIGHTLY: &str = "GarbageCollectorWorker::nightly";

struct Harness {
    scheduler: Arc<Scheduler>,
    store: Arc<UowStore>,
    registry: Arc<ProcessRegistry>,
    dispatched: mpsc::Receiver<UnitOfWork>,
}

fn harness(buffer: usize) -> Harness {
    let config = TempoConfig {
        scheduler: SchedulerConfig {
            start_timeperiod: Some(Timeperiod::parse("2024031500").unwrap()),
            ..SchedulerConfig::default()
        },
        managed: vec![ManagedEntryConfig {
            process_name: HOURLY.to_string(),
            time_qualifier: TimeQualifier::Hourly,
            state_machine_name: StateMachineKind::Continuous,
            blocking_type: BlockingType::BlockingNormal,
            trigger_frequency: TriggerFrequency::every(900),
            is_on: true,
        }],
        freerun: vec![FreerunEntryConfig {
            process_name: "GarbageCollectorWorker".to_string(),
            entry_name: "nightly".to_string(),
            trigger_frequency: TriggerFrequency::every(3600),
            is_on: true,
            description: Some("purge expired sessions".to_string()),
        }],
        trees: vec![TreeConfig {
            name: "site".to_string(),
            processes: vec![HOURLY.to_string()],
            dependent_on: vec![],
        }],
        ..TempoConfig::default()
    };

    let registry_conn = Connection::open_in_memory().unwrap();
    tempo_registry::db::init_db(&registry_conn).unwrap();
    let store_conn = Connection::open_in_memory().unwrap();
    tempo_store::db::init_db(&store_conn).unwrap();

    let registry = Arc::new(ProcessRegistry::new(registry_conn));
    registry.sync_config(&config).unwrap();
    let store = Arc::new(UowStore::new(store_conn));
    let timetable = Arc::new(Timetable::new(
        Arc::new(Topology::build(&config).unwrap()),
        Arc::clone(&registry),
        Arc::clone(&store),
        16,
    ));
    let engine = Arc::new(StateMachineEngine::new(
        timetable,
        Arc::clone(&registry),
        Arc::clone(&store),
        EngineSettings::from_config(&config.scheduler),
    ));
    let (tx, rx) = mpsc::channel(buffer);
    let scheduler = Arc::new(Scheduler::new(
        engine,
        Arc::clone(&registry),
        tx,
        Duration::from_secs(300),
    ));
    Harness {
        scheduler,
        store,
        registry,
        dispatched: rx,
    }
}

fn at(h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, h, mi, 0).unwrap()
}

fn state(store: &UowStore, timeperiod: &str) -> UowState {
    store.latest(HOURLY, timeperiod).unwrap().unwrap().state
}

#[test]
fn deactivate_mid_cycle_leaves_work_alone() {
    let h = harness(16);
    let key = ScheduleKey::parse(HOURLY);

    assert_eq!(h.scheduler.tick(&key, at(2, 10)).unwrap(), 3);
    h.scheduler.deactivate(HOURLY).unwrap();

    // The worker keeps going and its report is still applied.
    let first = h.store.latest(HOURLY, "2024031500").unwrap().unwrap();
    h.scheduler
        .engine()
        .complete(first.id, CompletionOutcome::Success, at(2, 20))
        .unwrap();
    assert_eq!(state(&h.store, "2024031500"), UowState::FinalRun);

    assert_eq!(h.scheduler.tick(&key, at(3, 10)).unwrap(), 0);
    assert_eq!(state(&h.store, "2024031501"), UowState::InProgress);
    assert_eq!(state(&h.store, "2024031502"), UowState::InProgress);
    assert!(h.store.latest(HOURLY, "2024031503").unwrap().is_none());
    let entry = h.registry.managed_entry(HOURLY).unwrap();
    assert_eq!(entry.next_timeperiod, Some(Timeperiod::parse("2024031502").unwrap()));

    // Deactivating twice is harmless; activation resumes from where it was.
    h.scheduler.deactivate(HOURLY).unwrap();
    h.scheduler.activate(HOURLY).unwrap();
    assert_eq!(h.scheduler.tick(&key, at(3, 10)).unwrap(), 1);
    assert_eq!(state(&h.store, "2024031503"), UowState::InProgress);
}

#[test]
fn full_dispatch_channel_reverts_to_embryo() {
    let mut h = harness(1);
    let key = ScheduleKey::parse(HOURLY);

    assert_eq!(h.scheduler.tick(&key, at(2, 10)).unwrap(), 1);
    let sent = h.dispatched.try_recv().unwrap();
    assert_eq!(sent.timeperiod, "2024031500");
    assert_eq!(state(&h.store, "2024031501"), UowState::Embryo);
    assert_eq!(state(&h.store, "2024031502"), UowState::Embryo);

    // The next fire picks the reverted records up again.
    assert_eq!(h.scheduler.tick(&key, at(2, 25)).unwrap(), 1);
}

#[test]
fn trigger_now_respects_is_on() {
    let mut h = harness(16);
    h.scheduler.deactivate(NIGHTLY).unwrap();
    assert_eq!(h.scheduler.trigger_now(NIGHTLY).unwrap(), TriggerNow::Inactive);
    assert!(h.dispatched.try_recv().is_err());

    h.scheduler.activate(NIGHTLY).unwrap();
    assert_eq!(
        h.scheduler.trigger_now(NIGHTLY).unwrap(),
        TriggerNow::Fired { dispatched: 1 }
    );
    assert_eq!(h.dispatched.try_recv().unwrap().process_name, NIGHTLY);

    let err = h.scheduler.trigger_now("NoSuchProcess").unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn change_interval_is_persisted_and_validated() {
    let h = harness(16);
    let changed = h.scheduler.change_interval(HOURLY, "at 1-02:30, 14:00").unwrap();
    let (stored, is_on) = h.registry.schedule_state(&ScheduleKey::parse(HOURLY)).unwrap();
    assert_eq!(stored, changed);
    assert!(is_on);

    let err = h.scheduler.change_interval(HOURLY, "every 0").unwrap_err();
    assert_eq!(err.code(), "INVALID_FREQUENCY");
    let err = h.scheduler.change_interval("Missing::entry", "every 60").unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn box_reports_drive_liveness() {
    let h = harness(16);
    let report = BoxConfiguration {
        box_id: "box-1".to_string(),
        process_list: BTreeMap::from([(
            HOURLY.to_string(),
            BoxProcess {
                state: ProcessState::On,
                pid: Some(4242),
            },
        )]),
    };
    h.scheduler.report_box(&report).unwrap();

    let status = h.scheduler.status().unwrap();
    assert_eq!(status.managed[0].liveness, Liveness::Healthy);
    assert_eq!(status.boxes.len(), 1);

    h.scheduler.deactivate(HOURLY).unwrap();
    let status = h.scheduler.status().unwrap();
    assert_eq!(status.managed[0].liveness, Liveness::Inconsistent);
    assert_eq!(status.freerun[0].liveness(), Liveness::Inconsistent);
}

#[tokio::test]
async fn trigger_now_wakes_the_running_timer() {
    let mut h = harness(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc = h.scheduler.start(shutdown_rx);
    assert!(h.scheduler.is_running(NIGHTLY));

    assert_eq!(h.scheduler.trigger_now(NIGHTLY).unwrap(), TriggerNow::Woken);
    let uow = loop {
        let uow = tokio::time::timeout(Duration::from_secs(5), h.dispatched.recv())
            .await
            .expect("timer fired")
            .expect("channel open");
        if uow.process_name == NIGHTLY {
            break uow;
        }
    };
    assert_eq!(uow.state, UowState::InProgress);

    shutdown_tx.send(true).unwrap();
    h.scheduler.join().await;
    gc.await.unwrap();
    assert!(!h.scheduler.is_running(NIGHTLY));
}

#[tokio::test]
async fn completion_listener_applies_reports() {
    let mut h = harness(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (completion_tx, completion_rx) = mpsc::channel(4);
    let listener = tokio::spawn(Arc::clone(&h.scheduler).run_completions(completion_rx, shutdown_rx));

    h.scheduler.trigger_now(NIGHTLY).unwrap();
    let uow = h.dispatched.recv().await.unwrap();
    completion_tx
        .send(Completion {
            uow_id: uow.id,
            outcome: CompletionOutcome::Success,
        })
        .await
        .unwrap();
    drop(completion_tx);
    listener.await.unwrap();

    assert_eq!(h.store.get(uow.id).unwrap().state, UowState::FinalRun);
}
