#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tempo_core::config::{FreerunEntryConfig, ManagedEntryConfig, SchedulerConfig, TempoConfig, TreeConfig};
use tempo_core::{BlockingType, StateMachineKind, TimeQualifier, Timeperiod, TriggerFrequency};
use tempo_registry::{ProcessRegistry, Topology};
use tempo_store::UowStore;
use tempo_timetable::{EngineSettings, StateMachineEngine, Timetable};

pub struct Harness {
    pub engine: StateMachineEngine,
    pub timetable: Arc<Timetable>,
    pub registry: Arc<ProcessRegistry>,
    pub store: Arc<UowStore>,
}

pub fn harness(config: TempoConfig) -> Harness {
    let registry_conn = Connection::open_in_memory().unwrap();
    tempo_registry::db::init_db(&registry_conn).unwrap();
    let store_conn = Connection::open_in_memory().unwrap();
    tempo_store::db::init_db(&store_conn).unwrap();

    let topology = Arc::new(Topology::build(&config).unwrap());
    let registry = Arc::new(ProcessRegistry::new(registry_conn));
    registry.sync_config(&config).unwrap();
    let store = Arc::new(UowStore::new(store_conn));
    let timetable = Arc::new(Timetable::new(
        topology,
        Arc::clone(&registry),
        Arc::clone(&store),
        config.scheduler.tree_cache_capacity,
    ));
    let engine = StateMachineEngine::new(
        Arc::clone(&timetable),
        Arc::clone(&registry),
        Arc::clone(&store),
        EngineSettings::from_config(&config.scheduler),
    );
    Harness {
        engine,
        timetable,
        registry,
        store,
    }
}

pub fn managed(
    name: &str,
    qualifier: TimeQualifier,
    kind: StateMachineKind,
    blocking: BlockingType,
) -> ManagedEntryConfig {
    ManagedEntryConfig {
        process_name: name.to_string(),
        time_qualifier: qualifier,
        state_machine_name: kind,
        blocking_type: blocking,
        trigger_frequency: TriggerFrequency::every(900),
        is_on: true,
    }
}

pub fn freerun(process: &str, entry: &str) -> FreerunEntryConfig {
    FreerunEntryConfig {
        process_name: process.to_string(),
        entry_name: entry.to_string(),
        trigger_frequency: TriggerFrequency::every(3600),
        is_on: true,
        description: None,
    }
}

pub fn tree(name: &str, processes: &[&str], dependent_on: &[&str]) -> TreeConfig {
    TreeConfig {
        name: name.to_string(),
        processes: processes.iter().map(|p| p.to_string()).collect(),
        dependent_on: dependent_on.iter().map(|d| d.to_string()).collect(),
    }
}

pub fn scheduler_from(start: &str) -> SchedulerConfig {
    SchedulerConfig {
        start_timeperiod: Some(tp(start)),
        ..SchedulerConfig::default()
    }
}

pub fn tp(raw: &str) -> Timeperiod {
    Timeperiod::parse(raw).unwrap()
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}
