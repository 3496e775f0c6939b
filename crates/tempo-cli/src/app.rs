use std::sync::Arc;
use std::time::Duration;

use tempo_core::config::TempoConfig;
use tempo_registry::{ProcessRegistry, Topology};
use tempo_scheduler::Scheduler;
use tempo_store::{UnitOfWork, UowStore};
use tempo_timetable::{EngineSettings, StateMachineEngine, Timetable};
use tokio::sync::mpsc;
use tracing::info;

/// Everything a command needs: the scheduler and the receiving end of its
/// dispatch channel.
pub struct App {
    pub scheduler: Arc<Scheduler>,
    pub dispatched: mpsc::Receiver<UnitOfWork>,
}

/// Open the database, run every schema migration, validate the topology and
/// sync configured entries into the registry.
pub fn build(config: &TempoConfig) -> anyhow::Result<App> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    // each component gets its own connection
    let db = tempo_store::db::open(db_path)?;
    tempo_registry::db::init_db(&db)?;
    tempo_store::db::init_db(&db)?;
    info!("database migrations complete");

    let topology = Arc::new(Topology::build(config)?);
    let registry = Arc::new(ProcessRegistry::new(tempo_store::db::open(db_path)?));
    registry.sync_config(config)?;
    let store = Arc::new(UowStore::new(db));

    let timetable = Arc::new(Timetable::new(
        topology,
        Arc::clone(&registry),
        Arc::clone(&store),
        config.scheduler.tree_cache_capacity,
    ));
    let engine = Arc::new(StateMachineEngine::new(
        timetable,
        Arc::clone(&registry),
        store,
        EngineSettings::from_config(&config.scheduler),
    ));

    let (dispatch_tx, dispatched) = mpsc::channel(config.scheduler.dispatch_buffer.max(1));
    let scheduler = Arc::new(Scheduler::new(
        engine,
        registry,
        dispatch_tx,
        Duration::from_secs(config.scheduler.gc_interval_secs),
    ));
    Ok(App {
        scheduler,
        dispatched,
    })
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
