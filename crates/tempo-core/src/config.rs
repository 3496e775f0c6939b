use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frequency::TriggerFrequency;
use crate::timeperiod::{TimeQualifier, Timeperiod};
use crate::types::{BlockingType, StateMachineKind};

pub const DEFAULT_LAG_MINUTES: i64 = 5;
pub const DEFAULT_MAX_NUMBER_OF_FAILURES: u32 = 3;
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_GC_REPOST_AFTER_HOURS: i64 = 2;
pub const DEFAULT_GC_LIFE_SUPPORT_HOURS: i64 = 48;
pub const DEFAULT_TREE_CACHE_CAPACITY: usize = 256;
pub const DEFAULT_DISPATCH_BUFFER: usize = 256;

/// Top-level config (tempo.toml + TEMPO_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TempoConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub managed: Vec<ManagedEntryConfig>,
    #[serde(default)]
    pub freerun: Vec<FreerunEntryConfig>,
    #[serde(default)]
    pub trees: Vec<TreeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Earliest timeperiod ever scheduled. When unset, a fresh process starts
    /// at the bucket open at startup.
    #[serde(default)]
    pub start_timeperiod: Option<Timeperiod>,
    /// Minutes to wait after a timeperiod closes before starting it.
    #[serde(default = "default_lag_minutes")]
    pub lag_minutes: i64,
    #[serde(default = "default_max_failures")]
    pub max_number_of_failures: u32,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    #[serde(default = "default_gc_repost")]
    pub gc_repost_after_hours: i64,
    #[serde(default = "default_gc_life_support")]
    pub gc_life_support_hours: i64,
    #[serde(default = "default_tree_cache")]
    pub tree_cache_capacity: usize,
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_timeperiod: None,
            lag_minutes: DEFAULT_LAG_MINUTES,
            max_number_of_failures: DEFAULT_MAX_NUMBER_OF_FAILURES,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            gc_repost_after_hours: DEFAULT_GC_REPOST_AFTER_HOURS,
            gc_life_support_hours: DEFAULT_GC_LIFE_SUPPORT_HOURS,
            tree_cache_capacity: DEFAULT_TREE_CACHE_CAPACITY,
            dispatch_buffer: DEFAULT_DISPATCH_BUFFER,
        }
    }
}

/// A process that takes part in a timetable tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedEntryConfig {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
    pub state_machine_name: StateMachineKind,
    pub blocking_type: BlockingType,
    pub trigger_frequency: TriggerFrequency,
    #[serde(default = "bool_true")]
    pub is_on: bool,
}

/// A process scheduled by frequency alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreerunEntryConfig {
    pub process_name: String,
    pub entry_name: String,
    pub trigger_frequency: TriggerFrequency,
    #[serde(default = "bool_true")]
    pub is_on: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub name: String,
    /// Managed process names, one per time qualifier.
    pub processes: Vec<String>,
    /// Names of trees this tree waits on.
    #[serde(default)]
    pub dependent_on: Vec<String>,
}

impl TempoConfig {
    /// Load config from a TOML file, with env var overrides.
    ///
    /// Nested keys use a double underscore in env vars:
    /// `TEMPO_SCHEDULER__LAG_MINUTES=10`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TEMPO_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading configuration");

        let config: TempoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TEMPO_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.toml", home)
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.db", home)
}

fn default_lag_minutes() -> i64 {
    DEFAULT_LAG_MINUTES
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_NUMBER_OF_FAILURES
}

fn default_gc_interval() -> u64 {
    DEFAULT_GC_INTERVAL_SECS
}

fn default_gc_repost() -> i64 {
    DEFAULT_GC_REPOST_AFTER_HOURS
}

fn default_gc_life_support() -> i64 {
    DEFAULT_GC_LIFE_SUPPORT_HOURS
}

fn default_tree_cache() -> usize {
    DEFAULT_TREE_CACHE_CAPACITY
}

fn default_dispatch_buffer() -> usize {
    DEFAULT_DISPATCH_BUFFER
}

fn bool_true() -> bool {
    true
}
