use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tempo_core::config::TempoConfig;
use tempo_core::{CoreError, Timeperiod, TriggerFrequency};
use tracing::{debug, info, instrument};

use crate::error::{RegistryError, Result};
use crate::types::{
    BoxConfiguration, FreerunProcessEntry, ManagedProcessEntry, ProcessState, ScheduleKey,
};

/// Persistent runtime attributes of managed and freerun entries.
///
/// Wraps a single SQLite connection in a `Mutex`; open one registry per
/// component that needs it, all pointing at the same database file.
pub struct ProcessRegistry {
    db: Mutex<Connection>,
}

impl ProcessRegistry {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert every configured entry.
    ///
    /// Static attributes (qualifier, state machine, blocking type,
    /// description) follow the configuration. Runtime attributes (`is_on`,
    /// trigger frequency, `next_timeperiod`) are only seeded on first insert so
    /// that operator triggers survive a restart.
    #[instrument(skip_all)]
    pub fn sync_config(&self, config: &TempoConfig) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for entry in &config.managed {
            tx.execute(
                "INSERT INTO scheduler_managed_entry
                 (process_name, time_qualifier, state_machine_name, blocking_type,
                  trigger_frequency, is_on, next_timeperiod)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
                 ON CONFLICT(process_name) DO UPDATE SET
                    time_qualifier     = excluded.time_qualifier,
                    state_machine_name = excluded.state_machine_name,
                    blocking_type      = excluded.blocking_type",
                params![
                    entry.process_name,
                    entry.time_qualifier.as_str(),
                    entry.state_machine_name.as_str(),
                    entry.blocking_type.as_str(),
                    entry.trigger_frequency.to_string(),
                    entry.is_on,
                ],
            )?;
        }
        for entry in &config.freerun {
            tx.execute(
                "INSERT INTO scheduler_freerun_entry
                 (process_name, entry_name, trigger_frequency, is_on, description)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(process_name, entry_name) DO UPDATE SET
                    description = excluded.description",
                params![
                    entry.process_name,
                    entry.entry_name,
                    entry.trigger_frequency.to_string(),
                    entry.is_on,
                    entry.description,
                ],
            )?;
        }
        tx.commit()?;
        info!(
            managed = config.managed.len(),
            freerun = config.freerun.len(),
            "process entries synchronised"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn managed_entry(&self, process_name: &str) -> Result<ManagedProcessEntry> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT process_name, time_qualifier, state_machine_name, blocking_type,
                        trigger_frequency, is_on, next_timeperiod
                 FROM scheduler_managed_entry WHERE process_name = ?1",
                [process_name],
                row_to_managed,
            )
            .optional()?
            .ok_or_else(|| not_found(process_name))?;
        hydrate_managed(&conn, entry)
    }

    pub fn managed_entries(&self) -> Result<Vec<ManagedProcessEntry>> {
        let conn = self.conn();
        let entries: Vec<ManagedProcessEntry> = {
            let mut stmt = conn.prepare(
                "SELECT process_name, time_qualifier, state_machine_name, blocking_type,
                        trigger_frequency, is_on, next_timeperiod
                 FROM scheduler_managed_entry ORDER BY process_name",
            )?;
            let rows = stmt.query_map([], row_to_managed)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        entries
            .into_iter()
            .map(|e| hydrate_managed(&conn, e))
            .collect()
    }

    #[instrument(skip(self))]
    pub fn freerun_entry(&self, process_name: &str, entry_name: &str) -> Result<FreerunProcessEntry> {
        let conn = self.conn();
        let mut entry = conn
            .query_row(
                "SELECT process_name, entry_name, trigger_frequency, is_on, description
                 FROM scheduler_freerun_entry WHERE process_name = ?1 AND entry_name = ?2",
                [process_name, entry_name],
                row_to_freerun,
            )
            .optional()?
            .ok_or_else(|| not_found(&format!("{process_name}::{entry_name}")))?;
        entry.is_alive = alive_processes(&conn)?.contains(&entry.process_name);
        Ok(entry)
    }

    pub fn freerun_entries(&self) -> Result<Vec<FreerunProcessEntry>> {
        let conn = self.conn();
        let mut entries: Vec<FreerunProcessEntry> = {
            let mut stmt = conn.prepare(
                "SELECT process_name, entry_name, trigger_frequency, is_on, description
                 FROM scheduler_freerun_entry ORDER BY process_name, entry_name",
            )?;
            let rows = stmt.query_map([], row_to_freerun)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let alive = alive_processes(&conn)?;
        for entry in &mut entries {
            entry.is_alive = alive.contains(&entry.process_name);
        }
        Ok(entries)
    }

    /// Current `(trigger_frequency, is_on)` of a timer.
    pub fn schedule_state(&self, key: &ScheduleKey) -> Result<(TriggerFrequency, bool)> {
        let conn = self.conn();
        let row: Option<(String, bool)> = match key {
            ScheduleKey::Managed(name) => conn
                .query_row(
                    "SELECT trigger_frequency, is_on FROM scheduler_managed_entry
                     WHERE process_name = ?1",
                    [name],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?,
            ScheduleKey::Freerun {
                process_name,
                entry_name,
            } => conn
                .query_row(
                    "SELECT trigger_frequency, is_on FROM scheduler_freerun_entry
                     WHERE process_name = ?1 AND entry_name = ?2",
                    [process_name, entry_name],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?,
        };
        let (frequency, is_on) = row.ok_or_else(|| not_found(&key.to_string()))?;
        Ok((frequency.parse()?, is_on))
    }

    /// Flip `is_on`. Setting the current value again is a no-op.
    #[instrument(skip(self), fields(key = %key))]
    pub fn set_on(&self, key: &ScheduleKey, is_on: bool) -> Result<()> {
        let conn = self.conn();
        let n = match key {
            ScheduleKey::Managed(name) => conn.execute(
                "UPDATE scheduler_managed_entry SET is_on = ?1 WHERE process_name = ?2",
                params![is_on, name],
            )?,
            ScheduleKey::Freerun {
                process_name,
                entry_name,
            } => conn.execute(
                "UPDATE scheduler_freerun_entry SET is_on = ?1
                 WHERE process_name = ?2 AND entry_name = ?3",
                params![is_on, process_name, entry_name],
            )?,
        };
        if n == 0 {
            return Err(not_found(&key.to_string()));
        }
        info!(is_on, "entry switched");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key, frequency = %frequency))]
    pub fn set_trigger_frequency(&self, key: &ScheduleKey, frequency: &TriggerFrequency) -> Result<()> {
        let conn = self.conn();
        let frequency = frequency.to_string();
        let n = match key {
            ScheduleKey::Managed(name) => conn.execute(
                "UPDATE scheduler_managed_entry SET trigger_frequency = ?1 WHERE process_name = ?2",
                params![frequency, name],
            )?,
            ScheduleKey::Freerun {
                process_name,
                entry_name,
            } => conn.execute(
                "UPDATE scheduler_freerun_entry SET trigger_frequency = ?1
                 WHERE process_name = ?2 AND entry_name = ?3",
                params![frequency, process_name, entry_name],
            )?,
        };
        if n == 0 {
            return Err(not_found(&key.to_string()));
        }
        info!("trigger frequency changed");
        Ok(())
    }

    pub fn set_next_timeperiod(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE scheduler_managed_entry SET next_timeperiod = ?1 WHERE process_name = ?2",
            params![timeperiod.as_str(), process_name],
        )?;
        if n == 0 {
            return Err(not_found(process_name));
        }
        debug!(process = %process_name, next_timeperiod = %timeperiod, "next timeperiod advanced");
        Ok(())
    }

    /// Add a timeperiod to the reprocessing queue. Already queued is a no-op.
    pub fn enqueue(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "INSERT OR IGNORE INTO reprocessing_queue (process_name, timeperiod) VALUES (?1, ?2)",
            [process_name, timeperiod.as_str()],
        )?;
        if n > 0 {
            info!(process = %process_name, timeperiod = %timeperiod, "queued for reprocessing");
        }
        Ok(())
    }

    /// Remove a timeperiod from the queue; returns whether it was queued.
    pub fn dequeue(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM reprocessing_queue WHERE process_name = ?1 AND timeperiod = ?2",
            [process_name, timeperiod.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn reprocessing_queue(&self, process_name: &str) -> Result<BTreeSet<Timeperiod>> {
        let conn = self.conn();
        load_queue(&conn, process_name)
    }

    /// Store the process table reported by a supervisor box.
    #[instrument(skip(self, config), fields(box_id = %config.box_id))]
    pub fn upsert_box(&self, config: &BoxConfiguration) -> Result<()> {
        let process_list = serde_json::to_string(&config.process_list)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO box_configuration (box_id, process_list, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(box_id) DO UPDATE SET
                process_list = excluded.process_list,
                updated_at   = excluded.updated_at",
            params![config.box_id, process_list, now],
        )?;
        info!(processes = config.process_list.len(), "box configuration stored");
        Ok(())
    }

    pub fn box_configurations(&self) -> Result<Vec<BoxConfiguration>> {
        let conn = self.conn();
        load_boxes(&conn)
    }
}

fn not_found(name: &str) -> RegistryError {
    RegistryError::ProcessNotFound {
        name: name.to_string(),
    }
}

fn hydrate_managed(conn: &Connection, mut entry: ManagedProcessEntry) -> Result<ManagedProcessEntry> {
    entry.reprocessing_queue = load_queue(conn, &entry.process_name)?;
    entry.is_alive = alive_processes(conn)?.contains(&entry.process_name);
    Ok(entry)
}

fn load_queue(conn: &Connection, process_name: &str) -> Result<BTreeSet<Timeperiod>> {
    let mut stmt = conn.prepare_cached(
        "SELECT timeperiod FROM reprocessing_queue WHERE process_name = ?1 ORDER BY timeperiod",
    )?;
    let rows = stmt.query_map([process_name], |r| parse_column::<Timeperiod>(r, 0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn load_boxes(conn: &Connection) -> Result<Vec<BoxConfiguration>> {
    let mut stmt =
        conn.prepare_cached("SELECT box_id, process_list FROM box_configuration ORDER BY box_id")?;
    let raw: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    raw.into_iter()
        .map(|(box_id, list)| -> Result<BoxConfiguration> {
            Ok(BoxConfiguration {
                box_id,
                process_list: serde_json::from_str(&list)?,
            })
        })
        .collect()
}

/// Names of processes that at least one box reports as `state_on`.
fn alive_processes(conn: &Connection) -> Result<HashSet<String>> {
    let mut alive = HashSet::new();
    for config in load_boxes(conn)? {
        for (name, process) in config.process_list {
            if process.state == ProcessState::On {
                alive.insert(name);
            }
        }
    }
    Ok(alive)
}

fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: CoreError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a SQLite row to a `ManagedProcessEntry`; queue and liveness are
/// filled in by `hydrate_managed`.
fn row_to_managed(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManagedProcessEntry> {
    let next_timeperiod: Option<String> = row.get(6)?;
    let next_timeperiod = next_timeperiod
        .map(|t| Timeperiod::parse(&t))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(ManagedProcessEntry {
        process_name: row.get(0)?,
        time_qualifier: parse_column(row, 1)?,
        state_machine_name: parse_column(row, 2)?,
        blocking_type: parse_column(row, 3)?,
        trigger_frequency: parse_column(row, 4)?,
        is_on: row.get(5)?,
        is_alive: false,
        next_timeperiod,
        reprocessing_queue: BTreeSet::new(),
    })
}

fn row_to_freerun(row: &rusqlite::Row<'_>) -> rusqlite::Result<FreerunProcessEntry> {
    Ok(FreerunProcessEntry {
        process_name: row.get(0)?,
        entry_name: row.get(1)?,
        trigger_frequency: parse_column(row, 2)?,
        is_on: row.get(3)?,
        is_alive: false,
        description: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::types::{BoxProcess, Liveness};
    use std::collections::BTreeMap;
    use tempo_core::config::{FreerunEntryConfig, ManagedEntryConfig};
    use tempo_core::{BlockingType, StateMachineKind, TimeQualifier};

    fn registry() -> ProcessRegistry {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let registry = ProcessRegistry::new(conn);
        registry.sync_config(&config()).unwrap();
        registry
    }

    fn config() -> TempoConfig {
        TempoConfig {
            managed: vec![ManagedEntryConfig {
                process_name: "SiteHourlyAggregator".into(),
                time_qualifier: TimeQualifier::Hourly,
                state_machine_name: StateMachineKind::Continuous,
                blocking_type: BlockingType::BlockingNormal,
                trigger_frequency: TriggerFrequency::every(900),
                is_on: true,
            }],
            freerun: vec![FreerunEntryConfig {
                process_name: "GarbageCollectorWorker".into(),
                entry_name: "nightly".into(),
                trigger_frequency: TriggerFrequency::every(3600),
                is_on: false,
                description: Some("sweeps stale data".into()),
            }],
            ..TempoConfig::default()
        }
    }

    #[test]
    fn resync_keeps_runtime_attributes() {
        let registry = registry();
        let key = ScheduleKey::Managed("SiteHourlyAggregator".into());
        registry.set_on(&key, false).unwrap();
        registry
            .set_trigger_frequency(&key, &TriggerFrequency::every(60))
            .unwrap();
        registry
            .set_next_timeperiod("SiteHourlyAggregator", &Timeperiod::parse("2024031507").unwrap())
            .unwrap();

        registry.sync_config(&config()).unwrap();

        let entry = registry.managed_entry("SiteHourlyAggregator").unwrap();
        assert!(!entry.is_on);
        assert_eq!(entry.trigger_frequency, TriggerFrequency::every(60));
        assert_eq!(entry.next_timeperiod.unwrap().as_str(), "2024031507");
        assert_eq!(entry.state_machine_name, StateMachineKind::Continuous);
    }

    #[test]
    fn unknown_entries_are_not_found() {
        let registry = registry();
        let err = registry
            .set_on(&ScheduleKey::Managed("Nope".into()), true)
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(registry.managed_entry("Nope").is_err());
        assert!(registry.freerun_entry("GarbageCollectorWorker", "hourly").is_err());
    }

    #[test]
    fn queue_is_an_ordered_set() {
        let registry = registry();
        let later = Timeperiod::parse("2024031509").unwrap();
        let earlier = Timeperiod::parse("2024031507").unwrap();
        registry.enqueue("SiteHourlyAggregator", &later).unwrap();
        registry.enqueue("SiteHourlyAggregator", &earlier).unwrap();
        registry.enqueue("SiteHourlyAggregator", &later).unwrap();

        let queue = registry.reprocessing_queue("SiteHourlyAggregator").unwrap();
        assert_eq!(queue.into_iter().collect::<Vec<_>>(), vec![earlier.clone(), later]);
        assert!(registry.dequeue("SiteHourlyAggregator", &earlier).unwrap());
        assert!(!registry.dequeue("SiteHourlyAggregator", &earlier).unwrap());
    }

    #[test]
    fn liveness_follows_box_reports() {
        let registry = registry();
        let entry = registry.managed_entry("SiteHourlyAggregator").unwrap();
        assert_eq!(entry.liveness(), Liveness::Inconsistent);

        let mut process_list = BTreeMap::new();
        process_list.insert(
            "SiteHourlyAggregator".to_string(),
            BoxProcess {
                state: ProcessState::On,
                pid: Some(1234),
            },
        );
        registry
            .upsert_box(&BoxConfiguration {
                box_id: "dev-1".into(),
                process_list,
            })
            .unwrap();

        let entry = registry.managed_entry("SiteHourlyAggregator").unwrap();
        assert!(entry.is_alive);
        assert_eq!(entry.liveness(), Liveness::Healthy);

        let gc = registry.freerun_entry("GarbageCollectorWorker", "nightly").unwrap();
        assert_eq!(gc.liveness(), Liveness::Inactive);
        assert_eq!(gc.schedulable_name(), "GarbageCollectorWorker::nightly");
    }
}
