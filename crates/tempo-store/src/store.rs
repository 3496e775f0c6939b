use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tempo_core::{CoreError, TimeQualifier, Timeperiod};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::types::{InsertOutcome, JobRecord, NewUnitOfWork, Transition, UnitOfWork, UowState, UowType};

const UOW_COLUMNS: &str = "id, process_name, timeperiod, start_marker, end_marker, state,
    number_of_failures, uow_type, time_qualifier, created_at, submitted_at, finished_at";

/// Unit-of-work persistence over one SQLite connection.
///
/// Several stores may point at the same database file; every mutation is a
/// single statement or an immediate transaction, so they serialise through
/// SQLite's write lock.
pub struct UowStore {
    db: Mutex<Connection>,
}

impl UowStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a fresh embryo, or report the live record that already holds
    /// the bucket.
    ///
    /// The first record of a bucket gets markers `(0, 0)`; every later one
    /// gets `(0, previous end + 1)` so that terminal history is retained.
    #[instrument(skip(self, new, now), fields(process = %new.process_name, timeperiod = %new.timeperiod))]
    pub fn create(&self, new: &NewUnitOfWork, now: DateTime<Utc>) -> Result<InsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO unit_of_work
             (process_name, timeperiod, start_marker, end_marker, state,
              number_of_failures, uow_type, time_qualifier, created_at)
             SELECT ?1, ?2, 0, COALESCE(MAX(end_marker) + 1, 0), 'state_embryo', 0, ?3, ?4, ?5
             FROM unit_of_work WHERE process_name = ?1 AND timeperiod = ?2",
            params![
                new.process_name,
                new.timeperiod,
                new.uow_type.as_str(),
                new.time_qualifier.map(|q| q.as_str()),
                ts(now),
            ],
        )?;

        let outcome = if inserted == 1 {
            let uow = fetch(&tx, tx.last_insert_rowid())?;
            sync_job(&tx, &uow, now)?;
            info!(uow_id = uow.id, end_marker = uow.end_marker, "unit of work created");
            InsertOutcome::Created(uow)
        } else {
            let existing = live_record(&tx, &new.process_name, &new.timeperiod)?.ok_or_else(|| {
                StoreError::Conflict {
                    process_name: new.process_name.clone(),
                    timeperiod: new.timeperiod.clone(),
                }
            })?;
            debug!(uow_id = existing.id, state = %existing.state, "already scheduled");
            InsertOutcome::AlreadyScheduled(existing)
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn get(&self, id: i64) -> Result<UnitOfWork> {
        let conn = self.conn();
        fetch(&conn, id)
    }

    /// The live (embryo, in_progress or processed) record of a bucket.
    pub fn live(&self, process_name: &str, timeperiod: &str) -> Result<Option<UnitOfWork>> {
        let conn = self.conn();
        live_record(&conn, process_name, timeperiod)
    }

    /// Most recent record of a bucket, live or terminal.
    pub fn latest(&self, process_name: &str, timeperiod: &str) -> Result<Option<UnitOfWork>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {UOW_COLUMNS} FROM unit_of_work
                     WHERE process_name = ?1 AND timeperiod = ?2
                     ORDER BY id DESC LIMIT 1"
                ),
                [process_name, timeperiod],
                row_to_uow,
            )
            .optional()?)
    }

    /// Most recent record of a process across all timeperiods.
    pub fn latest_for_process(&self, process_name: &str) -> Result<Option<UnitOfWork>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {UOW_COLUMNS} FROM unit_of_work
                     WHERE process_name = ?1 ORDER BY id DESC LIMIT 1"
                ),
                [process_name],
                row_to_uow,
            )
            .optional()?)
    }

    /// Every record of a bucket, oldest first.
    pub fn history(&self, process_name: &str, timeperiod: &str) -> Result<Vec<UnitOfWork>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UOW_COLUMNS} FROM unit_of_work
             WHERE process_name = ?1 AND timeperiod = ?2 ORDER BY id"
        ))?;
        let rows = stmt.query_map([process_name, timeperiod], row_to_uow)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Live records of a process, in timeperiod order.
    pub fn live_for_process(&self, process_name: &str) -> Result<Vec<UnitOfWork>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UOW_COLUMNS} FROM unit_of_work
             WHERE process_name = ?1
               AND state IN ('state_embryo', 'state_in_progress', 'state_processed')
             ORDER BY timeperiod, id"
        ))?;
        let rows = stmt.query_map([process_name], row_to_uow)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// In-progress records submitted before `cutoff`.
    pub fn in_progress_submitted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UOW_COLUMNS} FROM unit_of_work
             WHERE state = 'state_in_progress' AND submitted_at < ?1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map([ts(cutoff)], row_to_uow)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Embryo and in-progress records created before `cutoff`.
    pub fn unfinished_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UOW_COLUMNS} FROM unit_of_work
             WHERE state IN ('state_embryo', 'state_in_progress') AND created_at < ?1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map([ts(cutoff)], row_to_uow)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Compare-and-set: move `id` to `to` only if it is currently in one of
    /// `from`. Entering in_progress stamps `submitted_at`; entering a terminal
    /// state stamps `finished_at`.
    #[instrument(skip(self, from, now))]
    pub fn transition(
        &self,
        id: i64,
        from: &[UowState],
        to: UowState,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE unit_of_work
             SET state        = ?1,
                 submitted_at = CASE WHEN ?1 = 'state_in_progress' THEN ?2 ELSE submitted_at END,
                 finished_at  = CASE WHEN ?3 THEN ?2 ELSE finished_at END
             WHERE id = ?4 AND state IN ({allowed})"
        );
        self.apply(&sql, params![to.as_str(), ts(now), to.is_terminal(), id], id, now)
    }

    /// Report a worker failure: in_progress → embryo with the counter bumped
    /// in the same statement.
    #[instrument(skip(self, now))]
    pub fn record_failure(&self, id: i64, now: DateTime<Utc>) -> Result<Transition> {
        self.apply(
            "UPDATE unit_of_work
             SET state = 'state_embryo', number_of_failures = number_of_failures + 1
             WHERE id = ?1 AND state = 'state_in_progress'",
            params![id],
            id,
            now,
        )
    }

    /// Return a live record to embryo with a zeroed failure counter.
    #[instrument(skip(self, now))]
    pub fn reset_to_embryo(&self, id: i64, now: DateTime<Utc>) -> Result<Transition> {
        self.apply(
            "UPDATE unit_of_work
             SET state = 'state_embryo', number_of_failures = 0, submitted_at = NULL
             WHERE id = ?1 AND state IN ('state_embryo', 'state_in_progress', 'state_processed')",
            params![id],
            id,
            now,
        )
    }

    /// Re-stamp `submitted_at` of an in-progress record that is re-sent.
    pub fn touch_submitted(&self, id: i64, now: DateTime<Utc>) -> Result<Transition> {
        self.apply(
            "UPDATE unit_of_work SET submitted_at = ?1
             WHERE id = ?2 AND state = 'state_in_progress'",
            params![ts(now), id],
            id,
            now,
        )
    }

    fn apply(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(sql, params)?;
        let uow = fetch(&tx, id)?;
        if changed > 0 {
            sync_job(&tx, &uow, now)?;
        }
        tx.commit()?;
        if changed > 0 {
            debug!(uow_id = id, state = %uow.state, failures = uow.number_of_failures, "unit of work updated");
            Ok(Transition::Applied(uow))
        } else {
            Ok(Transition::Unchanged(uow))
        }
    }

    /// Job row of one bucket.
    pub fn job(
        &self,
        process_name: &str,
        qualifier: TimeQualifier,
        timeperiod: &Timeperiod,
    ) -> Result<Option<JobRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT process_name, timeperiod, state, related_unit_of_work, number_of_failures
             FROM {} WHERE process_name = ?1 AND timeperiod = ?2",
            qualifier.job_table()
        );
        Ok(conn
            .query_row(&sql, [process_name, timeperiod.as_str()], |r| {
                row_to_job(r, qualifier)
            })
            .optional()?)
    }

    /// Job rows with `from <= timeperiod < to`, ascending.
    pub fn jobs_between(
        &self,
        process_name: &str,
        qualifier: TimeQualifier,
        from: &Timeperiod,
        to: &Timeperiod,
    ) -> Result<Vec<JobRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT process_name, timeperiod, state, related_unit_of_work, number_of_failures
             FROM {} WHERE process_name = ?1 AND timeperiod >= ?2 AND timeperiod < ?3
             ORDER BY timeperiod",
            qualifier.job_table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([process_name, from.as_str(), to.as_str()], |r| {
            row_to_job(r, qualifier)
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Every job row of a process, ascending.
    pub fn jobs(&self, process_name: &str, qualifier: TimeQualifier) -> Result<Vec<JobRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT process_name, timeperiod, state, related_unit_of_work, number_of_failures
             FROM {} WHERE process_name = ?1 ORDER BY timeperiod",
            qualifier.job_table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([process_name], |r| row_to_job(r, qualifier))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Lexicographically greatest bucket with a job row.
    pub fn max_job_timeperiod(
        &self,
        process_name: &str,
        qualifier: TimeQualifier,
    ) -> Result<Option<Timeperiod>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT MAX(timeperiod) FROM {} WHERE process_name = ?1",
            qualifier.job_table()
        );
        let max: Option<String> = conn.query_row(&sql, [process_name], |r| r.get(0))?;
        Ok(max.map(|t| Timeperiod::parse(&t)).transpose()?)
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix, so stored instants
/// sort lexicographically.
fn ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fetch(conn: &Connection, id: i64) -> Result<UnitOfWork> {
    conn.query_row(
        &format!("SELECT {UOW_COLUMNS} FROM unit_of_work WHERE id = ?1"),
        [id],
        row_to_uow,
    )
    .optional()?
    .ok_or(StoreError::NotFound { id })
}

fn live_record(conn: &Connection, process_name: &str, timeperiod: &str) -> Result<Option<UnitOfWork>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {UOW_COLUMNS} FROM unit_of_work
                 WHERE process_name = ?1 AND timeperiod = ?2
                   AND state IN ('state_embryo', 'state_in_progress', 'state_processed')"
            ),
            [process_name, timeperiod],
            row_to_uow,
        )
        .optional()?)
}

/// Mirror a managed record into its job table. An older record never
/// overwrites the row of a newer one.
fn sync_job(conn: &Connection, uow: &UnitOfWork, now: DateTime<Utc>) -> Result<()> {
    let (UowType::Managed, Some(qualifier)) = (uow.uow_type, uow.time_qualifier) else {
        return Ok(());
    };
    let table = qualifier.job_table();
    let sql = format!(
        "INSERT INTO {table}
         (process_name, timeperiod, state, related_unit_of_work, number_of_failures, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(process_name, timeperiod) DO UPDATE SET
            state                = excluded.state,
            related_unit_of_work = excluded.related_unit_of_work,
            number_of_failures   = excluded.number_of_failures,
            updated_at           = excluded.updated_at
         WHERE excluded.related_unit_of_work >= {table}.related_unit_of_work"
    );
    let n = conn.execute(
        &sql,
        params![
            uow.process_name,
            uow.timeperiod,
            uow.state.as_str(),
            uow.id,
            uow.number_of_failures,
            ts(now),
        ],
    )?;
    if n == 0 {
        warn!(uow_id = uow.id, "stale record left job row untouched");
    }
    Ok(())
}

fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: CoreError| conversion_error(idx, e))
}

fn parse_instant(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Map a SQLite row (in `UOW_COLUMNS` order) to a `UnitOfWork`.
fn row_to_uow(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnitOfWork> {
    let time_qualifier: Option<String> = row.get(8)?;
    let time_qualifier = time_qualifier
        .map(|q| q.parse::<TimeQualifier>())
        .transpose()
        .map_err(|e| conversion_error(8, e))?;
    let created_at = parse_instant(row, 9)?.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(9, "created_at".into(), rusqlite::types::Type::Null)
    })?;

    Ok(UnitOfWork {
        id: row.get(0)?,
        process_name: row.get(1)?,
        timeperiod: row.get(2)?,
        start_marker: row.get(3)?,
        end_marker: row.get(4)?,
        state: parse_column(row, 5)?,
        number_of_failures: row.get(6)?,
        uow_type: parse_column(row, 7)?,
        time_qualifier,
        created_at,
        submitted_at: parse_instant(row, 10)?,
        finished_at: parse_instant(row, 11)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>, qualifier: TimeQualifier) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        process_name: row.get(0)?,
        timeperiod: parse_column(row, 1)?,
        time_qualifier: qualifier,
        state: parse_column(row, 2)?,
        related_unit_of_work: row.get(3)?,
        number_of_failures: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;

    fn store() -> UowStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        UowStore::new(conn)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 14, 0, 0).unwrap()
    }

    fn hourly(tp: &str) -> NewUnitOfWork {
        NewUnitOfWork::managed(
            "SiteHourlyAggregator",
            &Timeperiod::parse(tp).unwrap(),
            TimeQualifier::Hourly,
        )
    }

    #[test]
    fn second_live_insert_reports_the_winner() {
        let store = store();
        let first = store.create(&hourly("2024031507"), now()).unwrap();
        assert!(first.is_created());
        let first = first.into_inner();
        assert_eq!((first.start_marker, first.end_marker), (0, 0));
        assert_eq!(first.state, UowState::Embryo);

        match store.create(&hourly("2024031507"), now()).unwrap() {
            InsertOutcome::AlreadyScheduled(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn terminal_history_is_retained_with_fresh_markers() {
        let store = store();
        let first = store.create(&hourly("2024031507"), now()).unwrap().into_inner();
        store
            .transition(first.id, &[UowState::Embryo], UowState::Skipped, now())
            .unwrap();

        let second = store.create(&hourly("2024031507"), now()).unwrap();
        assert!(second.is_created());
        let second = second.into_inner();
        assert_eq!((second.start_marker, second.end_marker), (0, 1));

        let history = store.history("SiteHourlyAggregator", "2024031507").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, UowState::Skipped);
        assert!(history[0].finished_at.is_some());
    }

    #[test]
    fn transitions_are_compare_and_set() {
        let store = store();
        let uow = store.create(&hourly("2024031507"), now()).unwrap().into_inner();

        let miss = store
            .transition(uow.id, &[UowState::InProgress], UowState::Processed, now())
            .unwrap();
        assert!(!miss.applied());
        assert_eq!(miss.record().state, UowState::Embryo);

        let sent = store
            .transition(uow.id, &[UowState::Embryo], UowState::InProgress, now())
            .unwrap();
        assert!(sent.applied());
        assert_eq!(sent.record().submitted_at, Some(now()));

        let failed = store.record_failure(uow.id, now()).unwrap();
        assert!(failed.applied());
        assert_eq!(failed.record().state, UowState::Embryo);
        assert_eq!(failed.record().number_of_failures, 1);

        // a late second failure report finds no in_progress record
        let late = store.record_failure(uow.id, now()).unwrap();
        assert!(!late.applied());
        assert_eq!(late.record().number_of_failures, 1);

        let reset = store.reset_to_embryo(uow.id, now()).unwrap();
        assert_eq!(reset.record().number_of_failures, 0);
    }

    #[test]
    fn job_table_tracks_latest_record() {
        let store = store();
        let uow = store.create(&hourly("2024031507"), now()).unwrap().into_inner();
        store
            .transition(uow.id, &[UowState::Embryo], UowState::InProgress, now())
            .unwrap();
        let _ = store.create(&hourly("2024031508"), now()).unwrap();

        let tp = Timeperiod::parse("2024031507").unwrap();
        let job = store
            .job("SiteHourlyAggregator", TimeQualifier::Hourly, &tp)
            .unwrap()
            .unwrap();
        assert_eq!(job.state, UowState::InProgress);
        assert_eq!(job.related_unit_of_work, uow.id);

        let jobs = store
            .jobs_between(
                "SiteHourlyAggregator",
                TimeQualifier::Hourly,
                &Timeperiod::parse("2024031500").unwrap(),
                &Timeperiod::parse("2024031600").unwrap(),
            )
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            store
                .max_job_timeperiod("SiteHourlyAggregator", TimeQualifier::Hourly)
                .unwrap()
                .unwrap()
                .as_str(),
            "2024031508"
        );
    }

    #[test]
    fn freerun_work_has_no_job_row() {
        let store = store();
        let uow = store
            .create(&NewUnitOfWork::freerun("GarbageCollectorWorker::nightly", "20240315140000"), now())
            .unwrap()
            .into_inner();
        assert_eq!(uow.uow_type, UowType::Freerun);
        assert!(uow.managed_timeperiod().is_none());
        assert!(store
            .latest_for_process("GarbageCollectorWorker::nightly")
            .unwrap()
            .is_some());
    }
}
