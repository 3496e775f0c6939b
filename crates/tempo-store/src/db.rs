use std::time::Duration;

use rusqlite::Connection;
use tempo_core::TimeQualifier;

use crate::error::Result;

/// How long a writer waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection configured for several concurrent writers: WAL journal
/// and a busy timeout, so contending writers queue instead of failing.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Initialise `unit_of_work` and the four `job_<qualifier>` tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS unit_of_work (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            process_name        TEXT    NOT NULL,
            timeperiod          TEXT    NOT NULL,
            start_marker        INTEGER NOT NULL,
            end_marker          INTEGER NOT NULL,
            state               TEXT    NOT NULL,
            number_of_failures  INTEGER NOT NULL DEFAULT 0,
            uow_type            TEXT    NOT NULL,
            time_qualifier      TEXT,               -- NULL for freerun work
            created_at          TEXT    NOT NULL,
            submitted_at        TEXT,
            finished_at         TEXT,
            UNIQUE (process_name, timeperiod, start_marker, end_marker)
        ) STRICT;

        -- at most one live record per bucket
        CREATE UNIQUE INDEX IF NOT EXISTS idx_uow_live
            ON unit_of_work (process_name, timeperiod)
            WHERE state IN ('state_embryo', 'state_in_progress', 'state_processed');

        CREATE INDEX IF NOT EXISTS idx_uow_state ON unit_of_work (state, submitted_at);
        ",
    )?;

    for qualifier in TimeQualifier::COARSEST_FIRST {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                process_name         TEXT    NOT NULL,
                timeperiod           TEXT    NOT NULL,
                state                TEXT    NOT NULL,
                related_unit_of_work INTEGER NOT NULL,
                number_of_failures   INTEGER NOT NULL DEFAULT 0,
                updated_at           TEXT    NOT NULL,
                PRIMARY KEY (process_name, timeperiod)
            ) STRICT;",
            table = qualifier.job_table()
        ))?;
    }
    Ok(())
}
