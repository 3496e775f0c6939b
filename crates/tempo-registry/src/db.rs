use rusqlite::Connection;

use crate::error::Result;

/// Initialise the entry, box and reprocessing-queue tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduler_managed_entry (
            process_name        TEXT    NOT NULL PRIMARY KEY,
            time_qualifier      TEXT    NOT NULL,
            state_machine_name  TEXT    NOT NULL,
            blocking_type       TEXT    NOT NULL,
            trigger_frequency   TEXT    NOT NULL,
            is_on               INTEGER NOT NULL DEFAULT 1,
            next_timeperiod     TEXT                -- NULL until the first fire
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduler_freerun_entry (
            process_name        TEXT    NOT NULL,
            entry_name          TEXT    NOT NULL,
            trigger_frequency   TEXT    NOT NULL,
            is_on               INTEGER NOT NULL DEFAULT 1,
            description         TEXT,
            PRIMARY KEY (process_name, entry_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS box_configuration (
            box_id              TEXT    NOT NULL PRIMARY KEY,
            process_list        TEXT    NOT NULL,   -- JSON: name -> {state, pid}
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS reprocessing_queue (
            process_name        TEXT    NOT NULL,
            timeperiod          TEXT    NOT NULL,
            PRIMARY KEY (process_name, timeperiod)
        ) STRICT;
        ",
    )?;
    Ok(())
}
