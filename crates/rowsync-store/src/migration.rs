//! SQLite table layout for the rowsync store.
//!
//! Migrations are numbered SQL batches recorded in `schema_migrations`.
//! Batch N moves the layout from version N-1 to N. A file written by a newer
//! build is refused rather than guessed at.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Layout version this build writes.
pub const CURRENT_VERSION: u32 = 1;

/// Bring the file's layout up to [`CURRENT_VERSION`]. Safe to call on every
/// open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Hosted databases
        CREATE TABLE databases (
            dbid BLOB PRIMARY KEY,            -- 16 bytes
            schema_version TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- Current value and clock of every cell; a row delete is a cell
        -- whose cid is the delete sentinel
        CREATE TABLE cells (
            dbid BLOB NOT NULL,
            tbl TEXT NOT NULL,
            pk TEXT NOT NULL,
            cid TEXT NOT NULL,
            val BLOB,                         -- any storage class, stored as written
            col_version INTEGER NOT NULL,
            db_version INTEGER NOT NULL,      -- local log version of the last write
            site_id BLOB NOT NULL,
            PRIMARY KEY (dbid, tbl, pk, cid)
        );

        -- Dense change log, one entry per winning write
        CREATE TABLE change_log (
            dbid BLOB NOT NULL,
            db_version INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            tbl TEXT NOT NULL,
            pk TEXT NOT NULL,
            cid TEXT NOT NULL,
            val BLOB,                         -- any storage class, stored as written
            col_version INTEGER NOT NULL,
            site_id BLOB NOT NULL,
            PRIMARY KEY (dbid, db_version, seq)
        );

        -- Last position of each sender's log applied into each database
        CREATE TABLE peer_progress (
            dbid BLOB NOT NULL,
            from_dbid BLOB NOT NULL,
            db_version INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (dbid, from_dbid)
        );
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds since Unix epoch.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
