//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking. Every write runs inside one
//! SQLite transaction, so a failed batch rolls back completely.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;

use rowsync_core::{
    Change, ColumnClock, ColumnValue, ConflictResolver, DbId, SchemaVersion, Seq,
    DELETE_SENTINEL,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::notify::CommitNotifier;
use crate::traits::{ApplyOutcome, CellRecord, LocalWrite, LoggedChange, Store};
use crate::txn::{apply_remote, commit_writes, CellTxn};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    notifier: CommitNotifier,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier: CommitNotifier::new(),
        }
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

fn value_to_sql(val: &ColumnValue) -> Value {
    match val {
        ColumnValue::Null => Value::Null,
        ColumnValue::Integer(i) => Value::Integer(*i),
        ColumnValue::Real(r) => Value::Real(*r),
        ColumnValue::Text(t) => Value::Text(t.clone()),
        ColumnValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn value_from_sql(val: Value) -> ColumnValue {
    match val {
        Value::Null => ColumnValue::Null,
        Value::Integer(i) => ColumnValue::Integer(i),
        Value::Real(r) => ColumnValue::Real(r),
        Value::Text(t) => ColumnValue::Text(t),
        Value::Blob(b) => ColumnValue::Blob(b),
    }
}

fn dbid_from_sql(bytes: &[u8]) -> Result<DbId> {
    DbId::try_from(bytes).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn seq_from_sql(version: i64, local: i64) -> Result<Seq> {
    let local = u32::try_from(local)
        .map_err(|_| StoreError::InvalidData(format!("local seq out of range: {}", local)))?;
    Ok(Seq::new(version as u64, local))
}

fn ensure_db(conn: &Connection, dbid: &DbId) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM databases WHERE dbid = ?1",
            params![dbid.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    exists
        .map(|_| ())
        .ok_or(StoreError::DatabaseNotFound(*dbid))
}

fn read_head(conn: &Connection, dbid: &DbId) -> Result<Seq> {
    let head: Option<(i64, i64)> = conn
        .query_row(
            "SELECT db_version, seq FROM change_log WHERE dbid = ?1
             ORDER BY db_version DESC, seq DESC LIMIT 1",
            params![dbid.as_bytes().as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match head {
        Some((version, local)) => seq_from_sql(version, local),
        None => Ok(Seq::ZERO),
    }
}

fn read_cell(
    conn: &Connection,
    dbid: &DbId,
    table: &str,
    pk: &str,
    cid: &str,
) -> Result<Option<ColumnClock>> {
    let row: Option<(Value, i64, i64, Vec<u8>)> = conn
        .query_row(
            "SELECT val, col_version, db_version, site_id FROM cells
             WHERE dbid = ?1 AND tbl = ?2 AND pk = ?3 AND cid = ?4",
            params![dbid.as_bytes().as_slice(), table, pk, cid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    row.map(|(val, col_version, db_version, site)| {
        Ok(ColumnClock {
            val: value_from_sql(val),
            col_version: col_version as u64,
            db_version: db_version as u64,
            site_id: dbid_from_sql(&site)?,
        })
    })
    .transpose()
}

fn read_last_applied(conn: &Connection, dbid: &DbId, from: &DbId) -> Result<Option<Seq>> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT db_version, seq FROM peer_progress WHERE dbid = ?1 AND from_dbid = ?2",
            params![dbid.as_bytes().as_slice(), from.as_bytes().as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(version, local)| seq_from_sql(version, local)).transpose()
}

/// One database inside an open SQLite transaction.
struct SqliteTxn<'a> {
    conn: &'a Connection,
    dbid: DbId,
}

impl CellTxn for SqliteTxn<'_> {
    fn head(&self) -> Result<Seq> {
        read_head(self.conn, &self.dbid)
    }

    fn get_cell(&self, table: &str, pk: &str, cid: &str) -> Result<Option<ColumnClock>> {
        read_cell(self.conn, &self.dbid, table, pk, cid)
    }

    fn put_cell(&mut self, table: &str, pk: &str, cid: &str, clock: &ColumnClock) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cells (dbid, tbl, pk, cid, val, col_version, db_version, site_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (dbid, tbl, pk, cid) DO UPDATE SET
                val = excluded.val,
                col_version = excluded.col_version,
                db_version = excluded.db_version,
                site_id = excluded.site_id",
            params![
                self.dbid.as_bytes().as_slice(),
                table,
                pk,
                cid,
                value_to_sql(&clock.val),
                clock.col_version as i64,
                clock.db_version as i64,
                clock.site_id.as_bytes().as_slice(),
            ],
        )?;
        Ok(())
    }

    fn clear_row(&mut self, table: &str, pk: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM cells WHERE dbid = ?1 AND tbl = ?2 AND pk = ?3 AND cid != ?4",
            params![self.dbid.as_bytes().as_slice(), table, pk, DELETE_SENTINEL],
        )?;
        Ok(())
    }

    fn append_log(&mut self, seq: Seq, change: &Change) -> Result<()> {
        self.conn.execute(
            "INSERT INTO change_log (dbid, db_version, seq, tbl, pk, cid, val, col_version, site_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.dbid.as_bytes().as_slice(),
                seq.db_version() as i64,
                seq.local_seq() as i64,
                change.table,
                change.pk,
                change.cid,
                value_to_sql(&change.val),
                change.col_version as i64,
                change.site_id.as_bytes().as_slice(),
            ],
        )?;
        Ok(())
    }

    fn last_applied(&self, from: &DbId) -> Result<Option<Seq>> {
        read_last_applied(self.conn, &self.dbid, from)
    }

    fn set_last_applied(&mut self, from: &DbId, seq: Seq) -> Result<()> {
        self.conn.execute(
            "INSERT INTO peer_progress (dbid, from_dbid, db_version, seq, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (dbid, from_dbid) DO UPDATE SET
                db_version = excluded.db_version,
                seq = excluded.seq,
                updated_at = excluded.updated_at",
            params![
                self.dbid.as_bytes().as_slice(),
                from.as_bytes().as_slice(),
                seq.db_version() as i64,
                seq.local_seq() as i64,
                now_millis(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn open_database(&self, dbid: &DbId, schema_version: &SchemaVersion) -> Result<()> {
        let dbid = *dbid;
        let schema_version = schema_version.clone();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO databases (dbid, schema_version, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (dbid) DO UPDATE SET schema_version = excluded.schema_version",
                params![dbid.as_bytes().as_slice(), schema_version.as_str(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn has_database(&self, dbid: &DbId) -> Result<bool> {
        let dbid = *dbid;
        self.blocking(move |conn| match ensure_db(conn, &dbid) {
            Ok(()) => Ok(true),
            Err(StoreError::DatabaseNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn schema_version(&self, dbid: &DbId) -> Result<SchemaVersion> {
        let dbid = *dbid;
        self.blocking(move |conn| {
            let version: Option<String> = conn
                .query_row(
                    "SELECT schema_version FROM databases WHERE dbid = ?1",
                    params![dbid.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            version
                .map(SchemaVersion::new)
                .ok_or(StoreError::DatabaseNotFound(dbid))
        })
        .await
    }

    async fn head(&self, dbid: &DbId) -> Result<Seq> {
        let dbid = *dbid;
        self.blocking(move |conn| {
            ensure_db(conn, &dbid)?;
            read_head(conn, &dbid)
        })
        .await
    }

    async fn changes_since(
        &self,
        dbid: &DbId,
        since: Seq,
        until: Seq,
        limit: usize,
    ) -> Result<Vec<LoggedChange>> {
        let dbid = *dbid;
        self.blocking(move |conn| {
            ensure_db(conn, &dbid)?;

            let mut stmt = conn.prepare(
                "SELECT db_version, seq, tbl, pk, cid, val, col_version, site_id
                 FROM change_log
                 WHERE dbid = ?1
                   AND (db_version > ?2 OR (db_version = ?2 AND seq > ?3))
                   AND (db_version < ?4 OR (db_version = ?4 AND seq <= ?5))
                 ORDER BY db_version, seq
                 LIMIT ?6",
            )?;

            let rows = stmt.query_map(
                params![
                    dbid.as_bytes().as_slice(),
                    since.db_version() as i64,
                    since.local_seq() as i64,
                    until.db_version().min(i64::MAX as u64) as i64,
                    until.local_seq() as i64,
                    limit.min(i64::MAX as usize) as i64,
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Value>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Vec<u8>>(7)?,
                    ))
                },
            )?;

            let mut changes = Vec::new();
            for row in rows {
                let (version, local, table, pk, cid, val, col_version, site) = row?;
                let seq = seq_from_sql(version, local)?;
                changes.push(LoggedChange {
                    seq,
                    change: Change {
                        table,
                        pk,
                        cid,
                        val: value_from_sql(val),
                        col_version: col_version as u64,
                        db_version: seq.db_version(),
                        site_id: dbid_from_sql(&site)?,
                    },
                });
            }
            Ok(changes)
        })
        .await
    }

    async fn commit_local(&self, dbid: &DbId, writes: &[LocalWrite]) -> Result<Vec<LoggedChange>> {
        let dbid = *dbid;
        let writes = writes.to_vec();

        let (logged, head) = self
            .blocking(move |conn| {
                ensure_db(conn, &dbid)?;
                let tx = conn.transaction()?;
                let mut txn = SqliteTxn { conn: &tx, dbid };
                let logged = commit_writes(&mut txn, &dbid, &writes)?;
                let head = txn.head()?;
                tx.commit()?;
                Ok((logged, head))
            })
            .await?;

        if !logged.is_empty() {
            self.notifier.publish(&dbid, head);
        }
        Ok(logged)
    }

    async fn apply_changes(
        &self,
        dbid: &DbId,
        from: &DbId,
        changes: &[Change],
        seq_end: Option<Seq>,
        resolver: ConflictResolver,
    ) -> Result<ApplyOutcome> {
        let dbid = *dbid;
        let from = *from;
        let changes = changes.to_vec();

        let (outcome, head) = self
            .blocking(move |conn| {
                ensure_db(conn, &dbid)?;
                let tx = conn.transaction()?;
                let mut txn = SqliteTxn { conn: &tx, dbid };
                let outcome = apply_remote(&mut txn, &from, &changes, seq_end, resolver)?;
                let head = txn.head()?;
                tx.commit()?;
                Ok((outcome, head))
            })
            .await?;

        if outcome.db_version.is_some() {
            self.notifier.publish(&dbid, head);
        }
        Ok(outcome)
    }

    async fn get_cell(
        &self,
        dbid: &DbId,
        table: &str,
        pk: &str,
        cid: &str,
    ) -> Result<Option<ColumnClock>> {
        let dbid = *dbid;
        let (table, pk, cid) = (table.to_string(), pk.to_string(), cid.to_string());
        self.blocking(move |conn| {
            ensure_db(conn, &dbid)?;
            read_cell(conn, &dbid, &table, &pk, &cid)
        })
        .await
    }

    async fn cells(&self, dbid: &DbId) -> Result<Vec<CellRecord>> {
        let dbid = *dbid;
        self.blocking(move |conn| {
            ensure_db(conn, &dbid)?;

            let mut stmt = conn.prepare(
                "SELECT tbl, pk, cid, val, col_version, db_version, site_id FROM cells
                 WHERE dbid = ?1 ORDER BY tbl, pk, cid",
            )?;
            let rows = stmt.query_map(params![dbid.as_bytes().as_slice()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Value>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                ))
            })?;

            let mut cells = Vec::new();
            for row in rows {
                let (table, pk, cid, val, col_version, db_version, site) = row?;
                cells.push(CellRecord {
                    table,
                    pk,
                    cid,
                    clock: ColumnClock {
                        val: value_from_sql(val),
                        col_version: col_version as u64,
                        db_version: db_version as u64,
                        site_id: dbid_from_sql(&site)?,
                    },
                });
            }
            Ok(cells)
        })
        .await
    }

    async fn last_applied(&self, dbid: &DbId, from: &DbId) -> Result<Option<Seq>> {
        let (dbid, from) = (*dbid, *from);
        self.blocking(move |conn| {
            ensure_db(conn, &dbid)?;
            read_last_applied(conn, &dbid, &from)
        })
        .await
    }

    fn subscribe(&self, dbid: &DbId) -> watch::Receiver<Seq> {
        self.notifier.subscribe(dbid)
    }
}
