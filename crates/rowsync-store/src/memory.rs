//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;

use rowsync_core::{
    Change, ColumnClock, ConflictResolver, DbId, SchemaVersion, Seq, DELETE_SENTINEL,
};

use crate::error::{Result, StoreError};
use crate::notify::CommitNotifier;
use crate::traits::{ApplyOutcome, CellRecord, LocalWrite, LoggedChange, Store};
use crate::txn::{apply_remote, commit_writes, CellTxn};

type CellKey = (String, String, String);

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
/// Writes run against a copy of the database that replaces the original
/// only on success, so a failed batch leaves no trace.
pub struct MemoryStore {
    inner: RwLock<HashMap<DbId, MemoryDb>>,
    notifier: CommitNotifier,
    /// Fail the next apply after this many cell writes.
    fault: Mutex<Option<usize>>,
}

#[derive(Debug, Clone)]
struct MemoryDb {
    schema_version: SchemaVersion,
    cells: BTreeMap<CellKey, ColumnClock>,
    log: BTreeMap<Seq, Change>,
    peers: HashMap<DbId, Seq>,
}

impl MemoryDb {
    fn new(schema_version: SchemaVersion) -> Self {
        Self {
            schema_version,
            cells: BTreeMap::new(),
            log: BTreeMap::new(),
            peers: HashMap::new(),
        }
    }

    fn head(&self) -> Seq {
        self.log.keys().next_back().copied().unwrap_or(Seq::ZERO)
    }
}

struct MemoryTxn<'a> {
    db: &'a mut MemoryDb,
    writes_left: Option<usize>,
    budget: usize,
}

impl CellTxn for MemoryTxn<'_> {
    fn head(&self) -> Result<Seq> {
        Ok(self.db.head())
    }

    fn get_cell(&self, table: &str, pk: &str, cid: &str) -> Result<Option<ColumnClock>> {
        let key = (table.to_string(), pk.to_string(), cid.to_string());
        Ok(self.db.cells.get(&key).cloned())
    }

    fn put_cell(&mut self, table: &str, pk: &str, cid: &str, clock: &ColumnClock) -> Result<()> {
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(StoreError::Injected(self.budget));
            }
            *left -= 1;
        }
        let key = (table.to_string(), pk.to_string(), cid.to_string());
        self.db.cells.insert(key, clock.clone());
        Ok(())
    }

    fn clear_row(&mut self, table: &str, pk: &str) -> Result<()> {
        self.db
            .cells
            .retain(|(t, p, c), _| !(t == table && p == pk && c != DELETE_SENTINEL));
        Ok(())
    }

    fn append_log(&mut self, seq: Seq, change: &Change) -> Result<()> {
        self.db.log.insert(seq, change.clone());
        Ok(())
    }

    fn last_applied(&self, from: &DbId) -> Result<Option<Seq>> {
        Ok(self.db.peers.get(from).copied())
    }

    fn set_last_applied(&mut self, from: &DbId, seq: Seq) -> Result<()> {
        self.db.peers.insert(*from, seq);
        Ok(())
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            notifier: CommitNotifier::new(),
            fault: Mutex::new(None),
        }
    }

    /// Make the next `apply_changes` fail after `writes` cell writes.
    ///
    /// Used to check that a failed batch is rolled back completely.
    pub fn fail_next_apply_after(&self, writes: usize) {
        let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        *fault = Some(writes);
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<DbId, MemoryDb>>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<DbId, MemoryDb>>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    /// Run `f` on a copy of one database and keep the copy only if `f` succeeds.
    fn transact<F, T>(&self, dbid: &DbId, writes_left: Option<usize>, f: F) -> Result<(T, Seq)>
    where
        F: FnOnce(&mut MemoryTxn<'_>) -> Result<T>,
    {
        let mut inner = self.write()?;
        let db = inner.get_mut(dbid).ok_or(StoreError::DatabaseNotFound(*dbid))?;

        let mut scratch = db.clone();
        let mut txn = MemoryTxn {
            db: &mut scratch,
            writes_left,
            budget: writes_left.unwrap_or(0),
        };
        let value = f(&mut txn)?;

        let head = scratch.head();
        *db = scratch;
        Ok((value, head))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_database(&self, dbid: &DbId, schema_version: &SchemaVersion) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .entry(*dbid)
            .and_modify(|db| db.schema_version = schema_version.clone())
            .or_insert_with(|| MemoryDb::new(schema_version.clone()));
        Ok(())
    }

    async fn has_database(&self, dbid: &DbId) -> Result<bool> {
        Ok(self.read()?.contains_key(dbid))
    }

    async fn schema_version(&self, dbid: &DbId) -> Result<SchemaVersion> {
        self.read()?
            .get(dbid)
            .map(|db| db.schema_version.clone())
            .ok_or(StoreError::DatabaseNotFound(*dbid))
    }

    async fn head(&self, dbid: &DbId) -> Result<Seq> {
        self.read()?
            .get(dbid)
            .map(MemoryDb::head)
            .ok_or(StoreError::DatabaseNotFound(*dbid))
    }

    async fn changes_since(
        &self,
        dbid: &DbId,
        since: Seq,
        until: Seq,
        limit: usize,
    ) -> Result<Vec<LoggedChange>> {
        let inner = self.read()?;
        let db = inner.get(dbid).ok_or(StoreError::DatabaseNotFound(*dbid))?;

        if until <= since {
            return Ok(Vec::new());
        }

        Ok(db
            .log
            .range(since..=until)
            .filter(|(seq, _)| **seq > since)
            .take(limit)
            .map(|(seq, change)| LoggedChange {
                seq: *seq,
                change: change.clone(),
            })
            .collect())
    }

    async fn commit_local(&self, dbid: &DbId, writes: &[LocalWrite]) -> Result<Vec<LoggedChange>> {
        let (logged, head) = self.transact(dbid, None, |txn| commit_writes(txn, dbid, writes))?;
        if !logged.is_empty() {
            self.notifier.publish(dbid, head);
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
        let fault = self
            .fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let (outcome, head) =
            self.transact(dbid, fault, |txn| apply_remote(txn, from, changes, seq_end, resolver))?;
        if outcome.db_version.is_some() {
            self.notifier.publish(dbid, head);
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
        let inner = self.read()?;
        let db = inner.get(dbid).ok_or(StoreError::DatabaseNotFound(*dbid))?;
        let key = (table.to_string(), pk.to_string(), cid.to_string());
        Ok(db.cells.get(&key).cloned())
    }

    async fn cells(&self, dbid: &DbId) -> Result<Vec<CellRecord>> {
        let inner = self.read()?;
        let db = inner.get(dbid).ok_or(StoreError::DatabaseNotFound(*dbid))?;
        Ok(db
            .cells
            .iter()
            .map(|((table, pk, cid), clock)| CellRecord {
                table: table.clone(),
                pk: pk.clone(),
                cid: cid.clone(),
                clock: clock.clone(),
            })
            .collect())
    }

    async fn last_applied(&self, dbid: &DbId, from: &DbId) -> Result<Option<Seq>> {
        let inner = self.read()?;
        let db = inner.get(dbid).ok_or(StoreError::DatabaseNotFound(*dbid))?;
        Ok(db.peers.get(from).copied())
    }

    fn subscribe(&self, dbid: &DbId) -> watch::Receiver<Seq> {
        self.notifier.subscribe(dbid)
    }
}
