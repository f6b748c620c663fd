//! Store trait: the abstract interface for replica persistence.
//!
//! A store hosts any number of databases, each identified by a [`DbId`].
//! Every database has a schema version, a table of cells (the current value
//! and clock of each column of each row), a dense change log addressed by
//! [`Seq`], and a record of how far each remote sender has been applied.
//!
//! Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use tokio::sync::watch;

use rowsync_core::{
    Change, ColumnClock, ColumnValue, ConflictResolver, DbId, SchemaVersion, Seq, DELETE_SENTINEL,
};

use crate::error::Result;

/// A change together with its position in the log that holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedChange {
    pub seq: Seq,
    pub change: Change,
}

/// A write made by the local application.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    pub table: String,
    pub pk: String,
    pub cid: String,
    pub val: ColumnValue,
}

impl LocalWrite {
    /// Set one column of one row.
    pub fn set(
        table: impl Into<String>,
        pk: impl Into<String>,
        cid: impl Into<String>,
        val: impl Into<ColumnValue>,
    ) -> Self {
        Self {
            table: table.into(),
            pk: pk.into(),
            cid: cid.into(),
            val: val.into(),
        }
    }

    /// Delete a whole row.
    pub fn delete(table: impl Into<String>, pk: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            pk: pk.into(),
            cid: DELETE_SENTINEL.to_string(),
            val: ColumnValue::Null,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.cid == DELETE_SENTINEL
    }
}

/// One stored cell, as returned by [`Store::cells`].
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub table: String,
    pub pk: String,
    pub cid: String,
    pub clock: ColumnClock,
}

/// Outcome of applying a batch of remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    /// Changes that won resolution and were written.
    pub applied: usize,
    /// Changes that lost resolution.
    pub ignored: usize,
    /// Local version the winners were logged under, if any won.
    pub db_version: Option<u64>,
    /// Last applied position for the sender after this batch.
    pub last_applied: Option<Seq>,
}

/// The Store trait: async interface for replica persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Atomic batches**: [`Store::apply_changes`] writes every winning change,
///   logs it, and records sender progress in one transaction. A failure
///   leaves the database exactly as it was.
/// - **Dense logs**: every committed transaction takes the next version, so a
///   log holds versions `1..=head` with no holes.
/// - **Terminal deletes**: once a row is deleted, no column write revives it.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Database Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a database if it does not exist.
    ///
    /// An existing database keeps its data; its schema version is updated.
    async fn open_database(&self, dbid: &DbId, schema_version: &SchemaVersion) -> Result<()>;

    /// Whether a database with this id exists.
    async fn has_database(&self, dbid: &DbId) -> Result<bool>;

    /// The schema version of a database.
    async fn schema_version(&self, dbid: &DbId) -> Result<SchemaVersion>;

    /// Position of the newest change in the log, or [`Seq::ZERO`] if empty.
    async fn head(&self, dbid: &DbId) -> Result<Seq>;

    // ─────────────────────────────────────────────────────────────────────────
    // Change Log
    // ─────────────────────────────────────────────────────────────────────────

    /// Logged changes strictly after `since` and at or before `until`, in
    /// log order, at most `limit` of them.
    async fn changes_since(
        &self,
        dbid: &DbId,
        since: Seq,
        until: Seq,
        limit: usize,
    ) -> Result<Vec<LoggedChange>>;

    /// Commit local writes as one transaction under the next version.
    ///
    /// Each write bumps its cell's column version and is attributed to
    /// `dbid`. Returns the logged changes; an empty `writes` commits nothing.
    async fn commit_local(&self, dbid: &DbId, writes: &[LocalWrite]) -> Result<Vec<LoggedChange>>;

    /// Resolve and apply validated remote changes from `from` atomically.
    ///
    /// Each change is resolved with `resolver` against the cell state left
    /// by the changes before it. Winners are written and re-logged under one
    /// new local version.
    /// When `seq_end` is given, the sender's last applied position advances
    /// to it (never backwards).
    async fn apply_changes(
        &self,
        dbid: &DbId,
        from: &DbId,
        changes: &[Change],
        seq_end: Option<Seq>,
        resolver: ConflictResolver,
    ) -> Result<ApplyOutcome>;

    // ─────────────────────────────────────────────────────────────────────────
    // Cell Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// The stored clock of one cell.
    async fn get_cell(
        &self,
        dbid: &DbId,
        table: &str,
        pk: &str,
        cid: &str,
    ) -> Result<Option<ColumnClock>>;

    /// Whether a row has been deleted.
    async fn is_row_deleted(&self, dbid: &DbId, table: &str, pk: &str) -> Result<bool> {
        Ok(self.get_cell(dbid, table, pk, DELETE_SENTINEL).await?.is_some())
    }

    /// Every stored cell, ordered by (table, pk, cid).
    async fn cells(&self, dbid: &DbId) -> Result<Vec<CellRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Peer Progress
    // ─────────────────────────────────────────────────────────────────────────

    /// The last position of `from`'s log applied into `dbid`.
    async fn last_applied(&self, dbid: &DbId, from: &DbId) -> Result<Option<Seq>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Watch the head of a database. The value changes after every commit.
    fn subscribe(&self, dbid: &DbId) -> watch::Receiver<Seq>;
}
