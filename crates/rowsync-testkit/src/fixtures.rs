//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use rowsync_core::{Change, ColumnValue, ConflictResolver, DbId, SchemaVersion, Seq};
use rowsync_store::{ApplyOutcome, LocalWrite, LoggedChange, MemoryStore, Store};

/// A deterministic database id.
pub const fn db(n: u8) -> DbId {
    DbId::from_bytes([n; 16])
}

/// Install a test-writer tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// The comparable part of one cell: what every converged replica agrees on.
#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    pub table: String,
    pub pk: String,
    pub cid: String,
    pub val: ColumnValue,
    pub col_version: u64,
}

/// One database in a memory store.
pub struct TestSite {
    pub dbid: DbId,
    pub store: Arc<MemoryStore>,
    resolver: ConflictResolver,
}

impl TestSite {
    /// A site with database `db(n)` at schema version "1".
    pub async fn new(n: u8) -> Self {
        Self::with_schema(n, "1").await
    }

    pub async fn with_schema(n: u8, schema_version: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dbid = db(n);
        store
            .open_database(&dbid, &SchemaVersion::new(schema_version))
            .await
            .expect("open test database");
        Self {
            dbid,
            store,
            resolver: ConflictResolver::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Commit one local column write.
    pub async fn write(
        &self,
        table: &str,
        pk: &str,
        cid: &str,
        val: impl Into<ColumnValue>,
    ) -> Vec<LoggedChange> {
        self.store
            .commit_local(&self.dbid, &[LocalWrite::set(table, pk, cid, val)])
            .await
            .expect("commit local write")
    }

    /// Apply validated changes as if received from `from`.
    pub async fn apply(&self, from: DbId, changes: &[Change]) -> ApplyOutcome {
        self.store
            .apply_changes(&self.dbid, &from, changes, None, self.resolver)
            .await
            .expect("apply changes")
    }

    /// The whole log.
    pub async fn log(&self) -> Vec<LoggedChange> {
        let head = self.store.head(&self.dbid).await.expect("read head");
        self.store
            .changes_since(&self.dbid, Seq::ZERO, head, usize::MAX)
            .await
            .expect("read log")
    }

    /// Every cell, ordered.
    pub async fn snapshot(&self) -> Vec<CellState> {
        self.store
            .cells(&self.dbid)
            .await
            .expect("read cells")
            .into_iter()
            .map(|record| CellState {
                table: record.table,
                pk: record.pk,
                cid: record.cid,
                val: record.clock.val,
                col_version: record.clock.col_version,
            })
            .collect()
    }
}
