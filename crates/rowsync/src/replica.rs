//! The Replica: unified API for one rowsync endpoint.
//!
//! A replica owns a store of databases and answers the sync protocol for
//! them. The same type serves as client and server: `serve_connection`
//! answers whatever a peer sends, while `push_to`, `pull_from` and
//! `stream_from` start conversations.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use rowsync_core::{ColumnClock, DbId, QueryId, SchemaVersion, Seq};
use rowsync_store::{CellRecord, LocalWrite, LoggedChange, MemoryStore, SqliteStore, Store};
use rowsync_sync::{
    pull_changes, run_inbound_stream, ApplyChangesMsg, ApplyChangesResponse, ApplyReport,
    ApplyStatus, ChangeReceiver, Connection, ConnectionExt, EstablishOutboundStreamMsg,
    GetChangesMsg, InboundSummary, Msg, PullHandler, PullOutcome, PullResponse, QueryPredicate,
    QueryRegistry, StreamManager, SyncError,
};

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};

/// How many times a push rewinds on `outOfOrder` before giving up.
const MAX_PUSH_REWINDS: usize = 3;

/// Result of pushing a log to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub status: ApplyStatus,
    pub batches: usize,
    pub changes: usize,
    /// Last position the peer accepted.
    pub position: Seq,
}

/// One rowsync endpoint.
///
/// Provides a unified API for:
/// - Creating and opening databases
/// - Committing local writes
/// - Applying, serving and requesting changes
/// - Streaming commits to and from peers
pub struct Replica<S: Store> {
    /// The storage backend.
    store: Arc<S>,
    /// Configuration.
    config: ReplicaConfig,
    queries: Arc<QueryRegistry>,
    receiver: ChangeReceiver<S>,
    pulls: PullHandler<S>,
    streams: StreamManager<S>,
    shutdown: watch::Sender<bool>,
}

impl Replica<SqliteStore> {
    /// Open the SQLite file named by `config`, creating the directory.
    pub fn open(config: ReplicaConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dbs_dir)?;
        let store = SqliteStore::open(config.db_path())?;
        info!(path = %config.db_path().display(), "replica opened");
        Ok(Self::new(store, config))
    }
}

impl Replica<MemoryStore> {
    /// A replica that keeps everything in memory.
    pub fn in_memory(config: ReplicaConfig) -> Self {
        Self::new(MemoryStore::new(), config)
    }
}

impl<S: Store> Replica<S> {
    /// Create a replica over `store`.
    pub fn new(store: S, config: ReplicaConfig) -> Self {
        let store = Arc::new(store);
        let queries = Arc::new(QueryRegistry::new());
        let sync = config.sync.clone();

        Self {
            receiver: ChangeReceiver::new(store.clone(), sync.clone()),
            pulls: PullHandler::new(store.clone(), queries.clone(), sync.clone()),
            streams: StreamManager::new(store.clone(), queries.clone(), sync),
            store,
            config,
            queries,
            shutdown: watch::channel(false).0,
        }
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn streams(&self) -> &StreamManager<S> {
        &self.streams
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Database Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a database with a fresh random id.
    pub async fn create_database(&self, schema_version: &SchemaVersion) -> Result<DbId> {
        let dbid = DbId::random();
        self.store.open_database(&dbid, schema_version).await?;
        debug!(%dbid, %schema_version, "database created");
        Ok(dbid)
    }

    /// Open a database with a known id, creating it if needed.
    pub async fn open_database(&self, dbid: &DbId, schema_version: &SchemaVersion) -> Result<()> {
        Ok(self.store.open_database(dbid, schema_version).await?)
    }

    pub async fn schema_version(&self, dbid: &DbId) -> Result<SchemaVersion> {
        Ok(self.store.schema_version(dbid).await?)
    }

    /// Position of the newest change in a database's log.
    pub async fn head(&self, dbid: &DbId) -> Result<Seq> {
        Ok(self.store.head(dbid).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Commit local writes as one transaction.
    pub async fn write(&self, dbid: &DbId, writes: &[LocalWrite]) -> Result<Vec<LoggedChange>> {
        Ok(self.store.commit_local(dbid, writes).await?)
    }

    pub async fn get_cell(
        &self,
        dbid: &DbId,
        table: &str,
        pk: &str,
        cid: &str,
    ) -> Result<Option<ColumnClock>> {
        Ok(self.store.get_cell(dbid, table, pk, cid).await?)
    }

    pub async fn cells(&self, dbid: &DbId) -> Result<Vec<CellRecord>> {
        Ok(self.store.cells(dbid).await?)
    }

    /// Watch the head of a database.
    pub fn subscribe(&self, dbid: &DbId) -> watch::Receiver<Seq> {
        self.store.subscribe(dbid)
    }

    /// Name a predicate so peers can pull or stream just the matching rows.
    pub fn register_query(&self, dbid: DbId, id: QueryId, predicate: QueryPredicate) {
        self.queries.register(dbid, id, predicate);
    }

    pub fn unregister_query(&self, dbid: &DbId, id: &QueryId) -> bool {
        self.queries.unregister(dbid, id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Protocol Handlers
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a pushed batch.
    pub async fn apply_changes(&self, msg: ApplyChangesMsg) -> Result<ApplyReport> {
        Ok(self.receiver.apply_changes(msg).await?)
    }

    /// Enumerate changes for a pull.
    pub async fn get_changes(&self, msg: &GetChangesMsg) -> Result<PullResponse<S>> {
        Ok(self.pulls.get_changes(msg).await?)
    }

    /// The last position of `from`'s log applied into `to`. This is where an
    /// `outOfOrder` sender resumes.
    pub async fn last_applied(&self, to: &DbId, from: &DbId) -> Result<Option<Seq>> {
        Ok(self.store.last_applied(to, from).await?)
    }

    /// Answer requests on `conn` until the peer closes it or the replica
    /// shuts down.
    ///
    /// A stream request dedicates the connection to that stream. Storage and
    /// validation faults close the connection; the peer resends after
    /// reconnecting.
    pub async fn serve_connection<C: Connection + ?Sized>(&self, conn: &C) -> Result<()> {
        let result = self.dispatch(conn).await;
        conn.close().await;
        if let Err(e) = &result {
            warn!(error = %e, "connection closed on error");
        }
        result
    }

    async fn dispatch<C: Connection + ?Sized>(&self, conn: &C) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let next = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                next = conn.recv_msg() => next?,
            };

            match next {
                None => return Ok(()),
                Some(Msg::ApplyChanges(msg)) => {
                    let report = self.receiver.apply_changes(msg).await?;
                    let mut response = ApplyChangesResponse::new(report.status);
                    if report.status == ApplyStatus::OutOfOrder {
                        response.last_applied = report.last_applied;
                    }
                    conn.send_msg(response).await?;
                }
                Some(Msg::GetChanges(msg)) => {
                    self.pulls.serve(conn, msg).await?;
                }
                Some(Msg::EstablishOutboundStream(msg)) => {
                    self.streams.serve(conn, msg).await?;
                    return Ok(());
                }
                Some(other) => {
                    warn!(tag = ?other.tag(), "unexpected message, ignored");
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Push `local`'s log after `since` into `remote` with `applyChanges`.
    ///
    /// On `outOfOrder` the push rewinds to the peer's last applied position
    /// and resends from there. A schema mismatch ends the push without retry.
    pub async fn push_to<C: Connection + ?Sized>(
        &self,
        conn: &C,
        local: DbId,
        remote: DbId,
        since: Seq,
    ) -> Result<PushOutcome> {
        let schema_version = self.store.schema_version(&local).await?;
        let topology = self.config.sync.topology;
        let mut outcome = PushOutcome {
            status: ApplyStatus::Ok,
            batches: 0,
            changes: 0,
            position: since,
        };
        let mut rewinds = 0;

        loop {
            let head = self.store.head(&local).await?;
            let limit = self.config.sync.stream_batch_size;
            let page = self
                .store
                .changes_since(&local, outcome.position, head, limit)
                .await?;
            let (seq_start, seq_end) = match (page.first(), page.last()) {
                (Some(first), Some(last)) => (first.seq, last.seq),
                _ => return Ok(outcome),
            };

            conn.send_msg(ApplyChangesMsg {
                to_dbid: remote,
                from_dbid: local,
                schema_version: schema_version.clone(),
                seq_start,
                changes: page.iter().map(|c| c.change.to_wire(topology)).collect(),
            })
            .await?;
            let response = self.await_response(conn).await?;

            match response.status {
                ApplyStatus::Ok => {
                    outcome.batches += 1;
                    outcome.changes += page.len();
                    outcome.position = seq_end;
                }
                ApplyStatus::SchemaMismatch => {
                    warn!(%local, %remote, "push refused, schema mismatch");
                    outcome.status = ApplyStatus::SchemaMismatch;
                    return Ok(outcome);
                }
                ApplyStatus::OutOfOrder => {
                    rewinds += 1;
                    if rewinds > MAX_PUSH_REWINDS {
                        return Err(ReplicaError::Rejected {
                            status: ApplyStatus::OutOfOrder,
                        });
                    }
                    let resume = response.last_applied.unwrap_or(Seq::ZERO);
                    warn!(%local, %remote, %seq_start, %resume, "push out of order, rewinding");
                    outcome.position = resume;
                }
            }
        }
    }

    async fn await_response<C: Connection + ?Sized>(
        &self,
        conn: &C,
    ) -> Result<ApplyChangesResponse> {
        let next = timeout(self.config.sync.message_timeout, conn.recv_msg())
            .await
            .map_err(|_| SyncError::Timeout("waiting for applyChangesResponse".into()))??;
        match next {
            Some(Msg::ApplyChangesResponse(response)) => Ok(response),
            Some(other) => Err(SyncError::UnexpectedMessage(format!(
                "{:?} instead of applyChangesResponse",
                other.tag()
            ))
            .into()),
            None => Err(SyncError::Transport("connection closed awaiting response".into()).into()),
        }
    }

    /// Pull `remote`'s changes into `local`, resuming after the last
    /// position applied from it.
    ///
    /// A pull limited to `query_ids` starts from the same position but does
    /// not move it, so a later full pull still delivers the rows it skipped.
    pub async fn pull_from<C: Connection + ?Sized>(
        &self,
        conn: &C,
        local: DbId,
        remote: DbId,
        query_ids: Option<Vec<QueryId>>,
    ) -> Result<PullOutcome> {
        let since = self.store.last_applied(&local, &remote).await?.unwrap_or(Seq::ZERO);
        let msg = GetChangesMsg {
            dbid: remote,
            since,
            schema_version: self.store.schema_version(&local).await?,
            query_ids,
        };
        Ok(pull_changes(&self.receiver, conn, local, msg, &self.config.sync).await?)
    }

    /// Ask the peer to stream `remote`'s commits into `local` and apply them
    /// until the connection drops or this replica shuts down.
    pub async fn stream_from<C: Connection + ?Sized>(
        &self,
        conn: &C,
        local: DbId,
        remote: DbId,
        query_ids: Option<Vec<QueryId>>,
    ) -> Result<InboundSummary> {
        let seq_start = self.store.last_applied(&local, &remote).await?.unwrap_or(Seq::ZERO);
        let msg = EstablishOutboundStreamMsg {
            local_dbid: remote,
            remote_dbid: local,
            seq_start,
            schema_version: self.store.schema_version(&local).await?,
            query_ids,
        };
        info!(%local, %remote, %seq_start, "requesting stream");
        Ok(run_inbound_stream(
            &self.receiver,
            conn,
            msg,
            &self.config.sync,
            self.shutdown.subscribe(),
        )
        .await?)
    }

    /// Stop serving connections and close every stream.
    pub fn shutdown(&self) {
        info!("replica shutting down");
        self.shutdown.send_replace(true);
        self.streams.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::ColumnValue;
    use rowsync_sync::transport::memory::pair;

    fn schema() -> SchemaVersion {
        SchemaVersion::new("1")
    }

    #[tokio::test]
    async fn test_create_and_write() {
        let replica = Replica::in_memory(ReplicaConfig::default());
        let db = replica.create_database(&schema()).await.unwrap();

        replica
            .write(&db, &[LocalWrite::set("todo", "1", "title", "milk")])
            .await
            .unwrap();
        assert_eq!(replica.head(&db).await.unwrap(), Seq(1, 0));

        let cell = replica.get_cell(&db, "todo", "1", "title").await.unwrap().unwrap();
        assert_eq!(cell.val, ColumnValue::Text("milk".into()));
        assert_eq!(cell.site_id, db);
    }

    #[tokio::test]
    async fn test_open_sqlite_replica() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicaConfig::default()
            .with_service_name("todo")
            .with_dbs_dir(dir.path().join("dbs"));

        let db = {
            let replica = Replica::open(config.clone()).unwrap();
            let db = replica.create_database(&schema()).await.unwrap();
            replica
                .write(&db, &[LocalWrite::set("todo", "1", "title", "milk")])
                .await
                .unwrap();
            db
        };

        assert!(dir.path().join("dbs").join("todo.db").exists());
        let reopened = Replica::open(config).unwrap();
        assert_eq!(reopened.head(&db).await.unwrap(), Seq(1, 0));
    }

    #[tokio::test]
    async fn test_push_over_connection() {
        let client = Replica::in_memory(ReplicaConfig::default());
        let server = Arc::new(Replica::in_memory(ReplicaConfig::default()));
        let a = client.create_database(&schema()).await.unwrap();
        let s = server.create_database(&schema()).await.unwrap();

        for i in 0..3 {
            client
                .write(&a, &[LocalWrite::set("todo", i.to_string(), "title", "x")])
                .await
                .unwrap();
        }

        let (client_conn, server_conn) = pair();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(&server_conn).await })
        };

        let outcome = client.push_to(&client_conn, a, s, Seq::ZERO).await.unwrap();
        assert_eq!(outcome.status, ApplyStatus::Ok);
        assert_eq!(outcome.changes, 3);
        assert_eq!(outcome.position, Seq(3, 0));
        assert_eq!(server.last_applied(&s, &a).await.unwrap(), Some(Seq(3, 0)));

        client_conn.close().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_push_rewinds_on_out_of_order() {
        let client = Replica::in_memory(ReplicaConfig::default());
        let server = Arc::new(Replica::in_memory(ReplicaConfig::default()));
        let a = client.create_database(&schema()).await.unwrap();
        let s = server.create_database(&schema()).await.unwrap();
        for i in 0..4 {
            client
                .write(&a, &[LocalWrite::set("todo", i.to_string(), "title", "x")])
                .await
                .unwrap();
        }

        let (client_conn, server_conn) = pair();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(&server_conn).await })
        };

        // The client believes the server already has (2, 0); it has nothing.
        let outcome = client.push_to(&client_conn, a, s, Seq(2, 0)).await.unwrap();
        assert_eq!(outcome.status, ApplyStatus::Ok);
        assert_eq!(outcome.position, Seq(4, 0));
        assert_eq!(server.cells(&s).await.unwrap().len(), 4);

        client_conn.close().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_push_schema_mismatch_stops() {
        let client = Replica::in_memory(ReplicaConfig::default());
        let server = Arc::new(Replica::in_memory(ReplicaConfig::default()));
        let a = client.create_database(&schema()).await.unwrap();
        let s = server.create_database(&SchemaVersion::new("2")).await.unwrap();
        client
            .write(&a, &[LocalWrite::set("todo", "1", "title", "x")])
            .await
            .unwrap();

        let (client_conn, server_conn) = pair();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(&server_conn).await })
        };

        let outcome = client.push_to(&client_conn, a, s, Seq::ZERO).await.unwrap();
        assert_eq!(outcome.status, ApplyStatus::SchemaMismatch);
        assert_eq!(outcome.batches, 0);
        assert!(server.cells(&s).await.unwrap().is_empty());

        client_conn.close().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_serving() {
        let server = Arc::new(Replica::in_memory(ReplicaConfig::default()));
        let (_client_conn, server_conn) = pair();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(&server_conn).await })
        };

        server.shutdown();
        serving.await.unwrap().unwrap();
    }
}
