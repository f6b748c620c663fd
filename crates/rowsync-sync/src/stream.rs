//! Outbound change streams.
//!
//! An initiator sends `establishOutboundStream` naming a database on the
//! accepter and the position it has applied up to. After the schema gate the
//! accepter answers `applyChangesResponse{ok}` and then pushes every change
//! committed to that database as `receiveStreamingChanges` batches, in log
//! order, until the connection drops or the manager shuts down.
//!
//! ```text
//! initiator                                accepter
//!     | establishOutboundStream(seqStart) ---> |  Handshaking
//!     | <--- applyChangesResponse(ok)          |  Open
//!     | <--- receiveStreamingChanges           |
//!     | ackChanges(seqEnd) --->                |  trims the window
//!     | <--- receiveStreamingChanges           |
//!     |               ...                      |
//! ```
//!
//! At most `max_unacked_batches` batches are in flight. A sender whose
//! window stays full for `ack_timeout` gives up with [`SyncError::Timeout`],
//! and the initiator reconnects from its last applied position.
//!
//! Deliveries skip changes that originated at the stream's remote database,
//! so receivers apply them with [`OrderingCheck::Relaxed`]. Streams limited
//! to queries also skip rows outside them; those are applied with
//! [`OrderingCheck::Filtered`] and never move the last applied position.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use rowsync_core::{batch_positions, DbId, SchemaCheck, SchemaGate, SchemaVersion, Seq};
use rowsync_store::{LoggedChange, Store};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::messages::{
    AckChangesMsg, ApplyChangesResponse, ApplyStatus, EstablishOutboundStreamMsg, Msg,
};
use crate::pull::to_streaming_msg;
use crate::query::{QueryFilter, QueryRegistry};
use crate::receiver::{ChangeReceiver, InboundBatch, OrderingCheck};
use crate::transport::{Connection, ConnectionExt};

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    /// Reserved for inbound stream negotiation. Never entered.
    Negotiating,
    Handshaking,
    Open,
}

/// The database pair a stream serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// The accepter's database whose changes are streamed.
    pub local: DbId,
    /// The initiator's database receiving them.
    pub remote: DbId,
}

/// Sender-side state of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    key: StreamKey,
    schema_version: SchemaVersion,
    state: StreamState,
    /// Last log position read, delivered or skipped.
    cursor: Seq,
    /// Last position acknowledged by the receiver.
    acked: Seq,
    /// End of every delivered batch not yet acknowledged.
    unacked: VecDeque<Seq>,
}

impl StreamSession {
    pub fn new(key: StreamKey, schema_version: SchemaVersion, seq_start: Seq) -> Self {
        Self {
            key,
            schema_version,
            state: StreamState::Handshaking,
            cursor: seq_start,
            acked: seq_start,
            unacked: VecDeque::new(),
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn schema_version(&self) -> &SchemaVersion {
        &self.schema_version
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn cursor(&self) -> Seq {
        self.cursor
    }

    pub fn acked(&self) -> Seq {
        self.acked
    }

    /// Where a new stream for the same pair should start.
    pub fn resume_point(&self) -> Seq {
        self.acked
    }

    /// Batches delivered but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn open(&mut self) {
        if self.state == StreamState::Handshaking {
            self.state = StreamState::Open;
        }
    }

    /// Move the cursor past a page, recording the end of the batch sent
    /// from it, if any.
    pub fn advance(&mut self, read_to: Seq, sent_end: Option<Seq>) {
        self.cursor = self.cursor.max(read_to);
        if let Some(end) = sent_end {
            self.unacked.push_back(end);
        }
    }

    /// Record an ack. Returns `false` for acks at or before the current
    /// one, or beyond anything read.
    pub fn ack(&mut self, seq_end: Seq) -> bool {
        if seq_end <= self.acked || seq_end > self.cursor {
            return false;
        }
        self.acked = seq_end;
        while self.unacked.front().is_some_and(|end| *end <= seq_end) {
            self.unacked.pop_front();
        }
        true
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
        self.unacked.clear();
    }
}

/// Why a served stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The initiator closed the connection.
    PeerClosed,
    /// [`StreamManager::shutdown`] was called.
    Shutdown,
    /// One side answered with a non-ok status.
    Rejected,
}

/// Result of serving one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub status: ApplyStatus,
    pub closed_by: CloseReason,
    pub batches: usize,
    pub changes: usize,
    /// Last acknowledged position.
    pub acked: Seq,
}

struct SessionEntry {
    generation: u64,
    session: StreamSession,
}

type SessionMap = Mutex<HashMap<StreamKey, SessionEntry>>;

/// Removes a session when its serving task ends, unless a newer stream for
/// the same pair has replaced it.
struct SessionGuard<'a> {
    sessions: &'a SessionMap,
    key: StreamKey,
    generation: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            sessions.remove(&self.key);
        }
    }
}

/// Serves outbound streams for the databases of one store.
pub struct StreamManager<S: Store> {
    store: Arc<S>,
    queries: Arc<QueryRegistry>,
    config: SyncConfig,
    sessions: SessionMap,
    next_generation: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl<S: Store> StreamManager<S> {
    pub fn new(store: Arc<S>, queries: Arc<QueryRegistry>, config: SyncConfig) -> Self {
        Self {
            store,
            queries,
            config,
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            shutdown: watch::channel(false).0,
        }
    }

    /// Snapshot of one live session.
    pub fn session(&self, local: DbId, remote: DbId) -> Option<StreamSession> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(&StreamKey { local, remote })
            .map(|entry| entry.session.clone())
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<StreamSession> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().map(|entry| entry.session.clone()).collect()
    }

    /// Close every stream. Streams established afterwards close immediately.
    pub fn shutdown(&self) {
        info!("stream manager shutting down");
        self.shutdown.send_replace(true);
    }

    /// Serve one stream on `conn` until it ends.
    ///
    /// A newer stream for the same database pair supersedes this one, which
    /// then ends with [`SyncError::Cancelled`]. The connection is closed on
    /// every exit.
    pub async fn serve<C: Connection + ?Sized>(
        &self,
        conn: &C,
        msg: EstablishOutboundStreamMsg,
    ) -> Result<StreamSummary> {
        let key = StreamKey {
            local: msg.local_dbid,
            remote: msg.remote_dbid,
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.insert(
                key,
                SessionEntry {
                    generation,
                    session: StreamSession::new(key, msg.schema_version.clone(), msg.seq_start),
                },
            );
        }
        let _guard = SessionGuard {
            sessions: &self.sessions,
            key,
            generation,
        };

        let result = self.run(conn, &msg, key, generation).await;
        conn.close().await;
        let _ = self.with_session(key, generation, StreamSession::close);

        match &result {
            Ok(summary) => info!(
                local = %key.local,
                remote = %key.remote,
                closed_by = ?summary.closed_by,
                acked = %summary.acked,
                batches = summary.batches,
                "stream closed"
            ),
            Err(e) => warn!(local = %key.local, remote = %key.remote, error = %e, "stream failed"),
        }
        result
    }

    async fn run<C: Connection + ?Sized>(
        &self,
        conn: &C,
        msg: &EstablishOutboundStreamMsg,
        key: StreamKey,
        generation: u64,
    ) -> Result<StreamSummary> {
        let mut summary = StreamSummary {
            status: ApplyStatus::Ok,
            closed_by: CloseReason::PeerClosed,
            batches: 0,
            changes: 0,
            acked: msg.seq_start,
        };

        // Handshaking
        let local_schema = self.store.schema_version(&key.local).await?;
        if let SchemaCheck::Mismatch { requested, local } =
            SchemaGate::check(&msg.schema_version, &local_schema)
        {
            warn!(%requested, %local, remote = %key.remote, "schema mismatch, stream refused");
            conn.send_msg(ApplyChangesResponse::new(ApplyStatus::SchemaMismatch))
                .await?;
            summary.status = ApplyStatus::SchemaMismatch;
            summary.closed_by = CloseReason::Rejected;
            return Ok(summary);
        }
        let filter = self
            .queries
            .resolve(&key.local, msg.query_ids.as_deref())?;

        let mut commits = self.store.subscribe(&key.local);
        let mut shutdown = self.shutdown.subscribe();
        conn.send_msg(ApplyChangesResponse::new(ApplyStatus::Ok))
            .await?;
        self.with_session(key, generation, StreamSession::open)?;
        info!(
            local = %key.local,
            remote = %key.remote,
            seq_start = %msg.seq_start,
            "stream open"
        );

        // Open
        let mut full_since: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                summary.closed_by = CloseReason::Shutdown;
                break;
            }

            let window_full = self
                .deliver(conn, key, generation, filter.as_ref(), &mut summary)
                .await?;
            if window_full {
                full_since.get_or_insert_with(Instant::now);
            } else {
                full_since = None;
            }
            let ack_deadline = full_since.map(|since| since + self.config.ack_timeout);

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    summary.closed_by = CloseReason::Shutdown;
                    break;
                }

                incoming = conn.recv_msg() => match incoming? {
                    Some(Msg::AckChanges(ack)) => {
                        if self.with_session(key, generation, |s| s.ack(ack.seq_end))? {
                            summary.acked = ack.seq_end;
                            full_since = None;
                        } else {
                            debug!(remote = %key.remote, seq_end = %ack.seq_end, "ack ignored");
                        }
                    }
                    Some(Msg::ApplyChangesResponse(response)) if !response.status.is_ok() => {
                        warn!(remote = %key.remote, status = ?response.status, "receiver rejected stream");
                        summary.status = response.status;
                        summary.closed_by = CloseReason::Rejected;
                        break;
                    }
                    Some(other) => {
                        warn!(remote = %key.remote, tag = ?other.tag(), "unexpected message on stream");
                    }
                    None => {
                        summary.closed_by = CloseReason::PeerClosed;
                        break;
                    }
                },

                changed = commits.changed(), if !window_full => {
                    if changed.is_err() {
                        break;
                    }
                    sleep(self.config.notify_latency).await;
                    commits.borrow_and_update();
                }

                _ = sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    return Err(SyncError::Timeout(format!(
                        "no ack from {} within {:?}",
                        key.remote, self.config.ack_timeout
                    )));
                }
            }
        }

        Ok(summary)
    }

    /// Send batches until caught up with the head or the window is full.
    /// Returns whether the window is full.
    async fn deliver<C: Connection + ?Sized>(
        &self,
        conn: &C,
        key: StreamKey,
        generation: u64,
        filter: Option<&QueryFilter>,
        summary: &mut StreamSummary,
    ) -> Result<bool> {
        loop {
            let (cursor, in_flight) =
                self.with_session(key, generation, |s| (s.cursor(), s.in_flight()))?;
            if in_flight >= self.config.max_unacked_batches {
                return Ok(true);
            }

            let head = self.store.head(&key.local).await?;
            if cursor >= head {
                return Ok(false);
            }
            let page = self
                .store
                .changes_since(&key.local, cursor, head, self.config.stream_batch_size)
                .await?;
            let read_to = match page.last() {
                Some(last) => last.seq,
                None => return Ok(false),
            };

            // Echoes of the remote's own changes are never sent back.
            let batch: Vec<LoggedChange> = page
                .into_iter()
                .filter(|c| c.change.site_id != key.remote)
                .filter(|c| filter.map_or(true, |f| f.matches(&c.change)))
                .collect();

            let sent_end = if batch.is_empty() {
                None
            } else {
                let msg = to_streaming_msg(&batch, self.config.topology);
                // The receiver acks the end it reconstructs from the batch,
                // which differs from the log position when changes were skipped.
                let versions = batch.iter().map(|c| c.change.db_version);
                let end = batch_positions(msg.seq_start, versions)?.last().copied();
                debug!(
                    remote = %key.remote,
                    seq_start = %msg.seq_start,
                    changes = batch.len(),
                    "stream batch"
                );
                conn.send_msg(msg).await?;
                summary.batches += 1;
                summary.changes += batch.len();
                end
            };

            self.with_session(key, generation, |s| s.advance(read_to, sent_end))?;
        }
    }

    fn with_session<R>(
        &self,
        key: StreamKey,
        generation: u64,
        f: impl FnOnce(&mut StreamSession) -> R,
    ) -> Result<R> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(&key) {
            Some(entry) if entry.generation == generation => Ok(f(&mut entry.session)),
            _ => Err(SyncError::Cancelled),
        }
    }
}

/// Initiator-side result of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSummary {
    pub status: ApplyStatus,
    pub batches: usize,
    pub applied: usize,
    pub ignored: usize,
    /// Last position acknowledged to the accepter.
    pub last_acked: Option<Seq>,
}

/// Establish a stream and apply what it delivers until `stop` is set.
///
/// Changes are applied into `msg.remote_dbid`, attributed to
/// `msg.local_dbid`, and acknowledged batch by batch. Losing the connection
/// is a [`SyncError::Transport`] error; reconnect with `seq_start` set to
/// the last applied position to resume.
pub async fn run_inbound_stream<S, C>(
    receiver: &ChangeReceiver<S>,
    conn: &C,
    msg: EstablishOutboundStreamMsg,
    config: &SyncConfig,
    stop: watch::Receiver<bool>,
) -> Result<InboundSummary>
where
    S: Store,
    C: Connection + ?Sized,
{
    let result = receive_stream(receiver, conn, msg, config, stop).await;
    conn.close().await;
    result
}

async fn receive_stream<S, C>(
    receiver: &ChangeReceiver<S>,
    conn: &C,
    msg: EstablishOutboundStreamMsg,
    config: &SyncConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<InboundSummary>
where
    S: Store,
    C: Connection + ?Sized,
{
    let to = msg.remote_dbid;
    let from = msg.local_dbid;
    let schema_version = msg.schema_version.clone();
    let ordering = if msg.query_ids.is_some() {
        OrderingCheck::Filtered
    } else {
        OrderingCheck::Relaxed
    };
    conn.send_msg(msg).await?;

    let mut summary = InboundSummary {
        status: ApplyStatus::Ok,
        batches: 0,
        applied: 0,
        ignored: 0,
        last_acked: None,
    };

    let handshake = timeout(config.message_timeout, conn.recv_msg())
        .await
        .map_err(|_| SyncError::Timeout("waiting for stream handshake".into()))??;
    match handshake {
        Some(Msg::ApplyChangesResponse(response)) if response.status.is_ok() => {
            debug!(%to, %from, "stream established");
        }
        Some(Msg::ApplyChangesResponse(response)) => {
            warn!(%to, %from, status = ?response.status, "stream refused");
            summary.status = response.status;
            return Ok(summary);
        }
        Some(other) => {
            return Err(SyncError::UnexpectedMessage(format!(
                "{:?} during stream handshake",
                other.tag()
            )))
        }
        None => return Err(SyncError::Transport("connection closed during handshake".into())),
    }

    loop {
        if *stop.borrow() {
            return Ok(summary);
        }

        let next = tokio::select! {
            _ = stop.changed() => return Ok(summary),
            next = conn.recv_msg() => next?,
        };

        let batch = match next {
            Some(Msg::ReceiveStreamingChanges(m)) if m.changes.is_empty() => continue,
            Some(Msg::ReceiveStreamingChanges(m)) => m,
            Some(other) => {
                warn!(%to, %from, tag = ?other.tag(), "unexpected message on stream");
                continue;
            }
            None => return Err(SyncError::Transport("stream closed by peer".into())),
        };

        let report = receiver
            .apply_batch(
                InboundBatch {
                    to,
                    from,
                    schema_version: schema_version.clone(),
                    seq_start: batch.seq_start,
                    changes: batch.changes,
                },
                ordering,
            )
            .await?;

        if !report.status.is_ok() {
            conn.send_msg(ApplyChangesResponse::new(report.status)).await?;
            summary.status = report.status;
            return Ok(summary);
        }

        summary.batches += 1;
        summary.applied += report.applied;
        summary.ignored += report.ignored;
        if let Some(seq_end) = report.batch_end {
            conn.send_msg(AckChangesMsg { seq_end }).await?;
            summary.last_acked = Some(seq_end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::query::QueryPredicate;
    use crate::transport::memory::{pair, MemoryConnection};
    use rowsync_core::{ColumnValue, WireChange};
    use rowsync_store::{LocalWrite, MemoryStore};

    const L: DbId = DbId::from_bytes([1; 16]);
    const R: DbId = DbId::from_bytes([2; 16]);

    fn key() -> StreamKey {
        StreamKey {
            local: L,
            remote: R,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default().with_notify_latency(Duration::from_millis(1))
    }

    fn establish(seq_start: Seq) -> EstablishOutboundStreamMsg {
        EstablishOutboundStreamMsg {
            local_dbid: L,
            remote_dbid: R,
            seq_start,
            schema_version: "1".into(),
            query_ids: None,
        }
    }

    async fn holder() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.open_database(&L, &"1".into()).await.unwrap();
        store
    }

    async fn write(store: &MemoryStore, pk: &str, val: &str) {
        store
            .commit_local(&L, &[LocalWrite::set("todo", pk, "title", val)])
            .await
            .unwrap();
    }

    fn spawn_serve(
        manager: &Arc<StreamManager<MemoryStore>>,
        conn: MemoryConnection,
        msg: EstablishOutboundStreamMsg,
    ) -> tokio::task::JoinHandle<Result<StreamSummary>> {
        let manager = manager.clone();
        tokio::spawn(async move { manager.serve(&conn, msg).await })
    }

    async fn expect_ok_handshake(conn: &MemoryConnection) {
        match conn.recv_msg().await.unwrap() {
            Some(Msg::ApplyChangesResponse(r)) => assert_eq!(r.status, ApplyStatus::Ok),
            other => panic!("expected handshake response, got {:?}", other),
        }
    }

    async fn expect_batch(conn: &MemoryConnection) -> crate::messages::ReceiveStreamingChangesMsg {
        match conn.recv_msg().await.unwrap() {
            Some(Msg::ReceiveStreamingChanges(m)) => m,
            other => panic!("expected batch, got {:?}", other),
        }
    }

    fn pks(changes: &[WireChange]) -> Vec<String> {
        changes
            .iter()
            .map(|c| match c {
                WireChange::ClientServer(c) => c.pk.clone(),
                WireChange::Peer(c) => c.pk.clone(),
            })
            .collect()
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = StreamSession::new(key(), "1".into(), Seq::ZERO);
        assert_eq!(session.state(), StreamState::Handshaking);
        session.open();
        assert_eq!(session.state(), StreamState::Open);

        session.advance(Seq(2, 0), Some(Seq(1, 0)));
        session.advance(Seq(4, 0), Some(Seq(4, 0)));
        assert_eq!(session.in_flight(), 2);

        assert!(session.ack(Seq(1, 0)));
        assert_eq!(session.in_flight(), 1);
        assert_eq!(session.resume_point(), Seq(1, 0));

        session.close();
        assert_eq!(session.state(), StreamState::Closed);
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn test_session_ignores_stale_and_future_acks() {
        let mut session = StreamSession::new(key(), "1".into(), Seq(3, 0));
        session.advance(Seq(5, 0), Some(Seq(5, 0)));

        assert!(!session.ack(Seq(2, 0)));
        assert!(!session.ack(Seq(6, 0)));
        assert_eq!(session.acked(), Seq(3, 0));

        assert!(session.ack(Seq(5, 0)));
        assert!(!session.ack(Seq(5, 0)));
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_schema_mismatch_refuses_stream() {
        let store = holder().await;
        write(&store, "1", "a").await;
        let manager = Arc::new(StreamManager::new(store, Arc::new(QueryRegistry::new()), config()));

        let (init, acc) = pair();
        let mut msg = establish(Seq::ZERO);
        msg.schema_version = "2".into();
        let handle = spawn_serve(&manager, acc, msg);

        match init.recv_msg().await.unwrap() {
            Some(Msg::ApplyChangesResponse(r)) => assert_eq!(r.status, ApplyStatus::SchemaMismatch),
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(init.recv_msg().await.unwrap(), None);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.status, ApplyStatus::SchemaMismatch);
        assert_eq!(summary.batches, 0);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_acknowledged_changes() {
        let store = holder().await;
        for i in 1..=9 {
            write(&store, &i.to_string(), "x").await;
        }
        store
            .commit_local(
                &L,
                &[
                    LocalWrite::set("todo", "a", "title", "x"),
                    LocalWrite::set("todo", "b", "title", "x"),
                    LocalWrite::set("todo", "c", "title", "x"),
                    LocalWrite::set("todo", "d", "title", "x"),
                ],
            )
            .await
            .unwrap();
        write(&store, "e", "x").await;

        let manager = Arc::new(StreamManager::new(store, Arc::new(QueryRegistry::new()), config()));
        let (init, acc) = pair();
        let handle = spawn_serve(&manager, acc, establish(Seq(10, 2)));

        expect_ok_handshake(&init).await;
        let batch = expect_batch(&init).await;
        assert_eq!(batch.seq_start, Seq(10, 3));
        assert_eq!(pks(&batch.changes), vec!["d", "e"]);

        init.send_msg(AckChangesMsg { seq_end: Seq(11, 0) }).await.unwrap();
        init.close().await;

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.closed_by, CloseReason::PeerClosed);
        assert_eq!(summary.acked, Seq(11, 0));
        assert_eq!(summary.changes, 2);
    }

    #[tokio::test]
    async fn test_stream_suppresses_echo_and_filters() {
        let store = holder().await;
        write(&store, "1", "local").await;
        // A change that came from the remote itself.
        let echo = rowsync_core::Change {
            table: "todo".into(),
            pk: "2".into(),
            cid: "title".into(),
            val: ColumnValue::Text("remote".into()),
            col_version: 1,
            db_version: 1,
            site_id: R,
        };
        store
            .apply_changes(&L, &R, &[echo], Some(Seq(1, 0)), Default::default())
            .await
            .unwrap();
        store
            .commit_local(&L, &[LocalWrite::set("list", "9", "name", "groceries")])
            .await
            .unwrap();
        write(&store, "3", "local").await;

        let queries = Arc::new(QueryRegistry::new());
        queries.register(L, "todos".into(), QueryPredicate::table("todo"));
        let manager = Arc::new(StreamManager::new(store, queries, config()));

        let (init, acc) = pair();
        let mut msg = establish(Seq::ZERO);
        msg.query_ids = Some(vec!["todos".into()]);
        let handle = spawn_serve(&manager, acc, msg);

        expect_ok_handshake(&init).await;
        let batch = expect_batch(&init).await;
        assert_eq!(pks(&batch.changes), vec!["1", "3"]);
        assert_eq!(batch.seq_start, Seq(1, 0));

        init.close().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_query_fails_stream() {
        let manager = Arc::new(StreamManager::new(
            holder().await,
            Arc::new(QueryRegistry::new()),
            config(),
        ));
        let (init, acc) = pair();
        let mut msg = establish(Seq::ZERO);
        msg.query_ids = Some(vec!["missing".into()]);
        let handle = spawn_serve(&manager, acc, msg);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SyncError::UnknownQuery(_))));
        assert_eq!(init.recv_msg().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_waits_for_acks_then_times_out() {
        let store = holder().await;
        for pk in ["1", "2", "3"] {
            write(&store, pk, "x").await;
        }
        let config = config()
            .with_stream_batch_size(1)
            .with_max_unacked_batches(1)
            .with_ack_timeout(Duration::from_millis(200));
        let manager = Arc::new(StreamManager::new(store, Arc::new(QueryRegistry::new()), config));

        let (init, acc) = pair();
        let handle = spawn_serve(&manager, acc, establish(Seq::ZERO));

        expect_ok_handshake(&init).await;
        assert_eq!(expect_batch(&init).await.seq_start, Seq(1, 0));
        let held = tokio::time::timeout(Duration::from_millis(50), init.recv_msg()).await;
        assert!(held.is_err(), "window of one must hold the second batch");

        init.send_msg(AckChangesMsg { seq_end: Seq(1, 0) }).await.unwrap();
        assert_eq!(expect_batch(&init).await.seq_start, Seq(2, 0));

        // No further acks.
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_live_stream_end_to_end() {
        let holder = holder().await;
        write(&holder, "1", "before").await;
        let manager = Arc::new(StreamManager::new(
            holder.clone(),
            Arc::new(QueryRegistry::new()),
            config(),
        ));

        let requester = Arc::new(MemoryStore::new());
        requester.open_database(&R, &"1".into()).await.unwrap();
        let receiver = ChangeReceiver::new(requester.clone(), config());

        let (init, acc) = pair();
        let serving = spawn_serve(&manager, acc, establish(Seq::ZERO));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let inbound = tokio::spawn(async move {
            run_inbound_stream(&receiver, &init, establish(Seq::ZERO), &config(), stop_rx).await
        });

        write(&holder, "2", "after").await;

        let mut delivered = None;
        for _ in 0..200 {
            delivered = requester.get_cell(&R, "todo", "2", "title").await.unwrap();
            if delivered.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let cell = delivered.expect("live change delivered");
        assert_eq!(cell.val, ColumnValue::Text("after".into()));
        assert_eq!(cell.site_id, L);

        // Wait for the ack to land before closing.
        for _ in 0..200 {
            if manager.session(L, R).map(|s| s.acked()) == Some(Seq(2, 0)) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(requester.last_applied(&R, &L).await.unwrap(), Some(Seq(2, 0)));

        manager.shutdown();
        let summary = serving.await.unwrap().unwrap();
        assert_eq!(summary.closed_by, CloseReason::Shutdown);
        assert_eq!(summary.acked, Seq(2, 0));

        let result = inbound.await.unwrap();
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }

    #[tokio::test]
    async fn test_inbound_reports_refusal() {
        let store = holder().await;
        let manager = Arc::new(StreamManager::new(store, Arc::new(QueryRegistry::new()), config()));
        let requester = Arc::new(MemoryStore::new());
        requester.open_database(&R, &"2".into()).await.unwrap();
        let receiver = ChangeReceiver::new(requester, config());

        let (init, acc) = pair();
        let mut msg = establish(Seq::ZERO);
        msg.schema_version = "2".into();
        let serving = spawn_serve(&manager, acc, msg.clone());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let summary = run_inbound_stream(&receiver, &init, msg, &config(), stop_rx)
            .await
            .unwrap();
        assert_eq!(summary.status, ApplyStatus::SchemaMismatch);
        serving.await.unwrap().unwrap();
    }
}
