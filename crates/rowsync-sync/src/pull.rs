//! The pull path.
//!
//! A holder answers `getChanges` with a lazy [`ChangeCursor`] over its log:
//! changes strictly after `since`, bounded by the head captured when the
//! request arrived, optionally filtered by registered queries. Over a
//! connection the batches travel as `receiveStreamingChanges` messages and
//! an empty batch whose `seqStart` is that head marks the end. A later
//! request with `since` set to the head resumes where this one stopped.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};

use rowsync_core::{DbId, SchemaCheck, SchemaGate, SchemaVersion, Seq, Topology, WireChange};
use rowsync_store::{LoggedChange, Store};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::messages::{
    ApplyChangesResponse, ApplyStatus, GetChangesMsg, Msg, ReceiveStreamingChangesMsg,
};
use crate::query::{QueryFilter, QueryRegistry};
use crate::receiver::{ChangeReceiver, InboundBatch, OrderingCheck};
use crate::transport::{Connection, ConnectionExt};

/// A restartable walk over one database's log.
pub struct ChangeCursor<S: Store> {
    store: Arc<S>,
    dbid: DbId,
    position: Seq,
    head: Seq,
    page_size: usize,
    filter: Option<QueryFilter>,
}

impl<S: Store> ChangeCursor<S> {
    pub fn new(
        store: Arc<S>,
        dbid: DbId,
        since: Seq,
        head: Seq,
        page_size: usize,
        filter: Option<QueryFilter>,
    ) -> Self {
        Self {
            store,
            dbid,
            position: since,
            head,
            page_size: page_size.max(1),
            filter,
        }
    }

    /// Last log position read. Resuming from here skips nothing.
    pub fn position(&self) -> Seq {
        self.position
    }

    /// The bound captured when the cursor was created.
    pub fn head(&self) -> Seq {
        self.head
    }

    /// The next non-empty batch, or `None` once the head is reached.
    ///
    /// Pages that the filter empties entirely are skipped.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<LoggedChange>>> {
        loop {
            if self.position >= self.head {
                return Ok(None);
            }

            let page = self
                .store
                .changes_since(&self.dbid, self.position, self.head, self.page_size)
                .await?;
            let last = match page.last() {
                Some(last) => last.seq,
                None => {
                    self.position = self.head;
                    return Ok(None);
                }
            };
            self.position = last;

            let batch: Vec<LoggedChange> = match &self.filter {
                Some(filter) => page
                    .into_iter()
                    .filter(|c| filter.matches(&c.change))
                    .collect(),
                None => page,
            };
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }
}

/// What a holder answers to `getChanges`.
pub enum PullResponse<S: Store> {
    SchemaMismatch { local: SchemaVersion },
    Changes(ChangeCursor<S>),
}

/// Summary of a pull served over a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub batches: usize,
    pub changes: usize,
    /// The end marker's position, or `None` if refused.
    pub head: Option<Seq>,
}

/// Answers `getChanges` requests.
pub struct PullHandler<S: Store> {
    store: Arc<S>,
    queries: Arc<QueryRegistry>,
    config: SyncConfig,
}

impl<S: Store> PullHandler<S> {
    pub fn new(store: Arc<S>, queries: Arc<QueryRegistry>, config: SyncConfig) -> Self {
        Self {
            store,
            queries,
            config,
        }
    }

    /// Schema gate, then a cursor bounded by the current head.
    pub async fn get_changes(&self, msg: &GetChangesMsg) -> Result<PullResponse<S>> {
        let local = self.store.schema_version(&msg.dbid).await?;
        if let SchemaCheck::Mismatch { requested, local } =
            SchemaGate::check(&msg.schema_version, &local)
        {
            warn!(dbid = %msg.dbid, %requested, %local, "schema mismatch, pull refused");
            return Ok(PullResponse::SchemaMismatch { local });
        }

        let filter = self
            .queries
            .resolve(&msg.dbid, msg.query_ids.as_deref())?;
        let head = self.store.head(&msg.dbid).await?;

        Ok(PullResponse::Changes(ChangeCursor::new(
            self.store.clone(),
            msg.dbid,
            msg.since,
            head,
            self.config.pull_page_size,
            filter,
        )))
    }

    /// Answer a pull over `conn`.
    pub async fn serve<C: Connection + ?Sized>(
        &self,
        conn: &C,
        msg: GetChangesMsg,
    ) -> Result<PullSummary> {
        let mut cursor = match self.get_changes(&msg).await? {
            PullResponse::SchemaMismatch { .. } => {
                conn.send_msg(ApplyChangesResponse::new(ApplyStatus::SchemaMismatch))
                    .await?;
                return Ok(PullSummary::default());
            }
            PullResponse::Changes(cursor) => cursor,
        };

        let mut summary = PullSummary::default();
        while let Some(batch) = cursor.next_batch().await? {
            summary.batches += 1;
            summary.changes += batch.len();
            conn.send_msg(to_streaming_msg(&batch, self.config.topology))
                .await?;
        }

        conn.send_msg(ReceiveStreamingChangesMsg {
            seq_start: cursor.head(),
            changes: Vec::new(),
        })
        .await?;

        debug!(
            dbid = %msg.dbid,
            since = %msg.since,
            head = %cursor.head(),
            batches = summary.batches,
            "pull served"
        );
        summary.head = Some(cursor.head());
        Ok(summary)
    }
}

/// Frame logged changes as one delivery. `batch` must not be empty.
pub(crate) fn to_streaming_msg(
    batch: &[LoggedChange],
    topology: Topology,
) -> ReceiveStreamingChangesMsg {
    ReceiveStreamingChangesMsg {
        seq_start: batch.first().map_or(Seq::ZERO, |c| c.seq),
        changes: batch
            .iter()
            .map(|c| c.change.to_wire(topology))
            .collect::<Vec<WireChange>>(),
    }
}

/// Outcome of pulling from a holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub status: ApplyStatus,
    pub batches: usize,
    pub applied: usize,
    pub ignored: usize,
    /// The holder's head when the pull began; pull again from here.
    pub head: Option<Seq>,
}

/// Request changes of `msg.dbid` and apply them into `local`.
///
/// Filtered pulls skip log positions by nature, so only unfiltered pulls
/// check ordering strictly, and only they move the last applied position.
pub async fn pull_changes<S, C>(
    receiver: &ChangeReceiver<S>,
    conn: &C,
    local: DbId,
    msg: GetChangesMsg,
    config: &SyncConfig,
) -> Result<PullOutcome>
where
    S: Store,
    C: Connection + ?Sized,
{
    let ordering = if msg.query_ids.is_some() {
        OrderingCheck::Filtered
    } else {
        OrderingCheck::Strict
    };
    let holder = msg.dbid;
    let schema_version = msg.schema_version.clone();
    conn.send_msg(msg).await?;

    let mut outcome = PullOutcome {
        status: ApplyStatus::Ok,
        batches: 0,
        applied: 0,
        ignored: 0,
        head: None,
    };

    loop {
        let next = timeout(config.message_timeout, conn.recv_msg())
            .await
            .map_err(|_| SyncError::Timeout("waiting for pulled changes".into()))??;

        match next {
            None => return Err(SyncError::Transport("connection closed during pull".into())),
            Some(Msg::ReceiveStreamingChanges(m)) if m.changes.is_empty() => {
                outcome.head = Some(m.seq_start);
                return Ok(outcome);
            }
            Some(Msg::ReceiveStreamingChanges(m)) => {
                let report = receiver
                    .apply_batch(
                        InboundBatch {
                            to: local,
                            from: holder,
                            schema_version: schema_version.clone(),
                            seq_start: m.seq_start,
                            changes: m.changes,
                        },
                        ordering,
                    )
                    .await?;
                outcome.batches += 1;
                outcome.applied += report.applied;
                outcome.ignored += report.ignored;
                if !report.status.is_ok() {
                    outcome.status = report.status;
                    return Ok(outcome);
                }
            }
            Some(Msg::ApplyChangesResponse(response)) => {
                outcome.status = response.status;
                return Ok(outcome);
            }
            Some(other) => {
                return Err(SyncError::UnexpectedMessage(format!(
                    "{:?} during pull",
                    other.tag()
                )))
            }
        }
    }
}
