//! The apply path.
//!
//! [`ChangeReceiver`] takes a batch of wire changes addressed to one of its
//! databases and walks it through `Validating → Applying → Responding`:
//!
//! 1. The schema gate runs before anything else touches the batch.
//! 2. Wire changes get their site attached and are validated.
//! 3. The batch start is checked against the last position applied from
//!    the sender, and each change against the one before it; a gap is
//!    answered with `outOfOrder`.
//! 4. The store resolves and commits the batch in one transaction and
//!    advances the sender's last applied position, unless the delivery was
//!    filtered by queries.
//!
//! Batches for the same `(to, from)` pair are serialized; different pairs
//! run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use rowsync_core::{
    batch_positions, Change, ConflictResolver, Continuity, DbId, SchemaCheck, SchemaGate,
    SchemaVersion, Seq, WireChange,
};
use rowsync_store::Store;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::messages::{ApplyChangesMsg, ApplyStatus};

/// Where an apply stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Idle,
    Validating,
    Applying,
    Responding,
}

/// How a batch is checked against the last applied position, and whether
/// it moves that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingCheck {
    /// Reject gaps, at the batch start or between changes, with `outOfOrder`.
    Strict,
    /// Accept any start. Used for unfiltered streams, which only skip
    /// changes the receiver originated.
    Relaxed,
    /// Accept any start and leave the last applied position untouched.
    /// Used for query-filtered deliveries: the positions they skip were
    /// never seen, so an unfiltered resume must still cover them.
    Filtered,
}

impl OrderingCheck {
    fn advances_progress(self) -> bool {
        self != OrderingCheck::Filtered
    }
}

/// Result of processing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub status: ApplyStatus,
    /// The phase the batch ended in.
    pub phase: ApplyPhase,
    pub applied: usize,
    pub ignored: usize,
    /// Position of the last change in this batch.
    pub batch_end: Option<Seq>,
    /// Last applied position for the sender after this batch.
    pub last_applied: Option<Seq>,
}

impl ApplyReport {
    fn rejected(status: ApplyStatus, phase: ApplyPhase, last_applied: Option<Seq>) -> Self {
        Self {
            status,
            phase,
            applied: 0,
            ignored: 0,
            batch_end: None,
            last_applied,
        }
    }
}

/// A batch addressed to a local database.
#[derive(Debug, Clone)]
pub struct InboundBatch {
    pub to: DbId,
    pub from: DbId,
    pub schema_version: SchemaVersion,
    pub seq_start: Seq,
    pub changes: Vec<WireChange>,
}

impl From<ApplyChangesMsg> for InboundBatch {
    fn from(msg: ApplyChangesMsg) -> Self {
        Self {
            to: msg.to_dbid,
            from: msg.from_dbid,
            schema_version: msg.schema_version,
            seq_start: msg.seq_start,
            changes: msg.changes,
        }
    }
}

/// One async mutex per `(to, from)` pair.
///
/// An entry lives only while some task holds or waits for it.
#[derive(Debug, Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<(DbId, DbId), Arc<AsyncMutex<()>>>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the pair.
    pub async fn lock(&self, to: DbId, from: DbId) -> PairGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry((to, from)).or_default().clone()
        };
        PairGuard {
            locks: self,
            key: (to, from),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of pairs currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one pair. Dropping it releases the pair and forgets
/// the mutex once nobody else holds a handle to it.
#[derive(Debug)]
pub struct PairGuard<'a> {
    locks: &'a PairLocks,
    key: (DbId, DbId),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        // The owned guard holds a handle of its own.
        drop(self.guard.take());

        // Handles are only cloned under the map lock, so a count of one here
        // means no task is holding or waiting.
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Applies incoming batches to local databases.
pub struct ChangeReceiver<S: Store> {
    store: Arc<S>,
    config: SyncConfig,
    locks: PairLocks,
}

impl<S: Store> ChangeReceiver<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            locks: PairLocks::new(),
        }
    }

    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.config.topology)
    }

    /// Handle an `applyChanges` request.
    pub async fn apply_changes(&self, msg: ApplyChangesMsg) -> Result<ApplyReport> {
        self.apply_batch(msg.into(), OrderingCheck::Strict).await
    }

    /// Validate and apply one batch.
    ///
    /// The site of every client-server change is `batch.from`. Storage
    /// failures are returned as errors with nothing committed.
    pub async fn apply_batch(
        &self,
        batch: InboundBatch,
        ordering: OrderingCheck,
    ) -> Result<ApplyReport> {
        let InboundBatch {
            to,
            from,
            schema_version,
            seq_start,
            changes,
        } = batch;

        // Validating
        let local_schema = self.store.schema_version(&to).await?;
        if let SchemaCheck::Mismatch { requested, local } =
            SchemaGate::check(&schema_version, &local_schema)
        {
            warn!(%to, %from, %requested, %local, "schema mismatch, batch refused");
            return Ok(ApplyReport::rejected(
                ApplyStatus::SchemaMismatch,
                ApplyPhase::Validating,
                None,
            ));
        }

        let changes = self.project(changes, from)?;
        let positions = batch_positions(seq_start, changes.iter().map(|c| c.db_version))?;
        let batch_end = positions.last().copied();

        let _guard = self.locks.lock(to, from).await;
        let last_applied = self.store.last_applied(&to, &from).await?;

        if changes.is_empty() {
            debug!(%to, %from, %seq_start, "empty batch");
            return Ok(ApplyReport {
                status: ApplyStatus::Ok,
                phase: ApplyPhase::Responding,
                applied: 0,
                ignored: 0,
                batch_end: None,
                last_applied,
            });
        }

        if ordering == OrderingCheck::Strict {
            let last = last_applied.unwrap_or(Seq::ZERO);
            if Seq::continuity(last, seq_start) == Continuity::Gap {
                warn!(%to, %from, %seq_start, %last, "gap in change stream, batch refused");
                return Ok(ApplyReport::rejected(
                    ApplyStatus::OutOfOrder,
                    ApplyPhase::Validating,
                    last_applied,
                ));
            }
            if let Some(pair) = positions
                .windows(2)
                .find(|pair| Seq::continuity(pair[0], pair[1]) == Continuity::Gap)
            {
                warn!(
                    %to,
                    %from,
                    after = %pair[0],
                    next = %pair[1],
                    "gap inside batch, batch refused"
                );
                return Ok(ApplyReport::rejected(
                    ApplyStatus::OutOfOrder,
                    ApplyPhase::Validating,
                    last_applied,
                ));
            }
        }

        // Applying
        let progress = batch_end.filter(|_| ordering.advances_progress());
        let outcome = self
            .store
            .apply_changes(&to, &from, &changes, progress, self.resolver())
            .await?;

        // Responding
        debug!(
            %to,
            %from,
            %seq_start,
            applied = outcome.applied,
            ignored = outcome.ignored,
            "batch applied"
        );
        Ok(ApplyReport {
            status: ApplyStatus::Ok,
            phase: ApplyPhase::Responding,
            applied: outcome.applied,
            ignored: outcome.ignored,
            batch_end,
            last_applied: outcome.last_applied,
        })
    }

    fn project(&self, changes: Vec<WireChange>, from: DbId) -> Result<Vec<Change>> {
        changes
            .into_iter()
            .map(|wire| {
                let change = wire.into_change(self.config.topology, from)?;
                change.validate()?;
                Ok(change)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{ClientServerChange, ColumnValue, PeerChange, Topology};
    use rowsync_store::{MemoryStore, StoreError};

    use crate::error::SyncError;

    fn db(n: u8) -> DbId {
        DbId::from_bytes([n; 16])
    }

    fn wire(pk: &str, val: &str, col_version: u64, db_version: u64) -> WireChange {
        WireChange::ClientServer(ClientServerChange {
            table: "todo".into(),
            pk: pk.into(),
            cid: "title".into(),
            val: ColumnValue::Text(val.into()),
            col_version,
            db_version,
        })
    }

    fn msg(seq_start: Seq, changes: Vec<WireChange>) -> ApplyChangesMsg {
        ApplyChangesMsg {
            to_dbid: db(1),
            from_dbid: db(2),
            schema_version: "1".into(),
            seq_start,
            changes,
        }
    }

    async fn receiver() -> (Arc<MemoryStore>, ChangeReceiver<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.open_database(&db(1), &"1".into()).await.unwrap();
        let receiver = ChangeReceiver::new(store.clone(), SyncConfig::default());
        (store, receiver)
    }

    #[tokio::test]
    async fn test_apply_ok_and_attaches_site() {
        let (store, receiver) = receiver().await;
        let report = receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "a", 1, 1)]))
            .await
            .unwrap();

        assert_eq!(report.status, ApplyStatus::Ok);
        assert_eq!(report.phase, ApplyPhase::Responding);
        assert_eq!(report.batch_end, Some(Seq(1, 0)));

        let cell = store.get_cell(&db(1), "todo", "1", "title").await.unwrap().unwrap();
        assert_eq!(cell.site_id, db(2));
    }

    #[tokio::test]
    async fn test_idempotent_reapply() {
        let (store, receiver) = receiver().await;
        let batch = msg(Seq(1, 0), vec![wire("1", "a", 1, 1), wire("2", "b", 1, 1)]);

        receiver.apply_changes(batch.clone()).await.unwrap();
        let cells_once = store.cells(&db(1)).await.unwrap();
        let head_once = store.head(&db(1)).await.unwrap();

        let again = receiver.apply_changes(batch).await.unwrap();
        assert_eq!(again.status, ApplyStatus::Ok);
        assert_eq!(again.applied, 0);
        assert_eq!(store.cells(&db(1)).await.unwrap(), cells_once);
        assert_eq!(store.head(&db(1)).await.unwrap(), head_once);
    }

    #[tokio::test]
    async fn test_gap_is_out_of_order() {
        let (store, receiver) = receiver().await;
        receiver
            .apply_changes(msg(Seq(5, 0), vec![wire("1", "a", 1, 5)]))
            .await
            .unwrap();
        // First batch from a fresh sender must start at (1, 0).
        assert_eq!(store.last_applied(&db(1), &db(2)).await.unwrap(), None);

        receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "a", 1, 1)]))
            .await
            .unwrap();
        store
            .apply_changes(&db(1), &db(2), &[], Some(Seq(5, 0)), ConflictResolver::default())
            .await
            .unwrap();
        let cells_before = store.cells(&db(1)).await.unwrap();

        let report = receiver
            .apply_changes(msg(Seq(7, 0), vec![wire("1", "z", 9, 7)]))
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::OutOfOrder);
        assert_eq!(report.last_applied, Some(Seq(5, 0)));
        assert_eq!(store.cells(&db(1)).await.unwrap(), cells_before);
        assert_eq!(store.last_applied(&db(1), &db(2)).await.unwrap(), Some(Seq(5, 0)));
    }

    #[tokio::test]
    async fn test_relaxed_ordering_accepts_gap() {
        let (_store, receiver) = receiver().await;
        let report = receiver
            .apply_batch(
                msg(Seq(9, 0), vec![wire("1", "a", 1, 9)]).into(),
                OrderingCheck::Relaxed,
            )
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::Ok);
        assert_eq!(report.last_applied, Some(Seq(9, 0)));
    }

    #[tokio::test]
    async fn test_gap_inside_batch_is_out_of_order() {
        let (store, receiver) = receiver().await;
        receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "a", 1, 1)]))
            .await
            .unwrap();
        let cells_before = store.cells(&db(1)).await.unwrap();

        // Versions 3 and 4 are missing between the two changes.
        let report = receiver
            .apply_changes(msg(Seq(2, 0), vec![wire("2", "b", 1, 2), wire("3", "c", 1, 5)]))
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::OutOfOrder);
        assert_eq!(report.phase, ApplyPhase::Validating);
        assert_eq!(report.last_applied, Some(Seq(1, 0)));
        assert_eq!(store.cells(&db(1)).await.unwrap(), cells_before);
        assert_eq!(store.last_applied(&db(1), &db(2)).await.unwrap(), Some(Seq(1, 0)));

        // Consecutive versions in one batch are fine.
        let report = receiver
            .apply_changes(msg(Seq(2, 0), vec![wire("2", "b", 1, 2), wire("3", "c", 1, 3)]))
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::Ok);
        assert_eq!(report.last_applied, Some(Seq(3, 0)));
    }

    #[tokio::test]
    async fn test_relaxed_ordering_accepts_gap_inside_batch() {
        let (_store, receiver) = receiver().await;
        let report = receiver
            .apply_batch(
                msg(Seq(2, 0), vec![wire("1", "a", 1, 2), wire("2", "b", 1, 5)]).into(),
                OrderingCheck::Relaxed,
            )
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::Ok);
        assert_eq!(report.last_applied, Some(Seq(5, 0)));
    }

    #[tokio::test]
    async fn test_filtered_delivery_keeps_last_applied() {
        let (store, receiver) = receiver().await;
        receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "a", 1, 1)]))
            .await
            .unwrap();

        let report = receiver
            .apply_batch(
                msg(Seq(4, 0), vec![wire("4", "d", 1, 4)]).into(),
                OrderingCheck::Filtered,
            )
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::Ok);
        assert_eq!(report.applied, 1);
        assert_eq!(report.batch_end, Some(Seq(4, 0)));
        assert_eq!(report.last_applied, Some(Seq(1, 0)));
        assert_eq!(store.last_applied(&db(1), &db(2)).await.unwrap(), Some(Seq(1, 0)));

        // The unfiltered cursor still resumes right after (1, 0).
        let report = receiver
            .apply_changes(msg(Seq(2, 0), vec![wire("2", "b", 1, 2)]))
            .await
            .unwrap();
        assert_eq!(report.status, ApplyStatus::Ok);
        assert_eq!(report.last_applied, Some(Seq(2, 0)));
    }

    #[tokio::test]
    async fn test_schema_mismatch_touches_nothing() {
        let (store, receiver) = receiver().await;
        let mut batch = msg(Seq(1, 0), vec![wire("1", "a", 1, 1)]);
        batch.schema_version = "2".into();

        let report = receiver.apply_changes(batch).await.unwrap();
        assert_eq!(report.status, ApplyStatus::SchemaMismatch);
        assert_eq!(report.phase, ApplyPhase::Validating);
        assert!(store.cells(&db(1)).await.unwrap().is_empty());
        assert_eq!(store.last_applied(&db(1), &db(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_schema_gate_runs_before_validation() {
        let (_store, receiver) = receiver().await;
        // Malformed batch (start does not match first change) but wrong schema.
        let mut batch = msg(Seq(3, 0), vec![wire("1", "a", 1, 1)]);
        batch.schema_version = "2".into();
        let report = receiver.apply_changes(batch).await.unwrap();
        assert_eq!(report.status, ApplyStatus::SchemaMismatch);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_error() {
        let (_store, receiver) = receiver().await;
        let err = receiver
            .apply_changes(msg(Seq(3, 0), vec![wire("1", "a", 1, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "a", 0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_storage_failure_is_retryable_and_rolls_back() {
        let (store, receiver) = receiver().await;
        store.fail_next_apply_after(1);
        let batch = msg(Seq(1, 0), vec![wire("1", "a", 1, 1), wire("2", "b", 1, 1)]);

        let err = receiver.apply_changes(batch.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SyncError::Store(StoreError::Injected(1))));
        assert!(store.cells(&db(1)).await.unwrap().is_empty());
        assert_eq!(store.last_applied(&db(1), &db(2)).await.unwrap(), None);

        // Retrying the identical batch succeeds.
        let report = receiver.apply_changes(batch).await.unwrap();
        assert_eq!(report.applied, 2);
    }

    #[tokio::test]
    async fn test_column_versions_resolve_in_any_order() {
        let (store, receiver) = receiver().await;
        receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "three", 3, 1)]))
            .await
            .unwrap();
        receiver
            .apply_changes(msg(Seq(2, 0), vec![wire("1", "two", 2, 2)]))
            .await
            .unwrap();

        let cell = store.get_cell(&db(1), "todo", "1", "title").await.unwrap().unwrap();
        assert_eq!(cell.val, ColumnValue::Text("three".into()));
        assert_eq!(cell.col_version, 3);
    }

    #[tokio::test]
    async fn test_peer_to_peer_rejects_siteless_changes() {
        let store = Arc::new(MemoryStore::new());
        store.open_database(&db(1), &"1".into()).await.unwrap();
        let receiver = ChangeReceiver::new(
            store.clone(),
            SyncConfig::default().with_topology(Topology::PeerToPeer),
        );

        let err = receiver
            .apply_changes(msg(Seq(1, 0), vec![wire("1", "a", 1, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let peer = WireChange::Peer(PeerChange {
            table: "todo".into(),
            pk: "1".into(),
            cid: "title".into(),
            val: ColumnValue::Text("a".into()),
            col_version: 1,
            db_version: 1,
            site_id: db(7),
        });
        receiver.apply_changes(msg(Seq(1, 0), vec![peer])).await.unwrap();
        let cell = store.get_cell(&db(1), "todo", "1", "title").await.unwrap().unwrap();
        assert_eq!(cell.site_id, db(7));
    }

    #[tokio::test]
    async fn test_pair_lock_serializes_same_pair() {
        let locks = Arc::new(PairLocks::new());
        let guard = locks.lock(db(1), db(2)).await;

        // A different pair is not blocked.
        let _other = locks.lock(db(1), db(3)).await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.lock(db(1), db(2)).await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_pair_lock_entries_are_pruned() {
        let locks = Arc::new(PairLocks::new());
        {
            let _a = locks.lock(db(1), db(2)).await;
            let _b = locks.lock(db(1), db(3)).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());

        // An entry with a waiter survives the holder's release.
        let guard = locks.lock(db(1), db(2)).await;
        let locks2 = locks.clone();
        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(async move {
            let _g = locks2.lock(db(1), db(2)).await;
            acquired_tx.send(()).unwrap();
            release_rx.await.unwrap();
        });
        tokio::task::yield_now().await;
        drop(guard);
        acquired_rx.await.unwrap();
        assert_eq!(locks.len(), 1);

        release_tx.send(()).unwrap();
        waiter.await.unwrap();
        assert!(locks.is_empty());

        for n in 0..50 {
            let _g = locks.lock(db(1), db(n)).await;
        }
        assert!(locks.is_empty());
    }
}
