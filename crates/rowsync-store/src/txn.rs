//! Backend-neutral write path.
//!
//! Both backends open a transaction, wrap it in a [`CellTxn`], and hand it to
//! [`apply_remote`] or [`commit_writes`]. Resolution, re-logging and progress
//! tracking therefore behave identically whichever store is in use.

use tracing::{trace, warn};

use rowsync_core::{
    Change, ColumnClock, ConflictResolver, DbId, IgnoreReason, Resolution, Seq, DELETE_SENTINEL,
};

use crate::error::{Result, StoreError};
use crate::traits::{ApplyOutcome, LocalWrite, LoggedChange};

/// The primitive reads and writes of one database inside one transaction.
pub(crate) trait CellTxn {
    fn head(&self) -> Result<Seq>;

    fn get_cell(&self, table: &str, pk: &str, cid: &str) -> Result<Option<ColumnClock>>;

    fn put_cell(&mut self, table: &str, pk: &str, cid: &str, clock: &ColumnClock) -> Result<()>;

    /// Remove every column cell of a row, keeping its delete marker.
    fn clear_row(&mut self, table: &str, pk: &str) -> Result<()>;

    fn append_log(&mut self, seq: Seq, change: &Change) -> Result<()>;

    fn last_applied(&self, from: &DbId) -> Result<Option<Seq>>;

    fn set_last_applied(&mut self, from: &DbId, seq: Seq) -> Result<()>;
}

/// Resolve each change in order and write the winners.
///
/// Later changes in the batch see the effect of earlier ones.
pub(crate) fn apply_remote<T: CellTxn>(
    txn: &mut T,
    from: &DbId,
    changes: &[Change],
    seq_end: Option<Seq>,
    resolver: ConflictResolver,
) -> Result<ApplyOutcome> {
    let version = txn.head()?.first_of_next_version();
    let mut next = version;
    let mut outcome = ApplyOutcome::default();

    for change in changes {
        let row_deleted = txn
            .get_cell(&change.table, &change.pk, DELETE_SENTINEL)?
            .is_some();
        let existing = txn.get_cell(&change.table, &change.pk, &change.cid)?;

        match resolver.resolve_in_row(row_deleted, existing.as_ref(), change) {
            Resolution::Apply(reason) => {
                trace!(
                    table = %change.table,
                    pk = %change.pk,
                    cid = %change.cid,
                    ?reason,
                    "change won"
                );
                write_winner(txn, change, next)?;
                next = next.next_in_version();
                outcome.applied += 1;
            }
            Resolution::Ignore(IgnoreReason::SiteConflict) => {
                warn!(
                    table = %change.table,
                    pk = %change.pk,
                    cid = %change.cid,
                    site = %change.site_id,
                    col_version = change.col_version,
                    "same site wrote two values at one column version; keeping stored value"
                );
                outcome.ignored += 1;
            }
            Resolution::Ignore(reason) => {
                trace!(
                    table = %change.table,
                    pk = %change.pk,
                    cid = %change.cid,
                    ?reason,
                    "change lost"
                );
                outcome.ignored += 1;
            }
        }
    }

    if outcome.applied > 0 {
        outcome.db_version = Some(version.db_version());
    }

    let previous = txn.last_applied(from)?;
    outcome.last_applied = match (previous, seq_end) {
        (Some(prev), Some(end)) => Some(prev.max(end)),
        (prev, end) => prev.or(end),
    };
    if let Some(last) = outcome.last_applied {
        if Some(last) != previous {
            txn.set_last_applied(from, last)?;
        }
    }

    Ok(outcome)
}

/// Commit local writes under the next version, attributed to `site`.
pub(crate) fn commit_writes<T: CellTxn>(
    txn: &mut T,
    site: &DbId,
    writes: &[LocalWrite],
) -> Result<Vec<LoggedChange>> {
    if writes.is_empty() {
        return Ok(Vec::new());
    }

    let version = txn.head()?.db_version() + 1;
    let mut logged = Vec::with_capacity(writes.len());

    for (i, write) in writes.iter().enumerate() {
        if txn.get_cell(&write.table, &write.pk, DELETE_SENTINEL)?.is_some() {
            return Err(StoreError::RowDeleted {
                table: write.table.clone(),
                pk: write.pk.clone(),
            });
        }

        let local_seq = u32::try_from(i).map_err(|_| {
            StoreError::InvalidData(format!("transaction too large: {} writes", writes.len()))
        })?;
        let col_version = txn
            .get_cell(&write.table, &write.pk, &write.cid)?
            .map_or(0, |clock| clock.col_version)
            + 1;

        let change = Change {
            table: write.table.clone(),
            pk: write.pk.clone(),
            cid: write.cid.clone(),
            val: write.val.clone(),
            col_version,
            db_version: version,
            site_id: *site,
        };
        let seq = Seq::new(version, local_seq);
        write_winner(txn, &change, seq)?;
        logged.push(LoggedChange { seq, change });
    }

    Ok(logged)
}

fn write_winner<T: CellTxn>(txn: &mut T, change: &Change, at: Seq) -> Result<()> {
    if change.is_delete() {
        txn.clear_row(&change.table, &change.pk)?;
    }
    txn.put_cell(
        &change.table,
        &change.pk,
        &change.cid,
        &ColumnClock::from_change(change, at.db_version()),
    )?;

    let mut relogged = change.clone();
    relogged.db_version = at.db_version();
    txn.append_log(at, &relogged)
}
