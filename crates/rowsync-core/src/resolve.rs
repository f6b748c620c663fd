//! Column-level conflict resolution.
//!
//! Each (table, pk, column) cell converges independently on the writer with
//! the highest column version, so concurrent edits to different columns of
//! the same row never conflict. Equal versions are broken deterministically
//! by value, then by site, so every replica picks the same winner.
//!
//! Peer-to-peer, site ids are authoritative: one site never produces two
//! values at the same column version, so seeing that is reported as
//! corruption and the stored value is kept. Client-server, the receiver
//! attributes everything relayed by the server to the server, so the same
//! situation is ordinary and the value tie-break decides.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::change::{Change, Topology};
use crate::types::DbId;
use crate::value::ColumnValue;

/// What a replica currently holds for one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnClock {
    pub val: ColumnValue,
    pub col_version: u64,
    /// Version of the local log that last wrote this cell.
    pub db_version: u64,
    pub site_id: DbId,
}

impl ColumnClock {
    /// The stored state after `change` wins and is logged at `db_version`.
    pub fn from_change(change: &Change, db_version: u64) -> Self {
        Self {
            val: change.val.clone(),
            col_version: change.col_version,
            db_version,
            site_id: change.site_id,
        }
    }
}

/// The outcome of resolving an incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Apply(ApplyReason),
    Ignore(IgnoreReason),
}

impl Resolution {
    pub fn is_apply(&self) -> bool {
        matches!(self, Resolution::Apply(_))
    }
}

/// Why an incoming change won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyReason {
    /// Nothing stored for the cell yet.
    Absent,
    /// Strictly higher column version.
    Newer,
    /// Equal version, greater value.
    ValueTieBreak,
    /// Equal version and value, greater site id.
    SiteTieBreak,
}

/// Why an incoming change lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Lower column version.
    Stale,
    /// Equal version; stored value and site win or are the same.
    Superseded,
    /// The row has been deleted; deletes are terminal.
    RowDeleted,
    /// Equal version, same site, different value. Cannot happen unless a
    /// replica's state is corrupt.
    SiteConflict,
}

/// Decides which of two competing writes to a cell survives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictResolver {
    topology: Topology,
}

impl ConflictResolver {
    pub const fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub const fn topology(&self) -> Topology {
        self.topology
    }

    /// Resolve `incoming` against what is stored for its cell.
    ///
    /// An absent cell counts as version 0, so any real change wins it.
    pub fn resolve(&self, existing: Option<&ColumnClock>, incoming: &Change) -> Resolution {
        let existing = match existing {
            Some(e) => e,
            None => return Resolution::Apply(ApplyReason::Absent),
        };

        match incoming.col_version.cmp(&existing.col_version) {
            Ordering::Greater => Resolution::Apply(ApplyReason::Newer),
            Ordering::Less => Resolution::Ignore(IgnoreReason::Stale),
            Ordering::Equal => self.break_tie(existing, incoming),
        }
    }

    /// Resolve within a row, honouring a recorded delete.
    pub fn resolve_in_row(
        &self,
        row_deleted: bool,
        existing: Option<&ColumnClock>,
        incoming: &Change,
    ) -> Resolution {
        if row_deleted && !incoming.is_delete() {
            return Resolution::Ignore(IgnoreReason::RowDeleted);
        }
        self.resolve(existing, incoming)
    }

    fn break_tie(&self, existing: &ColumnClock, incoming: &Change) -> Resolution {
        let by_value = incoming.val.total_cmp(&existing.val);

        if self.topology == Topology::PeerToPeer
            && incoming.site_id == existing.site_id
            && by_value != Ordering::Equal
        {
            return Resolution::Ignore(IgnoreReason::SiteConflict);
        }

        match by_value {
            Ordering::Greater => Resolution::Apply(ApplyReason::ValueTieBreak),
            Ordering::Less => Resolution::Ignore(IgnoreReason::Superseded),
            Ordering::Equal if incoming.site_id > existing.site_id => {
                Resolution::Apply(ApplyReason::SiteTieBreak)
            }
            Ordering::Equal => Resolution::Ignore(IgnoreReason::Superseded),
        }
    }
}
