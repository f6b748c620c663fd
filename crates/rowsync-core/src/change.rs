//! Changes: one captured mutation of one column of one row.
//!
//! Internally every change carries the site that produced it. On the wire
//! there are two shapes:
//!
//! - [`ClientServerChange`]: six fields, no site. The receiver knows which
//!   database a connection represents and attaches it after validation.
//! - [`PeerChange`]: seven fields, site explicit. Required peer-to-peer,
//!   where masking the site would break tie-breaks.
//!
//! Both project into [`Change`] through [`WireChange::into_change`].

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::seq::Seq;
use crate::types::{DbId, SchemaVersion};
use crate::value::ColumnValue;

/// Column id marking a row delete.
pub const DELETE_SENTINEL: &str = "__crsql_del";

/// How replicas are connected. Decides whether site ids travel on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Clients talk to a server that masks client site ids.
    #[default]
    ClientServer,
    /// Replicas talk to each other directly; site ids are mandatory.
    PeerToPeer,
}

/// A validated change, with its origin site attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Table name.
    pub table: String,
    /// Encoded primary key (see [`crate::pk`]).
    pub pk: String,
    /// Column id, or [`DELETE_SENTINEL`].
    pub cid: String,
    /// The new value.
    pub val: ColumnValue,
    /// Per (row, column) version at the owning replica.
    pub col_version: u64,
    /// Version of the sender's log that holds this change.
    pub db_version: u64,
    /// The site the change is attributed to.
    pub site_id: DbId,
}

impl Change {
    /// Whether this change deletes its row.
    pub fn is_delete(&self) -> bool {
        self.cid == DELETE_SENTINEL
    }

    /// Reject changes no replica could have produced.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.col_version == 0 {
            return Err(ValidationError::ZeroColumnVersion {
                table: self.table.clone(),
                pk: self.pk.clone(),
                cid: self.cid.clone(),
            });
        }
        Ok(())
    }

    /// Key of the cell this change targets.
    pub fn cell_key(&self) -> (&str, &str, &str) {
        (&self.table, &self.pk, &self.cid)
    }

    /// Project to the wire shape appropriate for `topology`.
    pub fn to_wire(&self, topology: Topology) -> WireChange {
        match topology {
            Topology::ClientServer => WireChange::ClientServer(ClientServerChange {
                table: self.table.clone(),
                pk: self.pk.clone(),
                cid: self.cid.clone(),
                val: self.val.clone(),
                col_version: self.col_version,
                db_version: self.db_version,
            }),
            Topology::PeerToPeer => WireChange::Peer(PeerChange {
                table: self.table.clone(),
                pk: self.pk.clone(),
                cid: self.cid.clone(),
                val: self.val.clone(),
                col_version: self.col_version,
                db_version: self.db_version,
                site_id: self.site_id,
            }),
        }
    }
}

type ClientServerRepr = (String, String, String, ColumnValue, u64, u64);
type PeerRepr = (String, String, String, ColumnValue, u64, u64, DbId);

/// Wire change without site identity: `[table, pk, cid, val, col_version, db_version]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ClientServerRepr", into = "ClientServerRepr")]
pub struct ClientServerChange {
    pub table: String,
    pub pk: String,
    pub cid: String,
    pub val: ColumnValue,
    pub col_version: u64,
    pub db_version: u64,
}

impl From<ClientServerRepr> for ClientServerChange {
    fn from((table, pk, cid, val, col_version, db_version): ClientServerRepr) -> Self {
        Self {
            table,
            pk,
            cid,
            val,
            col_version,
            db_version,
        }
    }
}

impl From<ClientServerChange> for ClientServerRepr {
    fn from(c: ClientServerChange) -> Self {
        (c.table, c.pk, c.cid, c.val, c.col_version, c.db_version)
    }
}

/// Wire change with site identity: `[table, pk, cid, val, col_version, db_version, site_id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PeerRepr", into = "PeerRepr")]
pub struct PeerChange {
    pub table: String,
    pub pk: String,
    pub cid: String,
    pub val: ColumnValue,
    pub col_version: u64,
    pub db_version: u64,
    pub site_id: DbId,
}

impl From<PeerRepr> for PeerChange {
    fn from((table, pk, cid, val, col_version, db_version, site_id): PeerRepr) -> Self {
        Self {
            table,
            pk,
            cid,
            val,
            col_version,
            db_version,
            site_id,
        }
    }
}

impl From<PeerChange> for PeerRepr {
    fn from(c: PeerChange) -> Self {
        (c.table, c.pk, c.cid, c.val, c.col_version, c.db_version, c.site_id)
    }
}

/// A change as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireChange {
    Peer(PeerChange),
    ClientServer(ClientServerChange),
}

impl WireChange {
    pub fn db_version(&self) -> u64 {
        match self {
            WireChange::Peer(c) => c.db_version,
            WireChange::ClientServer(c) => c.db_version,
        }
    }

    /// Attach site identity and produce an internal change.
    ///
    /// In client-server topology the connection's site always wins, even if
    /// the sender supplied one. Peer-to-peer changes must carry their site.
    pub fn into_change(
        self,
        topology: Topology,
        connection_site: DbId,
    ) -> Result<Change, ValidationError> {
        match (self, topology) {
            (WireChange::ClientServer(c), Topology::ClientServer) => Ok(Change {
                table: c.table,
                pk: c.pk,
                cid: c.cid,
                val: c.val,
                col_version: c.col_version,
                db_version: c.db_version,
                site_id: connection_site,
            }),
            (WireChange::Peer(c), Topology::ClientServer) => Ok(Change {
                table: c.table,
                pk: c.pk,
                cid: c.cid,
                val: c.val,
                col_version: c.col_version,
                db_version: c.db_version,
                site_id: connection_site,
            }),
            (WireChange::Peer(c), Topology::PeerToPeer) => Ok(Change {
                table: c.table,
                pk: c.pk,
                cid: c.cid,
                val: c.val,
                col_version: c.col_version,
                db_version: c.db_version,
                site_id: c.site_id,
            }),
            (WireChange::ClientServer(c), Topology::PeerToPeer) => {
                Err(ValidationError::MissingSiteId {
                    table: c.table,
                    pk: c.pk,
                    cid: c.cid,
                })
            }
        }
    }
}

/// Reconstruct the log position of every change in a batch.
///
/// The first change must sit at `seq_start`. Each following change either
/// shares the previous version (local seq + 1) or opens a later one (local
/// seq 0). Versions never go backwards inside a batch.
pub fn batch_positions(
    seq_start: Seq,
    db_versions: impl IntoIterator<Item = u64>,
) -> Result<Vec<Seq>, ValidationError> {
    let mut positions: Vec<Seq> = Vec::new();

    for version in db_versions {
        let pos = match positions.last() {
            None => {
                if version != seq_start.db_version() {
                    return Err(ValidationError::BatchStartMismatch {
                        seq_start,
                        db_version: version,
                    });
                }
                seq_start
            }
            Some(prev) if version == prev.db_version() => prev.next_in_version(),
            Some(prev) if version > prev.db_version() => Seq::new(version, 0),
            Some(prev) => {
                return Err(ValidationError::NonMonotonicVersion {
                    previous: prev.db_version(),
                    got: version,
                })
            }
        };
        positions.push(pos);
    }

    Ok(positions)
}

/// An ordered group of validated changes bound to a sender, a receiver and
/// a schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub from: DbId,
    pub to: DbId,
    pub schema_version: SchemaVersion,
    /// Position of the first change.
    pub seq_start: Seq,
    pub changes: Vec<Change>,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Position of each change.
    pub fn positions(&self) -> Result<Vec<Seq>, ValidationError> {
        batch_positions(self.seq_start, self.changes.iter().map(|c| c.db_version))
    }

    /// Position of the last change, or `None` for an empty batch.
    pub fn seq_end(&self) -> Result<Option<Seq>, ValidationError> {
        Ok(self.positions()?.last().copied())
    }
}
