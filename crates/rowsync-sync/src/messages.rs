//! Sync protocol message types.
//!
//! Six message kinds form a closed union discriminated on the wire by an
//! integer `_tag` (see [`crate::codec`]). Field names are camelCase on the
//! wire; `queryIds` is omitted when absent.

use serde::{Deserialize, Serialize};

use rowsync_core::{DbId, QueryId, SchemaVersion, Seq, WireChange};

/// Wire discriminant of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    ApplyChanges = 0,
    GetChanges = 1,
    EstablishOutboundStream = 2,
    AckChanges = 3,
    ReceiveStreamingChanges = 4,
    ApplyChangesResponse = 5,
}

impl Tag {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Tag::ApplyChanges),
            1 => Some(Tag::GetChanges),
            2 => Some(Tag::EstablishOutboundStream),
            3 => Some(Tag::AckChanges),
            4 => Some(Tag::ReceiveStreamingChanges),
            5 => Some(Tag::ApplyChangesResponse),
            _ => None,
        }
    }
}

/// Push a batch of changes into a database.
///
/// The protocol is stateless, so every request names both databases and
/// carries the sender's schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyChangesMsg {
    /// The database to apply the changes to.
    pub to_dbid: DbId,
    /// The database sending the changes.
    pub from_dbid: DbId,
    pub schema_version: SchemaVersion,
    /// Position of the first change in the sender's log.
    pub seq_start: Seq,
    pub changes: Vec<WireChange>,
}

/// Ask a holder for the changes of `dbid` after `since`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChangesMsg {
    pub dbid: DbId,
    pub since: Seq,
    /// The requester's schema version. Nothing is sent on mismatch.
    pub schema_version: SchemaVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_ids: Option<Vec<QueryId>>,
}

/// Ask the accepter to stream future changes of `local_dbid` to
/// `remote_dbid`, starting after `seq_start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishOutboundStreamMsg {
    /// The accepter's database whose changes are streamed.
    pub local_dbid: DbId,
    /// The initiator's database receiving them.
    pub remote_dbid: DbId,
    pub seq_start: Seq,
    pub schema_version: SchemaVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_ids: Option<Vec<QueryId>>,
}

/// Acknowledge everything streamed up to and including `seq_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckChangesMsg {
    pub seq_end: Seq,
}

/// A batch delivered over an open stream or in answer to a pull.
///
/// Streams are stateful, so the databases and schema version are already
/// known to both ends. An empty batch ends a pull; its `seq_start` is the
/// holder's head when the pull began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveStreamingChangesMsg {
    pub seq_start: Seq,
    pub changes: Vec<WireChange>,
}

/// Outcome of an apply, a pull or a stream handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyStatus {
    Ok,
    SchemaMismatch,
    OutOfOrder,
}

impl ApplyStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApplyStatus::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyChangesResponse {
    pub status: ApplyStatus,
    /// The receiver's last applied position for the sender, so an
    /// `outOfOrder` sender knows where to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<Seq>,
}

impl ApplyChangesResponse {
    pub fn new(status: ApplyStatus) -> Self {
        Self {
            status,
            last_applied: None,
        }
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    ApplyChanges(ApplyChangesMsg),
    GetChanges(GetChangesMsg),
    EstablishOutboundStream(EstablishOutboundStreamMsg),
    AckChanges(AckChangesMsg),
    ReceiveStreamingChanges(ReceiveStreamingChangesMsg),
    ApplyChangesResponse(ApplyChangesResponse),
}

impl Msg {
    pub fn tag(&self) -> Tag {
        match self {
            Msg::ApplyChanges(_) => Tag::ApplyChanges,
            Msg::GetChanges(_) => Tag::GetChanges,
            Msg::EstablishOutboundStream(_) => Tag::EstablishOutboundStream,
            Msg::AckChanges(_) => Tag::AckChanges,
            Msg::ReceiveStreamingChanges(_) => Tag::ReceiveStreamingChanges,
            Msg::ApplyChangesResponse(_) => Tag::ApplyChangesResponse,
        }
    }
}

macro_rules! impl_from_msg {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Msg {
                fn from(msg: $ty) -> Self {
                    Msg::$variant(msg)
                }
            }
        )*
    };
}

impl_from_msg!(
    ApplyChangesMsg => ApplyChanges,
    GetChangesMsg => GetChanges,
    EstablishOutboundStreamMsg => EstablishOutboundStream,
    AckChangesMsg => AckChanges,
    ReceiveStreamingChangesMsg => ReceiveStreamingChanges,
    ApplyChangesResponse => ApplyChangesResponse,
);
