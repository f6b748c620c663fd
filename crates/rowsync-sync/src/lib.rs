//! # Rowsync Sync
//!
//! Change-log sync protocol between rowsync replicas.
//!
//! ## Overview
//!
//! Replicas exchange column-level changes over any ordered, reliable
//! [`Connection`]. Three conversations share one closed set of messages:
//!
//! - **Apply** (push): `applyChanges` carries a batch from the sender's log;
//!   the receiver answers `applyChangesResponse` with `ok`, `schemaMismatch`
//!   or `outOfOrder`.
//! - **Pull**: `getChanges` asks a holder for everything after a position;
//!   the holder answers with `receiveStreamingChanges` batches and an empty
//!   end marker.
//! - **Stream**: `establishOutboundStream` opens a session that delivers new
//!   commits as they happen, flow-controlled by `ackChanges`.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-applying a batch changes nothing
//! - **Convergent**: per-column resolution makes arrival order irrelevant
//! - **Resumable**: every conversation restarts from the last applied position
//! - **Schema-gated**: mismatched schema versions exchange no change data
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rowsync_store::MemoryStore;
//! use rowsync_sync::{ChangeReceiver, SyncConfig};
//!
//! async fn example() {
//!     let store = Arc::new(MemoryStore::new());
//!     let receiver = ChangeReceiver::new(store, SyncConfig::default());
//!
//!     // let report = receiver.apply_changes(msg).await?;
//!     // assert!(report.status.is_ok());
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Sender                              Receiver
//!   |-------- applyChanges ----------->|
//!   |<------- applyChangesResponse ----|
//!
//! Requester                           Holder
//!   |-------- getChanges ------------->|
//!   |<------- receiveStreamingChanges -|  (repeated)
//!   |<------- receiveStreamingChanges -|  (empty: done)
//!
//! Initiator                           Accepter
//!   |-------- establishOutboundStream >|
//!   |<------- applyChangesResponse ----|
//!   |<------- receiveStreamingChanges -|
//!   |-------- ackChanges ------------->|
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod messages;
pub mod pull;
pub mod query;
pub mod receiver;
pub mod stream;
pub mod transport;

pub use codec::{decode, encode};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use messages::{
    AckChangesMsg, ApplyChangesMsg, ApplyChangesResponse, ApplyStatus, EstablishOutboundStreamMsg,
    GetChangesMsg, Msg, ReceiveStreamingChangesMsg, Tag,
};
pub use pull::{pull_changes, ChangeCursor, PullHandler, PullOutcome, PullResponse, PullSummary};
pub use query::{QueryFilter, QueryPredicate, QueryRegistry};
pub use receiver::{
    ApplyPhase, ApplyReport, ChangeReceiver, InboundBatch, OrderingCheck, PairGuard, PairLocks,
};
pub use stream::{
    run_inbound_stream, CloseReason, InboundSummary, StreamKey, StreamManager, StreamSession,
    StreamState, StreamSummary,
};
pub use transport::{memory::MemoryConnection, Connection, ConnectionExt};
