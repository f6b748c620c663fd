//! # Rowsync Core
//!
//! Pure primitives for rowsync: log positions, changes, and conflict
//! resolution.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Seq`] - Position `(db_version, local_seq)` in a database's change log
//! - [`Change`] - One mutation of one column of one row, with its origin site
//! - [`WireChange`] - The client-server and peer-to-peer wire shapes of a change
//! - [`ConflictResolver`] - Per-column last-writer-wins with deterministic ties
//! - [`SchemaGate`] - Schema version compatibility check
//!
//! ## Convergence
//!
//! Resolution only looks at the stored cell and the incoming change, and
//! every tie is broken by a total order. Two replicas that have seen the same
//! set of changes therefore hold the same value and column version for every
//! cell, whatever order the changes arrived in.

pub mod change;
pub mod error;
pub mod pk;
pub mod resolve;
pub mod schema;
pub mod seq;
pub mod types;
pub mod value;

pub use change::{
    batch_positions, Change, ChangeBatch, ClientServerChange, PeerChange, Topology, WireChange,
    DELETE_SENTINEL,
};
pub use error::{CoreError, ValidationError};
pub use pk::{decode_pk, encode_pk};
pub use resolve::{ApplyReason, ColumnClock, ConflictResolver, IgnoreReason, Resolution};
pub use schema::{SchemaCheck, SchemaGate};
pub use seq::{Continuity, Seq};
pub use types::{DbId, QueryId, SchemaVersion};
pub use value::ColumnValue;
