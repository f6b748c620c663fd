//! Error types for rowsync core.

use thiserror::Error;

use crate::seq::Seq;

/// Errors from parsing core identifiers and encodings.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid database id: {0}")]
    InvalidDbId(String),

    #[error("invalid primary key encoding: {0}")]
    InvalidPk(String),
}

/// A batch or change that cannot be accepted as sent.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("change to {table}[{pk}].{cid} carries no site id in a peer-to-peer topology")]
    MissingSiteId { table: String, pk: String, cid: String },

    #[error("batch starts at {seq_start} but its first change is at db version {db_version}")]
    BatchStartMismatch { seq_start: Seq, db_version: u64 },

    #[error("db version went backwards inside a batch: {previous} then {got}")]
    NonMonotonicVersion { previous: u64, got: u64 },

    #[error("column version must be at least 1, got 0 for {table}[{pk}].{cid}")]
    ZeroColumnVersion { table: String, pk: String, cid: String },
}
