//! # Rowsync
//!
//! Column-level CRDT replication of relational databases.
//!
//! ## Overview
//!
//! Every replica of a database keeps a log of column changes. Replicas
//! exchange those changes and resolve them per column, so all replicas that
//! have seen the same changes hold the same data:
//!
//! - **Changes**: one mutation of one column of one row, stamped with a
//!   column version and the site that wrote it
//! - **Logs**: each commit takes the next version; changes are addressed by
//!   `Seq = (db_version, local_seq)`
//! - **Sync**: push (`applyChanges`), pull (`getChanges`) and live streams,
//!   all resumable from the last applied position
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rowsync::{LocalWrite, Replica, ReplicaConfig, SchemaVersion};
//!
//! async fn example() -> rowsync::Result<()> {
//!     let replica = Replica::open(ReplicaConfig::default().with_service_name("todo"))?;
//!     let db = replica.create_database(&SchemaVersion::new("1")).await?;
//!
//!     replica
//!         .write(&db, &[LocalWrite::set("todo", "1", "title", "milk")])
//!         .await?;
//!
//!     // Serve peers on any connection:
//!     // replica.serve_connection(&conn).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `rowsync::core` - Seq, changes, conflict resolution
//! - `rowsync::store` - Storage abstraction, SQLite and in-memory stores
//! - `rowsync::sync` - Wire messages, codec and protocol handlers

pub mod config;
pub mod error;
pub mod replica;

pub use rowsync_core as core;
pub use rowsync_store as store;
pub use rowsync_sync as sync;

pub use config::ReplicaConfig;
pub use error::{ReplicaError, Result};
pub use replica::{PushOutcome, Replica};

pub use rowsync_core::{
    ColumnValue, DbId, QueryId, SchemaVersion, Seq, Topology, DELETE_SENTINEL,
};
pub use rowsync_store::{LocalWrite, MemoryStore, SqliteStore, Store};
pub use rowsync_sync::{ApplyStatus, Connection, QueryPredicate, SyncConfig};
