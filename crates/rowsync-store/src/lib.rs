//! # Rowsync Store
//!
//! Storage abstraction for rowsync replicas. Provides a trait-based interface
//! for cell, change-log and peer-progress persistence with SQLite and
//! in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`LocalWrite`] - A write made by the local application
//! - [`ApplyOutcome`] - Result of applying a batch of remote changes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rowsync_core::DbId;
//! use rowsync_store::{LocalWrite, SqliteStore, Store};
//!
//! async fn example() -> rowsync_store::Result<()> {
//!     let store = SqliteStore::open("replica.db")?;
//!     let db = DbId::random();
//!     store.open_database(&db, &"1".into()).await?;
//!
//!     store
//!         .commit_local(&db, &[LocalWrite::set("todo", "1", "title", "milk")])
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic batches**: a remote batch is applied in one transaction
//! - **Re-logging**: remote winners are logged locally so they propagate onward
//! - **Terminal deletes**: a deleted row ignores later column writes

pub mod error;
pub mod memory;
pub mod migration;
pub mod notify;
pub mod sqlite;
pub mod traits;
mod txn;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use notify::CommitNotifier;
pub use sqlite::SqliteStore;
pub use traits::{ApplyOutcome, CellRecord, LocalWrite, LoggedChange, Store};
