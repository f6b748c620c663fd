//! # Rowsync Testkit
//!
//! Testing utilities for rowsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-memory sites with a database ready to write to
//! - **Generators**: Proptest strategies for values, changes and write sets
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use rowsync_testkit::generators::cell_writes;
//!
//! proptest! {
//!     #[test]
//!     fn converges(writes in cell_writes(16)) {
//!         // apply `writes` to two sites in different orders, compare cells
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use rowsync_testkit::fixtures::TestSite;
//!
//! async fn example() {
//!     let site = TestSite::new(1).await;
//!     site.write("todo", "1", "title", "milk").await;
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{db, init_tracing, TestSite};
pub use generators::{cell_write, cell_writes, column_value, CellWrite};
