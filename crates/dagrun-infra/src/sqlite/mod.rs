//! SQLite storage layer.
//!
//! `DagStore` implementation backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod dag;
pub mod pool;
