//! Postgres storage layer.
//!
//! Same schema and `DagStore` semantics as the SQLite backend, for
//! multi-replica deployments.

pub mod dag;
pub mod pool;
