//! Infrastructure layer for dagrun.
//!
//! Contains implementations of the ports defined in `dagrun-core`:
//! SQLite and Postgres `DagStore` backends, the SHA-256 content hasher, the
//! HTTP webhook dispatcher, a local-process unit substrate, and the engine
//! configuration loader.

pub mod config;
pub mod crypto;
pub mod postgres;
mod rows;
pub mod sqlite;
pub mod substrate;
pub mod webhook;
