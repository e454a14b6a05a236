//! Execution engine for DAG workflow runs.
//!
//! This crate holds the engine's business logic and the ports (`DagStore`,
//! `UnitSubstrate`, `ContentHasher`) the infrastructure layer implements. It
//! depends only on `dagrun-types`, never on `dagrun-infra` or a database crate.

pub mod allocator;
pub mod engine;
pub mod hash;
pub mod repository;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod validate;
pub mod webhook;
pub mod worker;
