//! Shared domain types for the dagrun execution engine.
//!
//! Workflow definitions, runs, task runs, units of work, configuration and
//! the error taxonomy. No infrastructure dependencies -- only serde, chrono,
//! thiserror.

pub mod config;
pub mod dag;
pub mod error;
pub mod run;
pub mod unit;
