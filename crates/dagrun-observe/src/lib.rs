//! Observability setup for dagrun: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
