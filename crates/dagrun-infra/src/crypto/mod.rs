//! Cryptographic helpers for dagrun.
//!
//! - `hash`: SHA-256 content hashing for definition versioning

pub mod hash;
