//! `UnitSubstrate` adapters.

pub mod local;
