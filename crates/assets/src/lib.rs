//! Serialized asset tracker: one aggregate per physically identified unit.
//!
//! Units are minted by receiving, then only ever change status or location. They are
//! never deleted, so each stream is the audit trail of one asset's life.

pub mod unit;

pub use unit::*;
