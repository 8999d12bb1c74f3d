//! Stock ledger (event-sourced).
//!
//! Quantity at a location is never stored as a counter someone edits: it is the fold of
//! an append-only movement log, one [`PartLedger`] stream per part.

pub mod ledger;
pub mod movement;

pub use ledger::{LedgerCommand, LedgerEvent, MovementPosted, PartLedger, PostMovement};
pub use movement::{MovementId, MovementReference, MovementType, StockBucket};
