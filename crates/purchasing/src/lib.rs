//! Purchasing domain module (Purchase Orders, event-sourced).
//!
//! This crate contains business rules for purchase orders, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage). Receiving is split in two:
//! [`receiving::plan_receipt`] clamps and validates operator input against the current
//! order, and the resulting plan becomes a strict [`ReceiveGoods`] command.

pub mod numbering;
pub mod order;
pub mod receiving;

pub use numbering::{AllocateNumber, NumberAllocated, PoNumberSequence, SequenceCommand, SequenceEvent};
pub use order::*;
pub use receiving::{PlannedLine, ReceiptLineInput, ReceiptPlan, plan_receipt};
