//! Parts request queue (event-sourced).
//!
//! Technicians and dispatchers raise requests against a job; purchase orders link to
//! them and drive their status forward. The queue module holds the pure read-side
//! functions (filters, SLA, metrics) over rehydrated requests.

pub mod queue;
pub mod request;

pub use queue::*;
pub use request::*;
