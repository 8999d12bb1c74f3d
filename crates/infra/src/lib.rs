//! Infrastructure layer: event storage, units of work, read models and the
//! procurement operations built on top of them.
//!
//! ```text
//! Procurement ──► UnitOfWork ──► EventStore (in-memory | Postgres)
//!                                   │  inline projections (same commit)
//!                                   └─► EventBus (after commit)
//! ```

pub mod aggregates;
pub mod error;
pub mod event_store;
pub mod procurement;
pub mod projections;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use error::{ErrorKind, OperationError, OperationResult};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore};
pub use procurement::{Procurement, ProcurementSettings};
pub use projections::Projections;
pub use unit_of_work::UnitOfWork;
