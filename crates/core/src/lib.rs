//! `fieldstock-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by every procurement
//! module (no infrastructure concerns, no IO).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, JobId, UserId, VendorId};
pub use value_object::{Money, TaxRate, ValueObject};
