//! Process-wide observability setup for the fieldstock binaries.

pub mod tracing;

pub use crate::tracing::{DEFAULT_FILTER, init, init_with_default};
