//! Domain events and their distribution.
//!
//! - [`Event`]: metadata every domain event exposes (type name, schema version, business time)
//! - [`EventEnvelope`]: a committed event plus its stream position, as published on the bus
//! - [`EventBus`]: pub/sub used after commit to notify external consumers

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
