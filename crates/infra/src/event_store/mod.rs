//! Append-only event store boundary.
//!
//! Streams are keyed by `(aggregate_type, aggregate_id)`. A commit spans any number of
//! streams and is atomic; see [`EventStore::commit`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, SqlProjection};
pub use r#trait::{
    EventStore, EventStoreError, InlineProjection, StoredEvent, StreamAppend, StreamId,
    UncommittedEvent,
};

use fieldstock_events::{EventBus, EventEnvelope};
use serde_json::Value as JsonValue;

/// Adapter that publishes committed events to an `EventBus` after a successful commit.
///
/// Publication happens only after the store accepted the batch. A failed publish is
/// logged and swallowed: the events are durable, and subscribers are at-least-once
/// consumers anyway.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

#[async_trait::async_trait]
impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    async fn load_stream(&self, stream: &StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(stream).await
    }

    async fn commit(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        // 1) Commit (durable step)
        let committed = self.store.commit(batch).await?;

        // 2) Publish committed events (best-effort; at-least-once acceptable)
        for e in &committed {
            if let Err(err) = self.bus.publish(e.to_envelope()) {
                tracing::warn!(
                    event_id = %e.event_id,
                    event_type = %e.event_type,
                    error = ?err,
                    "failed to publish committed event"
                );
            }
        }

        Ok(committed)
    }

    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fieldstock_core::{AggregateId, ExpectedVersion};
    use fieldstock_events::InMemoryEventBus;
    use std::sync::Arc;

    #[tokio::test]
    async fn publishes_only_after_commit() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus.clone());
        let stream = StreamId::new("test.stream", AggregateId::new());

        let append = |expected| StreamAppend {
            stream: stream.clone(),
            expected,
            events: vec![UncommittedEvent {
                event_id: uuid::Uuid::now_v7(),
                event_type: "test.happened".to_string(),
                event_version: 1,
                occurred_at: Utc::now(),
                payload: serde_json::json!({}),
            }],
        };

        store.commit(vec![append(ExpectedVersion::Exact(0))]).await.unwrap();
        assert!(store.commit(vec![append(ExpectedVersion::Exact(0))]).await.is_err());

        let published = subscription.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), "test.happened");
        assert_eq!(published[0].sequence_number(), 1);
    }
}
