use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use fieldstock_core::{AggregateId, ExpectedVersion};
use std::sync::Arc;

/// Identity of one event stream: the aggregate type plus the aggregate instance.
///
/// Two aggregates of different types may share a UUID (a part and its ledger both use
/// the part id), so the type is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
}

impl StreamId {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
        }
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Events go through this lifecycle:
///
/// 1. **Domain event**: produced by an aggregate's `handle()`
/// 2. **UncommittedEvent**: serialized, with event metadata extracted
/// 3. **StoredEvent**: persisted with a per-stream sequence number and a global position
/// 4. **EventEnvelope**: published to the bus after commit
///
/// Use [`UncommittedEvent::from_typed`] to build one from a typed domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Serialize a typed domain event, keeping its metadata.
    pub fn from_typed<E>(event_id: Uuid, event: &E) -> Result<Self, EventStoreError>
    where
        E: fieldstock_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("failed to serialize event: {e}")))?;

        Ok(Self {
            event_id,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// A stored event in an append-only stream.
///
/// `sequence_number` is the position inside the stream (1, 2, 3, ...). `position` is the
/// position in the store-wide log and orders events across streams; history queries
/// sort by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,
    /// Monotonically increasing position across all streams.
    pub position: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.aggregate_type.clone(), self.aggregate_id)
    }

    /// Deserialize the payload back into the typed domain event.
    pub fn decode<E: serde::de::DeserializeOwned>(&self) -> Result<E, EventStoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::InvalidAppend(format!(
                "failed to deserialize {} event at {}#{}: {e}",
                self.event_type,
                self.stream_id(),
                self.sequence_number
            ))
        })
    }

    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> fieldstock_events::EventEnvelope<JsonValue> {
        fieldstock_events::EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// One stream's share of an atomic commit.
///
/// `events` may be empty: the stream was only read, and the commit still checks that
/// nobody appended to it since (read validation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub stream: StreamId,
    pub expected: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to domain
/// errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// An inline projection refused the batch.
    #[error("projection rejected commit: {0}")]
    Projection(String),

    #[error("database error: {0}")]
    Database(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Read model maintained inside the store's commit.
///
/// `check` runs before anything is written and may refuse the batch; `apply` runs once
/// the batch is accepted and must not fail. The in-memory store calls both while holding
/// its write lock, so readers never see half a commit.
pub trait InlineProjection: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, _events: &[StoredEvent]) -> Result<(), EventStoreError> {
        Ok(())
    }

    fn apply(&self, events: &[StoredEvent]);

    /// Drop all state (before a replay).
    fn reset(&self);
}

/// Append-only event store with multi-stream atomic commits.
///
/// ## Commit semantics
///
/// `commit()`:
/// - checks every stream's `expected` version (including read-only entries)
/// - assigns sequence numbers (current + 1, ...) and global positions
/// - persists all streams atomically: all or nothing
///
/// ## Load semantics
///
/// `load_stream()` returns the events of one stream in sequence order, or an empty vector
/// when the stream does not exist yet.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn load_stream(&self, stream: &StreamId) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn commit(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Every event in global order (projection rebuilds).
    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError>;
}

#[async_trait::async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn load_stream(&self, stream: &StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(stream).await
    }

    async fn commit(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).commit(batch).await
    }

    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_all().await
    }
}

/// Validate the shape of a batch before touching storage.
pub(crate) fn validate_batch(batch: &[StreamAppend]) -> Result<(), EventStoreError> {
    let mut seen = std::collections::HashSet::new();
    for append in batch {
        if append.stream.aggregate_type.trim().is_empty() {
            return Err(EventStoreError::InvalidAppend(
                "aggregate_type cannot be empty".to_string(),
            ));
        }
        if !seen.insert((&append.stream.aggregate_type, append.stream.aggregate_id)) {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {} appears twice in one commit",
                append.stream
            )));
        }
    }
    Ok(())
}
