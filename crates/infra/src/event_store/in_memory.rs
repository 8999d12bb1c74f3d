use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::r#trait::{
    validate_batch, EventStore, EventStoreError, InlineProjection, StoredEvent, StreamAppend,
    StreamId,
};

#[derive(Debug, Default)]
struct Streams {
    by_stream: HashMap<StreamId, Vec<StoredEvent>>,
    log: Vec<StoredEvent>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. One write lock covers the version checks, the append, and
/// every registered inline projection, which is what makes a commit atomic here.
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<Streams>,
    projections: Vec<Arc<dyn InlineProjection>>,
}

impl core::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field(
                "projections",
                &self.projections.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projections(projections: Vec<Arc<dyn InlineProjection>>) -> Self {
        Self {
            streams: RwLock::new(Streams::default()),
            projections,
        }
    }

    fn current_version(stream: Option<&Vec<StoredEvent>>) -> u64 {
        stream
            .and_then(|s| s.last())
            .map(|e| e.sequence_number)
            .unwrap_or(0)
    }

    /// Total number of stored events.
    pub fn len(&self) -> usize {
        self.streams.read().map(|s| s.log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn load_stream(&self, stream: &StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Database("lock poisoned".to_string()))?;

        Ok(streams.by_stream.get(stream).cloned().unwrap_or_default())
    }

    async fn commit(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&batch)?;

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Database("lock poisoned".to_string()))?;

        // 1) Check every stream (including read-only entries) before writing anything.
        for append in &batch {
            let current = Self::current_version(streams.by_stream.get(&append.stream));
            if !append.expected.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    append.stream, append.expected
                )));
            }
        }

        // 2) Assign sequence numbers and global positions.
        let mut next_position = streams.log.len() as u64 + 1;
        let mut committed = Vec::new();
        for append in &batch {
            let mut next_sequence = Self::current_version(streams.by_stream.get(&append.stream)) + 1;
            for event in &append.events {
                committed.push(StoredEvent {
                    event_id: event.event_id,
                    aggregate_id: append.stream.aggregate_id,
                    aggregate_type: append.stream.aggregate_type.clone(),
                    sequence_number: next_sequence,
                    position: next_position,
                    event_type: event.event_type.clone(),
                    event_version: event.event_version,
                    occurred_at: event.occurred_at,
                    payload: event.payload.clone(),
                });
                next_sequence += 1;
                next_position += 1;
            }
        }

        if committed.is_empty() {
            return Ok(committed);
        }

        // 3) Projections may still refuse the batch; nothing is written yet.
        for projection in &self.projections {
            projection.check(&committed)?;
        }

        for event in &committed {
            streams
                .by_stream
                .entry(event.stream_id())
                .or_default()
                .push(event.clone());
            streams.log.push(event.clone());
        }
        for projection in &self.projections {
            projection.apply(&committed);
        }

        Ok(committed)
    }

    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Database("lock poisoned".to_string()))?;
        Ok(streams.log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::UncommittedEvent;
    use chrono::Utc;
    use fieldstock_core::{AggregateId, ExpectedVersion};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: uuid::Uuid::now_v7(),
            event_type: kind.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "kind": kind }),
        }
    }

    fn stream(kind: &str) -> StreamId {
        StreamId::new(kind, AggregateId::new())
    }

    #[tokio::test]
    async fn commit_assigns_sequence_and_position() {
        let store = InMemoryEventStore::new();
        let a = stream("test.a");
        let b = stream("test.b");

        let committed = store
            .commit(vec![
                StreamAppend {
                    stream: a.clone(),
                    expected: ExpectedVersion::Exact(0),
                    events: vec![event("one"), event("two")],
                },
                StreamAppend {
                    stream: b.clone(),
                    expected: ExpectedVersion::Exact(0),
                    events: vec![event("three")],
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            committed.iter().map(|e| (e.sequence_number, e.position)).collect::<Vec<_>>(),
            vec![(1, 1), (2, 2), (1, 3)]
        );
        assert_eq!(store.load_stream(&a).await.unwrap().len(), 2);
        assert_eq!(store.load_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stale_read_only_entry_rejects_whole_batch() {
        let store = InMemoryEventStore::new();
        let read = stream("test.read");
        let write = stream("test.write");

        store
            .commit(vec![StreamAppend {
                stream: read.clone(),
                expected: ExpectedVersion::Exact(0),
                events: vec![event("seed")],
            }])
            .await
            .unwrap();

        let err = store
            .commit(vec![
                StreamAppend {
                    stream: read,
                    expected: ExpectedVersion::Exact(0),
                    events: vec![],
                },
                StreamAppend {
                    stream: write.clone(),
                    expected: ExpectedVersion::Exact(0),
                    events: vec![event("never")],
                },
            ])
            .await
            .unwrap_err();

        assert!(err.is_concurrency());
        assert!(store.load_stream(&write).await.unwrap().is_empty());
    }

    struct Refusing {
        applied: AtomicUsize,
    }

    impl InlineProjection for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn check(&self, events: &[StoredEvent]) -> Result<(), EventStoreError> {
            if events.iter().any(|e| e.event_type == "bad") {
                return Err(EventStoreError::Projection("bad event".to_string()));
            }
            Ok(())
        }

        fn apply(&self, events: &[StoredEvent]) {
            self.applied.fetch_add(events.len(), Ordering::SeqCst);
        }

        fn reset(&self) {
            self.applied.store(0, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn projection_refusal_leaves_store_untouched() {
        let projection = Arc::new(Refusing {
            applied: AtomicUsize::new(0),
        });
        let store = InMemoryEventStore::with_projections(vec![projection.clone()]);

        let err = store
            .commit(vec![StreamAppend {
                stream: stream("test.p"),
                expected: ExpectedVersion::Any,
                events: vec![event("good"), event("bad")],
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Projection(_)));
        assert!(store.is_empty());
        assert_eq!(projection.applied.load(Ordering::SeqCst), 0);

        store
            .commit(vec![StreamAppend {
                stream: stream("test.p"),
                expected: ExpectedVersion::Any,
                events: vec![event("good")],
            }])
            .await
            .unwrap();
        assert_eq!(projection.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_stream_in_batch_is_invalid() {
        let store = InMemoryEventStore::new();
        let s = stream("test.dup");
        let err = store
            .commit(vec![
                StreamAppend {
                    stream: s.clone(),
                    expected: ExpectedVersion::Any,
                    events: vec![event("a")],
                },
                StreamAppend {
                    stream: s,
                    expected: ExpectedVersion::Any,
                    events: vec![event("b")],
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }
}
