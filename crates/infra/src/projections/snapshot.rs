//! Latest state of every instance of one aggregate type, folded inline at commit.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::RwLock;

use fieldstock_core::Aggregate;

use crate::aggregates::StreamAggregate;
use crate::event_store::{EventStoreError, InlineProjection, StoredEvent};

/// Rebuildable snapshot cache of `A`, used by list/get queries.
///
/// Writes never read from here: a unit of work always rehydrates from the stream.
pub struct SnapshotProjection<A: StreamAggregate> {
    states: RwLock<HashMap<A::Id, A>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: StreamAggregate> Default for SnapshotProjection<A> {
    fn default() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            _aggregate: PhantomData,
        }
    }
}

impl<A: StreamAggregate> SnapshotProjection<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &A::Id) -> Option<A> {
        self.states.read().ok()?.get(id).cloned()
    }

    /// Every instance matching `keep`.
    pub fn list(&self, keep: impl Fn(&A) -> bool) -> Vec<A> {
        match self.states.read() {
            Ok(states) => states.values().filter(|a| keep(a)).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn relevant<'a>(events: &'a [StoredEvent]) -> impl Iterator<Item = &'a StoredEvent> {
        events.iter().filter(|e| e.aggregate_type == A::AGGREGATE_TYPE)
    }
}

impl<A: StreamAggregate> InlineProjection for SnapshotProjection<A> {
    fn name(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn check(&self, events: &[StoredEvent]) -> Result<(), EventStoreError> {
        for stored in Self::relevant(events) {
            stored.decode::<A::Event>()?;
        }
        Ok(())
    }

    fn apply(&self, events: &[StoredEvent]) {
        let Ok(mut states) = self.states.write() else {
            tracing::error!(projection = A::AGGREGATE_TYPE, "snapshot lock poisoned");
            return;
        };

        for stored in Self::relevant(events) {
            let event: A::Event = match stored.decode() {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(projection = A::AGGREGATE_TYPE, error = %err, "skipping undecodable event");
                    continue;
                }
            };
            let id = A::id_from_key(stored.aggregate_id);
            states
                .entry(id)
                .or_insert_with(|| A::blank(id))
                .apply(&event);
        }
    }

    fn reset(&self) {
        if let Ok(mut states) = self.states.write() {
            states.clear();
        }
    }
}
