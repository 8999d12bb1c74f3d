//! Unit of work: load aggregates, run commands, commit everything at once.
//!
//! ```text
//! load (record stream version) ──► execute (handle → apply → stage) ──► commit
//! ```
//!
//! Every stream an operation loaded goes into the commit, even when nothing was staged
//! for it. The store re-checks those versions, so a decision taken on a value another
//! operation changed in the meantime is rejected as a concurrency conflict rather than
//! committed. Dropping a unit of work without committing discards everything.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::hash::Hash;

use uuid::Uuid;

use fieldstock_core::{Aggregate, ExpectedVersion};

use crate::aggregates::StreamAggregate;
use crate::error::{OperationError, OperationResult};
use crate::event_store::{
    EventStore, EventStoreError, StoredEvent, StreamAppend, StreamId, UncommittedEvent,
};

#[derive(Debug)]
struct Entry {
    stream: StreamId,
    loaded_version: u64,
    staged: Vec<UncommittedEvent>,
}

pub struct UnitOfWork<'s, S: ?Sized> {
    store: &'s S,
    entries: Vec<Entry>,
    index: HashMap<StreamId, usize>,
}

impl<'s, S> UnitOfWork<'s, S>
where
    S: EventStore + ?Sized,
{
    pub fn new(store: &'s S) -> Self {
        Self {
            store,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rehydrate an aggregate and record the version it was read at.
    ///
    /// Each stream can be loaded once per unit of work; a second copy would diverge from
    /// the first.
    pub async fn load<A: StreamAggregate>(&mut self, id: A::Id) -> OperationResult<A> {
        let stream = A::stream_id(&id);
        if self.index.contains_key(&stream) {
            return Err(OperationError::internal(format!(
                "stream {stream} loaded twice in one unit of work"
            )));
        }

        let history = self.store.load_stream(&stream).await?;
        validate_loaded_stream(&stream, &history)?;

        let mut aggregate = A::blank(id);
        for stored in &history {
            let event: A::Event = stored.decode()?;
            aggregate.apply(&event);
        }

        self.index.insert(stream.clone(), self.entries.len());
        self.entries.push(Entry {
            stream,
            loaded_version: history.last().map(|e| e.sequence_number).unwrap_or(0),
            staged: Vec::new(),
        });
        Ok(aggregate)
    }

    /// Load `id` into `cache` unless an earlier step of the operation already did.
    ///
    /// Multi-line operations touch the same ledger or request from several lines.
    pub async fn load_into<'m, A>(
        &mut self,
        cache: &'m mut HashMap<A::Id, A>,
        id: A::Id,
    ) -> OperationResult<&'m mut A>
    where
        A: StreamAggregate,
        A::Id: Eq + Hash,
    {
        match cache.entry(id) {
            MapEntry::Occupied(entry) => Ok(entry.into_mut()),
            MapEntry::Vacant(entry) => {
                let aggregate = self.load::<A>(id).await?;
                Ok(entry.insert(aggregate))
            }
        }
    }

    /// Run a command against a loaded aggregate: decide, apply, stage.
    ///
    /// On a domain error nothing is applied or staged.
    pub fn execute<A: StreamAggregate>(
        &mut self,
        aggregate: &mut A,
        command: A::Command,
    ) -> OperationResult<Vec<A::Event>> {
        let stream = aggregate.own_stream();
        let Some(&idx) = self.index.get(&stream) else {
            return Err(OperationError::internal(format!(
                "stream {stream} was not loaded through this unit of work"
            )));
        };

        let decided = aggregate.handle(&command)?;
        let mut staged = Vec::with_capacity(decided.len());
        for event in &decided {
            staged.push(UncommittedEvent::from_typed(Uuid::now_v7(), event)?);
        }

        for event in &decided {
            aggregate.apply(event);
        }
        self.entries[idx].staged.extend(staged);
        Ok(decided)
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| !e.staged.is_empty())
    }

    pub fn staged_count(&self) -> usize {
        self.entries.iter().map(|e| e.staged.len()).sum()
    }

    /// Commit all staged events atomically, validating every loaded stream.
    ///
    /// A unit of work with nothing staged commits nothing.
    pub async fn commit(self) -> OperationResult<Vec<StoredEvent>> {
        if !self.has_changes() {
            return Ok(Vec::new());
        }

        let batch = self
            .entries
            .into_iter()
            .map(|e| StreamAppend {
                stream: e.stream,
                expected: ExpectedVersion::Exact(e.loaded_version),
                events: e.staged,
            })
            .collect();

        Ok(self.store.commit(batch).await?)
    }
}

fn validate_loaded_stream(stream: &StreamId, history: &[StoredEvent]) -> Result<(), EventStoreError> {
    // Guard against a backend returning another stream's events.
    let mut last = 0u64;
    for (idx, e) in history.iter().enumerate() {
        if e.aggregate_type != stream.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "loaded stream {stream} contains a '{}' event at index {idx}",
                e.aggregate_type
            )));
        }
        if e.aggregate_id != stream.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "loaded stream {stream} contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::Utc;
    use fieldstock_catalog::{CreatePart, Part, PartCategory, PartCommand, PartId, UpdatePart};
    use fieldstock_core::{Money, UserId};

    fn create(part_id: PartId) -> PartCommand {
        PartCommand::CreatePart(CreatePart {
            part_id,
            sku: "FLT-20".to_string(),
            name: "Air filter".to_string(),
            category: PartCategory::Part,
            is_serialized: false,
            unit_cost: Money::from_cents(1_250),
            actor: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn rename(part_id: PartId, name: &str) -> PartCommand {
        PartCommand::UpdatePart(UpdatePart {
            part_id,
            name: Some(name.to_string()),
            unit_cost: None,
            actor: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn commit_persists_and_reload_rehydrates() {
        let store = InMemoryEventStore::new();
        let part_id = PartId::generate();

        let mut uow = UnitOfWork::new(&store);
        let mut part: Part = uow.load(part_id).await.unwrap();
        uow.execute(&mut part, create(part_id)).unwrap();
        assert!(part.exists());
        assert_eq!(uow.commit().await.unwrap().len(), 1);

        let mut uow = UnitOfWork::new(&store);
        let part: Part = uow.load(part_id).await.unwrap();
        assert_eq!(part.name(), "Air filter");
    }

    #[tokio::test]
    async fn dropped_unit_of_work_writes_nothing() {
        let store = InMemoryEventStore::new();
        let part_id = PartId::generate();
        {
            let mut uow = UnitOfWork::new(&store);
            let mut part: Part = uow.load(part_id).await.unwrap();
            uow.execute(&mut part, create(part_id)).unwrap();
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stale_read_conflicts() {
        let store = InMemoryEventStore::new();
        let part_id = PartId::generate();
        let mut uow = UnitOfWork::new(&store);
        let mut part: Part = uow.load(part_id).await.unwrap();
        uow.execute(&mut part, create(part_id)).unwrap();
        uow.commit().await.unwrap();

        let mut first = UnitOfWork::new(&store);
        let mut a: Part = first.load(part_id).await.unwrap();
        let mut second = UnitOfWork::new(&store);
        let mut b: Part = second.load(part_id).await.unwrap();

        first.execute(&mut a, rename(part_id, "Pleated filter")).unwrap();
        second.execute(&mut b, rename(part_id, "Carbon filter")).unwrap();
        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_concurrency());
    }

    #[tokio::test]
    async fn load_into_reuses_the_cached_aggregate() {
        let store = InMemoryEventStore::new();
        let part_id = PartId::generate();
        let mut uow = UnitOfWork::new(&store);
        let mut cache: HashMap<PartId, Part> = HashMap::new();

        let part = uow.load_into(&mut cache, part_id).await.unwrap();
        uow.execute(part, create(part_id)).unwrap();
        let again = uow.load_into(&mut cache, part_id).await.unwrap();
        assert!(again.exists());
        assert_eq!(uow.staged_count(), 1);
    }

    #[tokio::test]
    async fn loading_a_stream_twice_is_refused() {
        let store = InMemoryEventStore::new();
        let part_id = PartId::generate();
        let mut uow = UnitOfWork::new(&store);
        let _first: Part = uow.load(part_id).await.unwrap();
        assert!(uow.load::<Part>(part_id).await.is_err());
    }
}
