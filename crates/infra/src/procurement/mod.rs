//! Procurement operations: the application layer over the domain crates.
//!
//! Every mutating operation follows the same shape:
//!
//! ```text
//! with_retry ──► UnitOfWork::load (each stream it reads)
//!            ──► UnitOfWork::execute (one command per affected aggregate)
//!            ──► UnitOfWork::commit (one atomic, read-validated batch)
//! ```
//!
//! A concurrency conflict re-runs the whole attempt from a fresh read, so clamps and
//! stock checks are always evaluated against the state being written over. Queries
//! read the inline projections and never touch the streams.

mod assets;
mod catalog;
mod ledger;
mod purchasing;
mod receiving;
mod requests;
mod transfers;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use fieldstock_catalog::{LocationId, Part, PartId, StockLocation};
use fieldstock_core::TaxRate;
use fieldstock_events::{EventBus, EventEnvelope};

use crate::error::{OperationError, OperationResult};
use crate::event_store::{
    EventStore, InMemoryEventStore, PostgresEventStore, PublishingEventStore,
};
use crate::projections::{Projections, StockLevelsTable};
use crate::unit_of_work::UnitOfWork;

pub use assets::{UnitFilter, UnitStatusChange};
pub use catalog::{NewLocation, NewPart, PartChanges};
pub use ledger::NewMovement;
pub use purchasing::{LineChanges, NewPurchaseOrder, OrderLineInput};
pub use receiving::{ReceiptLineResult, ReceiptResult};
pub use requests::NewRequest;
pub use transfers::{PickupResult, ReleaseResult, TransferRequest, TransferResult};

/// Tunables of the procurement operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcurementSettings {
    /// Open requests waiting strictly longer than this many days breach the SLA.
    pub sla_days: i64,
    /// Tax rate for new purchase orders that do not name one.
    pub default_tax_rate: TaxRate,
    pub po_prefix: String,
    pub po_start: u64,
    /// Attempts after the first one when a commit loses a concurrency race.
    pub max_conflict_retries: u32,
}

impl Default for ProcurementSettings {
    fn default() -> Self {
        Self {
            sla_days: 5,
            default_tax_rate: TaxRate::ZERO,
            po_prefix: "PO-".to_string(),
            po_start: 100,
            max_conflict_retries: 3,
        }
    }
}

/// Facade over the event store and read models.
///
/// Cheap to clone; clones share the store and projections.
pub struct Procurement<S: ?Sized = dyn EventStore> {
    store: Arc<S>,
    projections: Arc<Projections>,
    settings: ProcurementSettings,
}

impl<S: ?Sized> Clone for Procurement<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            projections: self.projections.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl Procurement<InMemoryEventStore> {
    /// In-memory store without publication. Used by tests and benchmarks.
    pub fn in_memory(settings: ProcurementSettings) -> Self {
        let projections = Arc::new(Projections::new());
        let store = Arc::new(InMemoryEventStore::with_projections(projections.inline()));
        Self::new(store, projections, settings)
    }
}

impl Procurement<dyn EventStore> {
    /// In-memory store publishing committed events to `bus`.
    pub fn in_memory_with_bus<B>(settings: ProcurementSettings, bus: B) -> Self
    where
        B: EventBus<EventEnvelope<JsonValue>> + 'static,
    {
        let projections = Arc::new(Projections::new());
        let inner = InMemoryEventStore::with_projections(projections.inline());
        let store: Arc<dyn EventStore> = Arc::new(PublishingEventStore::new(inner, bus));
        Self::new(store, projections, settings)
    }

    /// Postgres store publishing committed events to `bus`.
    ///
    /// Installs the schema and rebuilds the in-process read models from the log. The
    /// read models are process-local, so one writer process per database is assumed.
    pub async fn postgres<B>(
        database_url: &str,
        settings: ProcurementSettings,
        bus: B,
    ) -> OperationResult<Self>
    where
        B: EventBus<EventEnvelope<JsonValue>> + 'static,
    {
        let projections = Arc::new(Projections::new());
        let inner = PostgresEventStore::connect(database_url)
            .await?
            .with_sql_projection(Arc::new(StockLevelsTable))
            .with_projections(projections.inline());
        inner.ensure_schema().await?;
        projections.rebuild(&inner).await?;

        let store: Arc<dyn EventStore> = Arc::new(PublishingEventStore::new(inner, bus));
        Ok(Self::new(store, projections, settings))
    }
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    pub fn new(store: Arc<S>, projections: Arc<Projections>, settings: ProcurementSettings) -> Self {
        Self {
            store,
            projections,
            settings,
        }
    }

    pub fn settings(&self) -> &ProcurementSettings {
        &self.settings
    }

    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn unit_of_work(&self) -> UnitOfWork<'_, S> {
        UnitOfWork::new(&*self.store)
    }

    /// Run `attempt` until it succeeds, fails for a reason other than a lost race, or
    /// the retry budget is spent.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> OperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OperationResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(err) if err.is_concurrency() && retries < self.settings.max_conflict_retries => {
                    retries += 1;
                    tracing::warn!(operation, retry = retries, error = %err.message, "concurrency conflict; retrying");
                }
                Err(err) if err.is_concurrency() => {
                    tracing::warn!(operation, retries, "concurrency conflict; giving up");
                    return Err(OperationError::conflict(format!(
                        "{operation} kept conflicting with concurrent changes; try again"
                    )));
                }
                other => return other,
            }
        }
    }
}

/// Load a part that must exist.
async fn existing_part<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    part_id: PartId,
) -> OperationResult<Part> {
    let part: Part = uow.load(part_id).await?;
    if !part.exists() {
        return Err(OperationError::not_found(format!("part {part_id}")));
    }
    Ok(part)
}

/// Load a location stock may move into or out of. Inactive locations count as missing.
async fn usable_location<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    location_id: LocationId,
) -> OperationResult<StockLocation> {
    let location: StockLocation = uow.load(location_id).await?;
    if !location.is_usable() {
        return Err(OperationError::not_found(format!("location {location_id}")));
    }
    Ok(location)
}

/// Load every distinct location in `ids`, all of which must be usable.
async fn usable_locations<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    ids: impl IntoIterator<Item = LocationId>,
) -> OperationResult<BTreeMap<LocationId, StockLocation>> {
    let mut locations = BTreeMap::new();
    for location_id in ids.into_iter().collect::<BTreeSet<_>>() {
        let location = usable_location(uow, location_id).await?;
        locations.insert(location_id, location);
    }
    Ok(locations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_stop_after_the_budget() {
        let procurement = Procurement::in_memory(ProcurementSettings {
            max_conflict_retries: 2,
            ..ProcurementSettings::default()
        });
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: OperationResult<()> = procurement
            .with_retry("test", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(OperationError::new(ErrorKind::Concurrency, "stale"))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.starts_with("test kept conflicting"));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let procurement = Procurement::in_memory(ProcurementSettings::default());
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: OperationResult<()> = procurement
            .with_retry("test", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(OperationError::validation("bad input"))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind, ErrorKind::Validation);
    }
}
