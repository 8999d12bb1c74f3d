//! Read models maintained inline with commits.
//!
//! All projections are:
//! - **Rebuildable**: `rebuild` replays the full log
//! - **Consistent with writes**: applied inside the commit, never from the bus

pub mod movement_history;
pub mod snapshot;
pub mod stock_levels;

use std::sync::Arc;

use fieldstock_assets::SerializedUnit;
use fieldstock_catalog::{Part, StockLocation};
use fieldstock_fulfillment::JobStaging;
use fieldstock_purchasing::PurchaseOrder;
use fieldstock_requests::PartsRequest;

use crate::event_store::{EventStore, EventStoreError, InlineProjection};

pub use movement_history::{
    MovementFilter, MovementHistoryProjection, MovementPage, MovementRecord, Pagination,
};
pub use snapshot::SnapshotProjection;
pub use stock_levels::{StockLevel, StockLevelsProjection, StockLevelsTable};

/// The read models the procurement operations query.
#[derive(Default)]
pub struct Projections {
    pub parts: Arc<SnapshotProjection<Part>>,
    pub locations: Arc<SnapshotProjection<StockLocation>>,
    pub units: Arc<SnapshotProjection<SerializedUnit>>,
    pub orders: Arc<SnapshotProjection<PurchaseOrder>>,
    pub requests: Arc<SnapshotProjection<PartsRequest>>,
    pub stagings: Arc<SnapshotProjection<JobStaging>>,
    pub stock: Arc<StockLevelsProjection>,
    pub history: Arc<MovementHistoryProjection>,
}

impl Projections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything to register with a store.
    pub fn inline(&self) -> Vec<Arc<dyn InlineProjection>> {
        vec![
            self.parts.clone(),
            self.locations.clone(),
            self.units.clone(),
            self.orders.clone(),
            self.requests.clone(),
            self.stagings.clone(),
            self.stock.clone(),
            self.history.clone(),
        ]
    }

    /// Drop all state and replay the store's log.
    pub async fn rebuild<S: EventStore + ?Sized>(&self, store: &S) -> Result<usize, EventStoreError> {
        let events = store.load_all().await?;
        for projection in self.inline() {
            projection.reset();
            projection.apply(&events);
        }
        tracing::info!(events = events.len(), "projections rebuilt");
        Ok(events.len())
    }
}
