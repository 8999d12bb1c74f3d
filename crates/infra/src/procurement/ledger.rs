//! Direct stock movements and stock queries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::{JobId, UserId};
use fieldstock_inventory::{
    LedgerCommand, LedgerEvent, MovementId, MovementPosted, MovementType, PartLedger, PostMovement,
    StockBucket,
};

use super::{Procurement, existing_part, usable_locations};
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;
use crate::projections::{MovementFilter, MovementPage, Pagination, StockLevel};

/// A manual movement of a non-serialized part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub part_id: PartId,
    pub movement_type: MovementType,
    pub quantity: i64,
    #[serde(default)]
    pub from: Option<StockBucket>,
    #[serde(default)]
    pub to: Option<StockBucket>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    /// Post one ledger entry.
    ///
    /// Serialized parts are refused here: their stock only moves together with the
    /// units, through transfers, pickups and unit status changes.
    #[instrument(skip_all, fields(part_id = %input.part_id, movement_type = %input.movement_type, quantity = input.quantity, %actor))]
    pub async fn post_movement(&self, input: NewMovement, actor: UserId) -> OperationResult<MovementPosted> {
        let input = &input;
        self.with_retry("post_movement", move || async move {
            let mut uow = self.unit_of_work();
            let part = existing_part(&mut uow, input.part_id).await?;
            if part.is_serialized() {
                return Err(OperationError::validation(format!(
                    "part {} is serialized; move its units instead",
                    part.sku()
                )));
            }
            let endpoints = input.from.iter().chain(input.to.iter()).map(|b| b.location);
            usable_locations(&mut uow, endpoints).await?;

            let mut ledger: PartLedger = uow.load(input.part_id).await?;
            let events = uow.execute(
                &mut ledger,
                LedgerCommand::PostMovement(PostMovement {
                    movement_id: MovementId::generate(),
                    part_id: input.part_id,
                    movement_type: input.movement_type,
                    quantity: input.quantity,
                    from: input.from,
                    to: input.to,
                    serial_numbers: Vec::new(),
                    reference: None,
                    actor,
                    notes: input.notes.clone(),
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;

            let LedgerEvent::MovementPosted(posted) = events
                .into_iter()
                .next()
                .ok_or_else(|| OperationError::internal("ledger accepted the movement but recorded nothing"))?;
            tracing::info!(movement_id = %posted.movement_id, "movement posted");
            Ok(posted)
        })
        .await
    }

    /// General (unreserved) stock of a part at a location.
    pub fn quantity_at(&self, part_id: PartId, location_id: LocationId) -> i64 {
        self.projections.stock.quantity_at(part_id, location_id)
    }

    /// Stock of a part at a location held for a job.
    pub fn reserved_at(&self, part_id: PartId, location_id: LocationId, job_id: JobId) -> i64 {
        self.projections.stock.reserved_at(part_id, location_id, job_id)
    }

    pub fn stock_levels(&self, part_id: Option<PartId>, location_id: Option<LocationId>) -> Vec<StockLevel> {
        self.projections.stock.levels(part_id, location_id)
    }

    /// Ledger entries, most recent first.
    pub fn movement_history(&self, filter: &MovementFilter, pagination: Pagination) -> MovementPage {
        self.projections.history.query(filter, pagination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event_store::InMemoryEventStore;
    use crate::procurement::{NewLocation, NewPart, ProcurementSettings};
    use fieldstock_catalog::LocationType;
    use fieldstock_core::Money;

    async fn setup(serialized: bool) -> (Procurement<InMemoryEventStore>, PartId, LocationId, UserId) {
        let procurement = Procurement::in_memory(ProcurementSettings::default());
        let actor = UserId::new();
        let part = procurement
            .create_part(
                NewPart {
                    sku: "REFR-410A".to_string(),
                    name: "R-410A 25lb".to_string(),
                    category: Default::default(),
                    is_serialized: serialized,
                    unit_cost: Money::from_cents(18_000),
                },
                actor,
            )
            .await
            .unwrap();
        let warehouse = procurement
            .create_location(
                NewLocation {
                    name: "Main warehouse".to_string(),
                    location_type: LocationType::Warehouse,
                    assigned_technician: None,
                },
                actor,
            )
            .await
            .unwrap();
        (procurement, part.id_typed(), warehouse.id_typed(), actor)
    }

    fn movement(part_id: PartId, kind: MovementType, quantity: i64, from: Option<LocationId>, to: Option<LocationId>) -> NewMovement {
        NewMovement {
            part_id,
            movement_type: kind,
            quantity,
            from: from.map(StockBucket::general),
            to: to.map(StockBucket::general),
            notes: None,
        }
    }

    #[tokio::test]
    async fn adjustments_and_disposals_track_quantity() {
        let (procurement, part, w1, actor) = setup(false).await;
        procurement
            .post_movement(movement(part, MovementType::Adjustment, 8, None, Some(w1)), actor)
            .await
            .unwrap();
        procurement
            .post_movement(movement(part, MovementType::Disposal, 3, Some(w1), None), actor)
            .await
            .unwrap();

        assert_eq!(procurement.quantity_at(part, w1), 5);
        let page = procurement.movement_history(
            &MovementFilter {
                part_id: Some(part),
                ..Default::default()
            },
            Pagination::default(),
        );
        assert_eq!(page.total, 2);
        assert_eq!(page.movements[0].movement_type, MovementType::Disposal);
    }

    #[tokio::test]
    async fn insufficient_stock_is_refused_and_nothing_is_written() {
        let (procurement, part, w1, actor) = setup(false).await;
        let err = procurement
            .post_movement(movement(part, MovementType::Disposal, 1, Some(w1), None), actor)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(procurement.movement_history(&MovementFilter::default(), Pagination::default()).movements.is_empty());
    }

    #[tokio::test]
    async fn serialized_parts_cannot_be_posted_directly() {
        let (procurement, part, w1, actor) = setup(true).await;
        let err = procurement
            .post_movement(movement(part, MovementType::Adjustment, 1, None, Some(w1)), actor)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn inactive_locations_are_not_found() {
        let (procurement, part, w1, actor) = setup(false).await;
        procurement.deactivate_location(w1, actor).await.unwrap();
        let err = procurement
            .post_movement(movement(part, MovementType::Adjustment, 1, None, Some(w1)), actor)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
