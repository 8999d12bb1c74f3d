//! Transfers between locations and the staging → vehicle pickup flow.
//!
//! Serialized stock moves with its units: every ledger entry for a serialized part
//! names the serial numbers it moved, and each of those units is relocated in the same
//! commit.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_assets::{RelocateUnit, SerializedUnit, UnitCommand, UnitId};
use fieldstock_catalog::{LocationId, LocationType, PartId, VehicleAssignment};
use fieldstock_core::{JobId, UserId};
use fieldstock_fulfillment::{
    AssignJobTechnician, JobStaging, PickList, PickUp, PickupGroup, ReleaseItems, StagedItem,
    StagingCommand, parts_ready_for_pickup,
};
use fieldstock_inventory::{
    LedgerCommand, MovementId, MovementReference, MovementType, PartLedger, PostMovement,
    StockBucket,
};

use super::{Procurement, existing_part, usable_location, usable_locations};
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub part_id: PartId,
    pub from: LocationId,
    pub to: LocationId,
    pub quantity: i64,
    /// Required for serialized parts: exactly `quantity` units at `from`.
    #[serde(default)]
    pub unit_ids: Vec<UnitId>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub movement_id: MovementId,
    pub part_id: PartId,
    pub from: LocationId,
    pub to: LocationId,
    pub quantity: i64,
    pub serial_numbers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupResult {
    pub job_id: JobId,
    pub destination: LocationId,
    pub items_transferred: usize,
    pub item_nos: Vec<u32>,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub job_id: JobId,
    pub items_released: usize,
    pub quantity: i64,
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    /// Move general stock from one location to another.
    #[instrument(skip_all, fields(part_id = %request.part_id, from = %request.from, to = %request.to, quantity = request.quantity, %actor))]
    pub async fn transfer(&self, request: TransferRequest, actor: UserId) -> OperationResult<TransferResult> {
        let request = &request;
        self.with_retry("transfer", move || self.transfer_once(request, actor)).await
    }

    async fn transfer_once(&self, request: &TransferRequest, actor: UserId) -> OperationResult<TransferResult> {
        if request.from == request.to {
            return Err(OperationError::validation(
                "transfer source and destination must be different locations",
            ));
        }
        let now = Utc::now();
        let mut uow = self.unit_of_work();
        let part = existing_part(&mut uow, request.part_id).await?;
        usable_locations(&mut uow, [request.from, request.to]).await?;

        let serial_numbers = if part.is_serialized() {
            if request.unit_ids.len() as i64 != request.quantity {
                return Err(OperationError::validation(format!(
                    "expected {} units, got {}",
                    request.quantity,
                    request.unit_ids.len()
                )));
            }
            let mut serials = Vec::with_capacity(request.unit_ids.len());
            for &unit_id in request.unit_ids.iter().collect::<BTreeSet<_>>() {
                let mut unit = transferable_unit(&mut uow, unit_id, request.part_id, request.from).await?;
                serials.push(unit.serial_number().to_string());
                relocate(&mut uow, &mut unit, request.to, None, actor, now)?;
            }
            if serials.len() != request.unit_ids.len() {
                return Err(OperationError::validation("a unit is listed more than once"));
            }
            serials
        } else {
            if !request.unit_ids.is_empty() {
                return Err(OperationError::validation(format!(
                    "part {} is not serialized; unit ids are not accepted",
                    part.sku()
                )));
            }
            Vec::new()
        };

        let movement_id = MovementId::generate();
        let mut ledger: PartLedger = uow.load(request.part_id).await?;
        uow.execute(
            &mut ledger,
            LedgerCommand::PostMovement(PostMovement {
                movement_id,
                part_id: request.part_id,
                movement_type: MovementType::Transfer,
                quantity: request.quantity,
                from: Some(StockBucket::general(request.from)),
                to: Some(StockBucket::general(request.to)),
                serial_numbers: serial_numbers.clone(),
                reference: None,
                actor,
                notes: request.notes.clone(),
                occurred_at: now,
            }),
        )?;
        uow.commit().await?;

        tracing::info!(%movement_id, "transfer committed");
        Ok(TransferResult {
            movement_id,
            part_id: request.part_id,
            from: request.from,
            to: request.to,
            quantity: request.quantity,
            serial_numbers,
        })
    }

    /// Move one serialized unit to another location (a one-unit transfer).
    #[instrument(skip_all, fields(%unit_id, %to, %actor))]
    pub async fn relocate_unit(&self, unit_id: UnitId, to: LocationId, actor: UserId) -> OperationResult<TransferResult> {
        let unit = self.get_unit(unit_id)?;
        let (Some(part_id), Some(from)) = (unit.part_id(), unit.location()) else {
            return Err(OperationError::conflict(format!(
                "unit {} is not in stock",
                unit.serial_number()
            )));
        };
        self.transfer(
            TransferRequest {
                part_id,
                from,
                to,
                quantity: 1,
                unit_ids: vec![unit_id],
                notes: None,
            },
            actor,
        )
        .await
    }

    /// Record the technician a job is assigned to (fed by the job subsystem).
    #[instrument(skip_all, fields(%job_id, %technician, %actor))]
    pub async fn assign_job_technician(
        &self,
        job_id: JobId,
        technician: UserId,
        actor: UserId,
    ) -> OperationResult<JobStaging> {
        self.with_retry("assign_job_technician", move || async move {
            let mut uow = self.unit_of_work();
            let mut staging: JobStaging = uow.load(job_id).await?;
            uow.execute(
                &mut staging,
                StagingCommand::AssignJobTechnician(AssignJobTechnician {
                    job_id,
                    technician,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(staging)
        })
        .await
    }

    /// Move everything staged for `job_id` onto a vehicle, all or nothing.
    ///
    /// The actor must have an assigned vehicle, otherwise nothing moves. Items go to
    /// that vehicle unless another vehicle location is named as the destination.
    #[instrument(skip_all, fields(%job_id, destination = ?destination, %actor))]
    pub async fn pickup_parts_for_ticket(
        &self,
        job_id: JobId,
        actor: UserId,
        destination: Option<LocationId>,
    ) -> OperationResult<PickupResult> {
        self.with_retry("pickup_parts_for_ticket", move || {
            self.pickup_once(job_id, actor, destination)
        })
        .await
    }

    async fn pickup_once(
        &self,
        job_id: JobId,
        actor: UserId,
        destination: Option<LocationId>,
    ) -> OperationResult<PickupResult> {
        let now = Utc::now();
        let mut uow = self.unit_of_work();

        let assignment: VehicleAssignment = uow.load(actor).await?;
        let vehicle = assignment.vehicle().ok_or_else(|| {
            OperationError::conflict(format!(
                "technician {actor} has no assigned vehicle; nothing was picked up"
            ))
        })?;
        let destination = destination.unwrap_or(vehicle);
        let location = usable_location(&mut uow, destination).await?;
        if location.location_type() != LocationType::Vehicle {
            return Err(OperationError::conflict(format!(
                "location {destination} is not a vehicle; nothing was picked up"
            )));
        }

        let mut staging: JobStaging = uow.load(job_id).await?;
        let pending: Vec<StagedItem> = staging.pending_items().cloned().collect();
        uow.execute(
            &mut staging,
            StagingCommand::PickUp(PickUp {
                job_id,
                destination,
                actor,
                occurred_at: now,
            }),
        )?;

        let mut ledgers: HashMap<PartId, PartLedger> = HashMap::new();
        for item in &pending {
            let serial_numbers =
                move_staged_units(&mut uow, item, destination, actor, now).await?;
            let ledger = uow.load_into(&mut ledgers, item.part_id).await?;
            uow.execute(
                ledger,
                LedgerCommand::PostMovement(PostMovement {
                    movement_id: MovementId::generate(),
                    part_id: item.part_id,
                    movement_type: MovementType::Transfer,
                    quantity: item.quantity,
                    from: Some(StockBucket::reserved(item.location, job_id)),
                    to: Some(StockBucket::general(destination)),
                    serial_numbers,
                    reference: Some(MovementReference::Job { job_id }),
                    actor,
                    notes: None,
                    occurred_at: now,
                }),
            )
            .map_err(|e| e.context(format!("item {}", item.item_no)))?;
        }
        uow.commit().await?;

        let quantity = pending.iter().map(|i| i.quantity).sum();
        tracing::info!(items = pending.len(), quantity, %destination, "staged items picked up");
        Ok(PickupResult {
            job_id,
            destination,
            items_transferred: pending.len(),
            item_nos: pending.iter().map(|i| i.item_no).collect(),
            quantity,
        })
    }

    /// Return unpicked staged items to general stock at their staging location.
    ///
    /// Used when a job is cancelled after its parts arrived.
    #[instrument(skip_all, fields(%job_id, %actor))]
    pub async fn release_staged_items(
        &self,
        job_id: JobId,
        reason: Option<String>,
        actor: UserId,
    ) -> OperationResult<ReleaseResult> {
        let reason = &reason;
        self.with_retry("release_staged_items", move || async move {
            let now = Utc::now();
            let mut uow = self.unit_of_work();
            let mut staging: JobStaging = uow.load(job_id).await?;
            let pending: Vec<StagedItem> = staging.pending_items().cloned().collect();
            uow.execute(
                &mut staging,
                StagingCommand::ReleaseItems(ReleaseItems {
                    job_id,
                    reason: reason.clone(),
                    actor,
                    occurred_at: now,
                }),
            )?;

            let mut ledgers: HashMap<PartId, PartLedger> = HashMap::new();
            for item in &pending {
                let serial_numbers =
                    move_staged_units(&mut uow, item, item.location, actor, now).await?;
                let ledger = uow.load_into(&mut ledgers, item.part_id).await?;
                uow.execute(
                    ledger,
                    LedgerCommand::PostMovement(PostMovement {
                        movement_id: MovementId::generate(),
                        part_id: item.part_id,
                        movement_type: MovementType::Return,
                        quantity: item.quantity,
                        from: Some(StockBucket::reserved(item.location, job_id)),
                        to: Some(StockBucket::general(item.location)),
                        serial_numbers,
                        reference: Some(MovementReference::Job { job_id }),
                        actor,
                        notes: reason.clone(),
                        occurred_at: now,
                    }),
                )
                .map_err(|e| e.context(format!("item {}", item.item_no)))?;
            }
            uow.commit().await?;

            let quantity = pending.iter().map(|i| i.quantity).sum();
            tracing::info!(items = pending.len(), quantity, "staged items released to general stock");
            Ok(ReleaseResult {
                job_id,
                items_released: pending.len(),
                quantity,
            })
        })
        .await
    }

    /// Pick list of one job, or `None` when nothing is waiting for pickup.
    pub fn pick_list(&self, job_id: JobId) -> Option<PickList> {
        self.projections
            .stagings
            .get(&job_id)
            .and_then(|staging| PickList::for_job(&staging))
    }

    /// Jobs with items waiting, grouped by technician; `Some` narrows to one technician.
    pub fn parts_ready_for_pickup(&self, technician: Option<UserId>) -> Vec<PickupGroup> {
        let stagings = self.projections.stagings.list(|s| s.has_pending());
        parts_ready_for_pickup(stagings.iter(), technician)
    }
}

/// A unit that may leave `from` in a transfer: right part, general stock at `from`.
async fn transferable_unit<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    unit_id: UnitId,
    part_id: PartId,
    from: LocationId,
) -> OperationResult<SerializedUnit> {
    let unit: SerializedUnit = uow.load(unit_id).await?;
    if !unit.exists() {
        return Err(OperationError::not_found(format!("serialized unit {unit_id}")));
    }
    if unit.part_id() != Some(part_id) {
        return Err(OperationError::validation(format!(
            "unit {} is not of the transferred part",
            unit.serial_number()
        )));
    }
    if unit.location() != Some(from) || unit.reserved_for().is_some() {
        return Err(OperationError::conflict(format!(
            "unit {} is not in general stock at the source location",
            unit.serial_number()
        )));
    }
    Ok(unit)
}

/// Relocate the units of a staged item into general stock at `to`; returns their serials.
async fn move_staged_units<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    item: &StagedItem,
    to: LocationId,
    actor: UserId,
    now: DateTime<Utc>,
) -> OperationResult<Vec<String>> {
    let mut serials = Vec::with_capacity(item.unit_ids.len());
    for &unit_id in &item.unit_ids {
        let mut unit: SerializedUnit = uow.load(unit_id).await?;
        if !unit.exists() {
            return Err(OperationError::not_found(format!("serialized unit {unit_id}")));
        }
        serials.push(unit.serial_number().to_string());
        relocate(uow, &mut unit, to, None, actor, now)
            .map_err(|e| e.context(format!("item {}", item.item_no)))?;
    }
    Ok(serials)
}

fn relocate<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    unit: &mut SerializedUnit,
    location: LocationId,
    reserved_for: Option<JobId>,
    actor: UserId,
    now: DateTime<Utc>,
) -> OperationResult<()> {
    let unit_id = unit.id_typed();
    uow.execute(
        unit,
        UnitCommand::RelocateUnit(RelocateUnit {
            unit_id,
            location,
            reserved_for,
            actor,
            occurred_at: now,
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event_store::InMemoryEventStore;
    use crate::procurement::{NewLocation, NewMovement, NewPart, ProcurementSettings};
    use fieldstock_catalog::LocationType;
    use fieldstock_core::Money;
    use proptest::prelude::*;

    struct Fixture {
        procurement: Procurement<InMemoryEventStore>,
        actor: UserId,
        part: PartId,
        warehouse: LocationId,
        van: LocationId,
    }

    async fn fixture(stock: i64) -> Fixture {
        let procurement = Procurement::in_memory(ProcurementSettings::default());
        let actor = UserId::new();
        let part = procurement
            .create_part(
                NewPart {
                    sku: "FUSE-30".to_string(),
                    name: "Fuse 30A".to_string(),
                    category: Default::default(),
                    is_serialized: false,
                    unit_cost: Money::from_cents(150),
                },
                actor,
            )
            .await
            .unwrap()
            .id_typed();
        let location = |name: &str, location_type| NewLocation {
            name: name.to_string(),
            location_type,
            assigned_technician: None,
        };
        let warehouse = procurement
            .create_location(location("W1", LocationType::Warehouse), actor)
            .await
            .unwrap()
            .id_typed();
        let van = procurement
            .create_location(location("V1", LocationType::Vehicle), actor)
            .await
            .unwrap()
            .id_typed();
        if stock > 0 {
            procurement
                .post_movement(
                    NewMovement {
                        part_id: part,
                        movement_type: MovementType::Adjustment,
                        quantity: stock,
                        from: None,
                        to: Some(StockBucket::general(warehouse)),
                        notes: Some("opening count".to_string()),
                    },
                    actor,
                )
                .await
                .unwrap();
        }
        Fixture {
            procurement,
            actor,
            part,
            warehouse,
            van,
        }
    }

    fn transfer(f: &Fixture, from: LocationId, to: LocationId, quantity: i64) -> TransferRequest {
        TransferRequest {
            part_id: f.part,
            from,
            to,
            quantity,
            unit_ids: vec![],
            notes: None,
        }
    }

    #[tokio::test]
    async fn transfer_moves_stock_and_refuses_overdraw() {
        let f = fixture(10).await;
        f.procurement.transfer(transfer(&f, f.warehouse, f.van, 3), f.actor).await.unwrap();
        assert_eq!(f.procurement.quantity_at(f.part, f.warehouse), 7);
        assert_eq!(f.procurement.quantity_at(f.part, f.van), 3);

        let err = f
            .procurement
            .transfer(transfer(&f, f.van, f.warehouse, 4), f.actor)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(f.procurement.quantity_at(f.part, f.van), 3);
    }

    #[tokio::test]
    async fn transfer_to_the_same_location_is_invalid() {
        let f = fixture(1).await;
        let err = f
            .procurement
            .transfer(transfer(&f, f.warehouse, f.warehouse, 1), f.actor)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn pickup_without_a_vehicle_is_refused() {
        let f = fixture(0).await;
        let err = f
            .procurement
            .pickup_parts_for_ticket(JobId::new(), f.actor, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.contains("no assigned vehicle"));
    }

    #[tokio::test]
    async fn pickup_with_nothing_staged_is_a_conflict() {
        let f = fixture(0).await;
        f.procurement
            .assign_technician(f.van, f.actor, false, f.actor)
            .await
            .unwrap();
        let err = f
            .procurement
            .pickup_parts_for_ticket(JobId::new(), f.actor, Some(f.van))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.contains("no staged items"), "{}", err.message);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 24,
            ..ProptestConfig::default()
        })]

        #[test]
        fn transfers_conserve_the_pair_total(moves in proptest::collection::vec((any::<bool>(), 1i64..8), 1..16)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let f = fixture(20).await;
                for (outbound, quantity) in moves {
                    let (from, to) = if outbound { (f.warehouse, f.van) } else { (f.van, f.warehouse) };
                    // Overdraws are refused; either way the pair total must hold.
                    let _ = f.procurement.transfer(transfer(&f, from, to, quantity), f.actor).await;
                    let total = f.procurement.quantity_at(f.part, f.warehouse)
                        + f.procurement.quantity_at(f.part, f.van);
                    prop_assert_eq!(total, 20);
                }
                Ok(())
            })?;
        }
    }
}
