//! Parts, stock locations and vehicle assignments.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_catalog::{
    AssignTechnician, AssignmentCommand, ClaimVehicle, CreateLocation, CreatePart,
    DeactivateLocation, DeactivatePart, LocationCommand, LocationEvent, LocationId, LocationType,
    Part, PartCategory, PartCommand, PartId, ReactivateLocation, ReleaseVehicle, SetSerialized,
    StockLocation, UnassignTechnician, UpdatePart, VehicleAssignment,
};
use fieldstock_core::{Money, UserId};
use fieldstock_inventory::PartLedger;

use super::{Procurement, existing_part};
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPart {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub category: PartCategory,
    #[serde(default)]
    pub is_serialized: bool,
    #[serde(default)]
    pub unit_cost: Money,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartChanges {
    pub name: Option<String>,
    pub unit_cost: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLocation {
    pub name: String,
    pub location_type: LocationType,
    #[serde(default)]
    pub assigned_technician: Option<UserId>,
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    #[instrument(skip_all, fields(sku = %input.sku, %actor))]
    pub async fn create_part(&self, input: NewPart, actor: UserId) -> OperationResult<Part> {
        let input = &input;
        self.with_retry("create_part", move || self.create_part_once(input, actor))
            .await
    }

    async fn create_part_once(&self, input: &NewPart, actor: UserId) -> OperationResult<Part> {
        let sku = input.sku.trim();
        if !self
            .projections
            .parts
            .list(|p| p.sku().eq_ignore_ascii_case(sku))
            .is_empty()
        {
            return Err(OperationError::conflict(format!("a part with SKU {sku} already exists")));
        }

        let part_id = PartId::generate();
        let mut uow = self.unit_of_work();
        let mut part: Part = uow.load(part_id).await?;
        uow.execute(
            &mut part,
            PartCommand::CreatePart(CreatePart {
                part_id,
                sku: sku.to_string(),
                name: input.name.clone(),
                category: input.category,
                is_serialized: input.is_serialized,
                unit_cost: input.unit_cost,
                actor,
                occurred_at: Utc::now(),
            }),
        )?;
        uow.commit().await?;

        tracing::info!(%part_id, "part created");
        Ok(part)
    }

    #[instrument(skip_all, fields(%part_id, %actor))]
    pub async fn update_part(
        &self,
        part_id: PartId,
        changes: PartChanges,
        actor: UserId,
    ) -> OperationResult<Part> {
        let changes = &changes;
        self.with_retry("update_part", move || async move {
            let mut uow = self.unit_of_work();
            let mut part = existing_part(&mut uow, part_id).await?;
            uow.execute(
                &mut part,
                PartCommand::UpdatePart(UpdatePart {
                    part_id,
                    name: changes.name.clone(),
                    unit_cost: changes.unit_cost,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(part)
        })
        .await
    }

    /// Toggle the serialized flag. Refused once the part has any ledger history.
    #[instrument(skip_all, fields(%part_id, %actor))]
    pub async fn set_serialized(
        &self,
        part_id: PartId,
        is_serialized: bool,
        actor: UserId,
    ) -> OperationResult<Part> {
        self.with_retry("set_serialized", move || async move {
            let mut uow = self.unit_of_work();
            let mut part = existing_part(&mut uow, part_id).await?;
            // Read in the same commit so a concurrent first receipt forces a retry.
            let ledger: PartLedger = uow.load(part_id).await?;
            uow.execute(
                &mut part,
                PartCommand::SetSerialized(SetSerialized {
                    part_id,
                    is_serialized,
                    has_stock_history: ledger.has_history(),
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(part)
        })
        .await
    }

    #[instrument(skip_all, fields(%part_id, %actor))]
    pub async fn deactivate_part(&self, part_id: PartId, actor: UserId) -> OperationResult<Part> {
        self.with_retry("deactivate_part", move || async move {
            let mut uow = self.unit_of_work();
            let mut part = existing_part(&mut uow, part_id).await?;
            uow.execute(
                &mut part,
                PartCommand::DeactivatePart(DeactivatePart {
                    part_id,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(part)
        })
        .await
    }

    pub fn get_part(&self, part_id: PartId) -> OperationResult<Part> {
        self.projections
            .parts
            .get(&part_id)
            .filter(|p| p.exists())
            .ok_or_else(|| OperationError::not_found(format!("part {part_id}")))
    }

    /// Parts sorted by SKU.
    pub fn list_parts(&self, include_inactive: bool) -> Vec<Part> {
        let mut parts = self
            .projections
            .parts
            .list(|p| p.exists() && (include_inactive || p.is_active()));
        parts.sort_by(|a, b| a.sku().cmp(b.sku()));
        parts
    }

    #[instrument(skip_all, fields(name = %input.name, %actor))]
    pub async fn create_location(
        &self,
        input: NewLocation,
        actor: UserId,
    ) -> OperationResult<StockLocation> {
        let input = &input;
        self.with_retry("create_location", move || async move {
            let location_id = LocationId::generate();
            let mut uow = self.unit_of_work();
            let mut location: StockLocation = uow.load(location_id).await?;
            uow.execute(
                &mut location,
                LocationCommand::CreateLocation(CreateLocation {
                    location_id,
                    name: input.name.clone(),
                    location_type: input.location_type,
                    assigned_technician: input.assigned_technician,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            if let Some(technician) = input.assigned_technician {
                claim_vehicle(&mut uow, technician, location_id).await?;
            }
            uow.commit().await?;

            tracing::info!(%location_id, "location created");
            Ok(location)
        })
        .await
    }

    /// Put `technician` on a vehicle. Replacing a different technician needs `reassign`.
    #[instrument(skip_all, fields(%location_id, %technician, %actor))]
    pub async fn assign_technician(
        &self,
        location_id: LocationId,
        technician: UserId,
        reassign: bool,
        actor: UserId,
    ) -> OperationResult<StockLocation> {
        self.with_retry("assign_technician", move || async move {
            let mut uow = self.unit_of_work();
            let mut location = existing_location(&mut uow, location_id).await?;
            let events = uow.execute(
                &mut location,
                LocationCommand::AssignTechnician(AssignTechnician {
                    location_id,
                    technician,
                    reassign,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;

            for event in events {
                if let LocationEvent::TechnicianAssigned(assigned) = event {
                    claim_vehicle(&mut uow, technician, location_id).await?;
                    if let Some(previous) = assigned.previous {
                        release_vehicle(&mut uow, previous, location_id).await?;
                    }
                }
            }
            uow.commit().await?;
            Ok(location)
        })
        .await
    }

    #[instrument(skip_all, fields(%location_id, %actor))]
    pub async fn unassign_technician(
        &self,
        location_id: LocationId,
        actor: UserId,
    ) -> OperationResult<StockLocation> {
        self.with_retry("unassign_technician", move || async move {
            let mut uow = self.unit_of_work();
            let mut location = existing_location(&mut uow, location_id).await?;
            let events = uow.execute(
                &mut location,
                LocationCommand::UnassignTechnician(UnassignTechnician {
                    location_id,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            for event in events {
                if let LocationEvent::TechnicianUnassigned(e) = event {
                    release_vehicle(&mut uow, e.technician, location_id).await?;
                }
            }
            uow.commit().await?;
            Ok(location)
        })
        .await
    }

    #[instrument(skip_all, fields(%location_id, %actor))]
    pub async fn deactivate_location(
        &self,
        location_id: LocationId,
        actor: UserId,
    ) -> OperationResult<StockLocation> {
        self.with_retry("deactivate_location", move || async move {
            let mut uow = self.unit_of_work();
            let mut location = existing_location(&mut uow, location_id).await?;
            uow.execute(
                &mut location,
                LocationCommand::DeactivateLocation(DeactivateLocation {
                    location_id,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(location)
        })
        .await
    }

    #[instrument(skip_all, fields(%location_id, %actor))]
    pub async fn reactivate_location(
        &self,
        location_id: LocationId,
        actor: UserId,
    ) -> OperationResult<StockLocation> {
        self.with_retry("reactivate_location", move || async move {
            let mut uow = self.unit_of_work();
            let mut location = existing_location(&mut uow, location_id).await?;
            uow.execute(
                &mut location,
                LocationCommand::ReactivateLocation(ReactivateLocation {
                    location_id,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(location)
        })
        .await
    }

    pub fn get_location(&self, location_id: LocationId) -> OperationResult<StockLocation> {
        self.projections
            .locations
            .get(&location_id)
            .filter(|l| l.exists())
            .ok_or_else(|| OperationError::not_found(format!("location {location_id}")))
    }

    /// Locations sorted by name, optionally of one type.
    pub fn list_locations(&self, location_type: Option<LocationType>) -> Vec<StockLocation> {
        let mut locations = self
            .projections
            .locations
            .list(|l| l.exists() && location_type.is_none_or(|t| l.location_type() == t));
        locations.sort_by(|a, b| a.name().cmp(b.name()));
        locations
    }

    /// The active vehicle `technician` is assigned to.
    pub fn vehicle_for(&self, technician: UserId) -> Option<StockLocation> {
        self.projections
            .locations
            .list(|l| l.is_usable() && l.assigned_technician() == Some(technician))
            .into_iter()
            .next()
    }
}

async fn existing_location<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    location_id: LocationId,
) -> OperationResult<StockLocation> {
    let location: StockLocation = uow.load(location_id).await?;
    if !location.exists() {
        return Err(OperationError::not_found(format!("location {location_id}")));
    }
    Ok(location)
}

async fn claim_vehicle<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    technician: UserId,
    vehicle: LocationId,
) -> OperationResult<()> {
    let mut assignment: VehicleAssignment = uow.load(technician).await?;
    uow.execute(
        &mut assignment,
        AssignmentCommand::ClaimVehicle(ClaimVehicle {
            technician,
            vehicle,
            occurred_at: Utc::now(),
        }),
    )?;
    Ok(())
}

async fn release_vehicle<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    technician: UserId,
    vehicle: LocationId,
) -> OperationResult<()> {
    let mut assignment: VehicleAssignment = uow.load(technician).await?;
    uow.execute(
        &mut assignment,
        AssignmentCommand::ReleaseVehicle(ReleaseVehicle {
            technician,
            vehicle,
            occurred_at: Utc::now(),
        }),
    )?;
    Ok(())
}
