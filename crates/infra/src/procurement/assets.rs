//! Serialized unit lookups and lifecycle changes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_assets::{
    ChangeUnitStatus, SerializedUnit, UnitCommand, UnitEvent, UnitId, UnitStatus,
};
use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::UserId;
use fieldstock_inventory::{
    LedgerCommand, MovementId, MovementReference, MovementType, PartLedger, PostMovement,
    StockBucket,
};

use super::{Procurement, usable_location};
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFilter {
    pub status: Option<UnitStatus>,
    /// Case-insensitive match on serial number, equipment reference or order number.
    pub search: Option<String>,
    pub part_id: Option<PartId>,
    pub location_id: Option<LocationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatusChange {
    pub status: UnitStatus,
    /// Required when installing.
    #[serde(default)]
    pub equipment_ref: Option<String>,
    /// Where a unit without a location comes back into stock.
    #[serde(default)]
    pub location: Option<LocationId>,
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    /// Move a unit through its lifecycle, keeping the ledger in step.
    ///
    /// Installing takes the unit out of general stock at its location; bringing an
    /// installed or away unit back puts it into general stock at the given location.
    /// Other changes leave quantities alone.
    #[instrument(skip_all, fields(%unit_id, status = %change.status, %actor))]
    pub async fn change_unit_status(
        &self,
        unit_id: UnitId,
        change: UnitStatusChange,
        actor: UserId,
    ) -> OperationResult<SerializedUnit> {
        let change = &change;
        self.with_retry("change_unit_status", move || async move {
            let now = Utc::now();
            let mut uow = self.unit_of_work();
            let mut unit: SerializedUnit = uow.load(unit_id).await?;
            if !unit.exists() {
                return Err(OperationError::not_found(format!("serialized unit {unit_id}")));
            }
            let Some(part_id) = unit.part_id() else {
                return Err(OperationError::internal(format!(
                    "serialized unit {unit_id} has no part"
                )));
            };
            if let Some(location_id) = change.location {
                usable_location(&mut uow, location_id).await?;
            }

            let prior_location = unit.location();
            let events = uow.execute(
                &mut unit,
                UnitCommand::ChangeUnitStatus(ChangeUnitStatus {
                    unit_id,
                    status: change.status,
                    equipment_ref: change.equipment_ref.clone(),
                    location: change.location,
                    actor,
                    occurred_at: now,
                }),
            )?;
            let Some(UnitEvent::UnitStatusChanged(changed)) = events.into_iter().next() else {
                return Err(OperationError::internal("status change recorded nothing"));
            };

            let (movement_type, from, to) = match (prior_location, unit.location()) {
                (Some(before), None) => (MovementType::Installation, Some(before), None),
                (None, Some(after)) => (MovementType::Return, None, Some(after)),
                _ => {
                    uow.commit().await?;
                    tracing::info!(from = %changed.from, to = %changed.to, "unit status changed");
                    return Ok(unit);
                }
            };

            let mut ledger: PartLedger = uow.load(part_id).await?;
            uow.execute(
                &mut ledger,
                LedgerCommand::PostMovement(PostMovement {
                    movement_id: MovementId::generate(),
                    part_id,
                    movement_type,
                    quantity: 1,
                    from: from.map(StockBucket::general),
                    to: to.map(StockBucket::general),
                    serial_numbers: vec![unit.serial_number().to_string()],
                    reference: Some(MovementReference::Unit {
                        unit_id: unit_id.aggregate_id(),
                    }),
                    actor,
                    notes: changed.equipment_ref.clone(),
                    occurred_at: now,
                }),
            )?;
            uow.commit().await?;

            tracing::info!(from = %changed.from, to = %changed.to, %movement_type, "unit status changed");
            Ok(unit)
        })
        .await
    }

    pub fn get_unit(&self, unit_id: UnitId) -> OperationResult<SerializedUnit> {
        self.projections
            .units
            .get(&unit_id)
            .filter(|u| u.exists())
            .ok_or_else(|| OperationError::not_found(format!("serialized unit {unit_id}")))
    }

    /// Units matching every given criterion, ordered by serial number.
    pub fn list_units(&self, filter: &UnitFilter) -> Vec<SerializedUnit> {
        let needle = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let mut units = self.projections.units.list(|u| {
            u.exists()
                && filter.status.is_none_or(|s| u.status() == s)
                && filter.part_id.is_none_or(|p| u.part_id() == Some(p))
                && filter.location_id.is_none_or(|l| u.location() == Some(l))
                && needle.is_none_or(|n| u.matches_search(n))
        });
        units.sort_by(|a, b| a.serial_number().cmp(b.serial_number()));
        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event_store::InMemoryEventStore;
    use crate::procurement::{NewLocation, NewPart, NewPurchaseOrder, OrderLineInput, ProcurementSettings};
    use fieldstock_catalog::LocationType;
    use fieldstock_core::{Money, VendorId};
    use fieldstock_purchasing::ReceiptLineInput;

    struct Fixture {
        procurement: Procurement<InMemoryEventStore>,
        actor: UserId,
        part: PartId,
        warehouse: LocationId,
        units: Vec<UnitId>,
    }

    /// Two compressors, SN-A and SN-B, received into W1.
    async fn received_units() -> Fixture {
        let procurement = Procurement::in_memory(ProcurementSettings::default());
        let actor = UserId::new();
        let part = procurement
            .create_part(
                NewPart {
                    sku: "CMP-3T".to_string(),
                    name: "Compressor 3 ton".to_string(),
                    category: Default::default(),
                    is_serialized: true,
                    unit_cost: Money::from_cents(48_000),
                },
                actor,
            )
            .await
            .unwrap()
            .id_typed();
        let warehouse = procurement
            .create_location(
                NewLocation {
                    name: "W1".to_string(),
                    location_type: LocationType::Warehouse,
                    assigned_technician: None,
                },
                actor,
            )
            .await
            .unwrap()
            .id_typed();
        let order_id = procurement
            .create_purchase_order(
                NewPurchaseOrder {
                    vendor_id: VendorId::new(),
                    order_date: None,
                    expected_delivery: None,
                    source: Default::default(),
                    tax_rate: None,
                    shipping: Money::ZERO,
                    notes: None,
                    lines: vec![OrderLineInput {
                        part_id: part,
                        description: None,
                        quantity: 2,
                        unit_price: None,
                        job_id: None,
                        request: None,
                    }],
                    request_ids: vec![],
                },
                actor,
            )
            .await
            .unwrap()
            .id_typed();
        procurement.submit_purchase_order(order_id, actor).await.unwrap();
        procurement.approve_purchase_order(order_id, actor).await.unwrap();
        let receipt = procurement
            .receive_goods(
                order_id,
                vec![ReceiptLineInput {
                    line_no: 1,
                    quantity: 2,
                    location: Some(warehouse),
                    serial_numbers: vec!["SN-A".to_string(), "SN-B".to_string()],
                    ..Default::default()
                }],
                actor,
            )
            .await
            .unwrap();
        Fixture {
            procurement,
            actor,
            part,
            warehouse,
            units: receipt.lines[0].unit_ids.clone(),
        }
    }

    fn install(equipment: &str) -> UnitStatusChange {
        UnitStatusChange {
            status: UnitStatus::Installed,
            equipment_ref: Some(equipment.to_string()),
            location: None,
        }
    }

    #[tokio::test]
    async fn installing_removes_the_unit_from_stock() {
        let f = received_units().await;
        let unit = f
            .procurement
            .change_unit_status(f.units[0], install("RTU-7 rooftop"), f.actor)
            .await
            .unwrap();

        assert_eq!(unit.location(), None);
        assert_eq!(f.procurement.quantity_at(f.part, f.warehouse), 1);
        let installed = f.procurement.list_units(&UnitFilter {
            search: Some("rtu-7".to_string()),
            ..Default::default()
        });
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].serial_number(), "SN-A");
    }

    #[tokio::test]
    async fn returning_an_installed_unit_needs_a_location_and_restocks_it() {
        let f = received_units().await;
        f.procurement
            .change_unit_status(f.units[0], install("RTU-7"), f.actor)
            .await
            .unwrap();

        let returned = |location| UnitStatusChange {
            status: UnitStatus::Returned,
            equipment_ref: None,
            location,
        };
        let err = f
            .procurement
            .change_unit_status(f.units[0], returned(None), f.actor)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        f.procurement
            .change_unit_status(f.units[0], returned(Some(f.warehouse)), f.actor)
            .await
            .unwrap();
        assert_eq!(f.procurement.quantity_at(f.part, f.warehouse), 2);
    }

    #[tokio::test]
    async fn marking_defective_keeps_quantities() {
        let f = received_units().await;
        let unit = f
            .procurement
            .change_unit_status(
                f.units[1],
                UnitStatusChange {
                    status: UnitStatus::Defective,
                    equipment_ref: None,
                    location: None,
                },
                f.actor,
            )
            .await
            .unwrap();

        assert_eq!(unit.status(), UnitStatus::Defective);
        assert_eq!(f.procurement.quantity_at(f.part, f.warehouse), 2);
        let defective = f.procurement.list_units(&UnitFilter {
            status: Some(UnitStatus::Defective),
            ..Default::default()
        });
        assert_eq!(defective.len(), 1);
    }

    #[tokio::test]
    async fn illegal_transitions_are_conflicts() {
        let f = received_units().await;
        let err = f
            .procurement
            .change_unit_status(
                f.units[0],
                UnitStatusChange {
                    status: UnitStatus::Returned,
                    equipment_ref: None,
                    location: None,
                },
                f.actor,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn units_list_in_serial_order() {
        let f = received_units().await;
        let serials: Vec<_> = f
            .procurement
            .list_units(&UnitFilter::default())
            .iter()
            .map(|u| u.serial_number().to_string())
            .collect();
        assert_eq!(serials, ["SN-A", "SN-B"]);
    }
}
