use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use fieldstock_assets::{SerializedUnit, UnitStatus};
use fieldstock_catalog::{LocationId, LocationType, Part, PartId, StockLocation};
use fieldstock_core::{JobId, Money, UserId};
use fieldstock_fulfillment::JobStaging;
use fieldstock_inventory::MovementType;
use fieldstock_purchasing::{PurchaseOrder, PurchaseOrderStatus, ReceiptLineInput};
use fieldstock_requests::{PartsRequest, QueueFilter, RequestId};

use crate::app::errors;

/// Parse a path segment into a typed id, or a 400 naming what was expected.
pub fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, axum::response::Response> {
    raw.trim().parse().map_err(|_| errors::invalid_id(what))
}

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ListPartsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetSerializedRequest {
    pub is_serialized: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListLocationsQuery {
    #[serde(rename = "type")]
    pub location_type: Option<LocationType>,
}

#[derive(Debug, Deserialize)]
pub struct AssignTechnicianRequest {
    pub technician_id: UserId,
    /// Required to replace a different technician already on the vehicle.
    #[serde(default)]
    pub reassign: bool,
}

#[derive(Debug, Deserialize)]
pub struct RequestsQuery {
    #[serde(default)]
    pub filter: QueueFilter,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseOrdersQuery {
    pub status: Option<PurchaseOrderStatus>,
}

#[derive(Debug, Deserialize)]
pub struct RequestLinesRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Deserialize)]
pub struct ChargesRequest {
    #[serde(default)]
    pub tax_rate_bp: Option<u32>,
    #[serde(default)]
    pub shipping: Option<Money>,
}

#[derive(Debug, Deserialize)]
pub struct ReceiveRequest {
    pub lines: Vec<ReceiptLineInput>,
}

#[derive(Debug, Deserialize)]
pub struct QuantityQuery {
    pub part_id: PartId,
    pub location_id: LocationId,
    /// Report the stock reserved for this job instead of general stock.
    pub job_id: Option<JobId>,
}

#[derive(Debug, Deserialize)]
pub struct LevelsQuery {
    pub part_id: Option<PartId>,
    pub location_id: Option<LocationId>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub part_id: Option<PartId>,
    pub location_id: Option<LocationId>,
    #[serde(rename = "type")]
    pub movement_type: Option<MovementType>,
    pub job_id: Option<JobId>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UnitsQuery {
    pub status: Option<UnitStatus>,
    pub search: Option<String>,
    pub part_id: Option<PartId>,
    pub location_id: Option<LocationId>,
}

#[derive(Debug, Deserialize)]
pub struct RelocateUnitRequest {
    pub to: LocationId,
}

#[derive(Debug, Default, Deserialize)]
pub struct PickupRequest {
    /// Defaults to the acting technician's vehicle.
    #[serde(default)]
    pub destination: Option<LocationId>,
}

#[derive(Debug, Deserialize)]
pub struct JobTechnicianRequest {
    pub technician_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct PickupsQuery {
    pub technician_id: Option<UserId>,
    /// Shortcut for `technician_id` = the acting user.
    #[serde(default)]
    pub mine: bool,
}

// -------------------------
// Response mapping
// -------------------------

pub fn part_to_json(part: &Part) -> JsonValue {
    json!({
        "id": part.id_typed(),
        "sku": part.sku(),
        "name": part.name(),
        "category": part.category(),
        "is_serialized": part.is_serialized(),
        "unit_cost": part.unit_cost(),
        "is_active": part.is_active(),
    })
}

pub fn location_to_json(location: &StockLocation) -> JsonValue {
    json!({
        "id": location.id_typed(),
        "name": location.name(),
        "location_type": location.location_type(),
        "assigned_technician": location.assigned_technician(),
        "is_active": location.is_active(),
    })
}

pub fn order_to_json(order: &PurchaseOrder) -> JsonValue {
    let lines: Vec<JsonValue> = order
        .lines()
        .iter()
        .map(|line| {
            json!({
                "line_no": line.line_no,
                "part_id": line.part_id,
                "description": line.description,
                "quantity_ordered": line.quantity_ordered,
                "quantity_received": line.quantity_received,
                "quantity_damaged": line.quantity_damaged,
                "remaining": line.remaining(),
                "unit_price": line.unit_price,
                "line_total": line.line_total(),
                "job_id": line.job_id,
                "request": line.request,
            })
        })
        .collect();

    json!({
        "id": order.id_typed(),
        "number": order.number(),
        "vendor_id": order.vendor_id(),
        "status": order.status(),
        "source": order.source(),
        "order_date": order.order_date(),
        "expected_delivery": order.expected_delivery(),
        "lines": lines,
        "tax_rate_bp": order.tax_rate().basis_points(),
        "subtotal": order.subtotal(),
        "tax": order.tax(),
        "shipping": order.shipping(),
        "total": order.total(),
        "notes": order.notes(),
        "created_by": order.created_by(),
        "created_at": order.created_at(),
        "cancel_reason": order.cancel_reason(),
    })
}

pub fn request_to_json(request: &PartsRequest) -> JsonValue {
    json!({
        "id": request.id_typed(),
        "job_id": request.job_id(),
        "urgency": request.urgency(),
        "status": request.status(),
        "requester": request.requester(),
        "requested_at": request.requested_at(),
        "ordered_at": request.ordered_at(),
        "received_at": request.received_at(),
        "cancelled_at": request.cancelled_at(),
        "items": request.items(),
        "links": request.links(),
    })
}

pub fn unit_to_json(unit: &SerializedUnit) -> JsonValue {
    let warranty = unit.warranty();
    json!({
        "id": unit.id_typed(),
        "part_id": unit.part_id(),
        "serial_number": unit.serial_number(),
        "status": unit.status(),
        "location": unit.location(),
        "reserved_for": unit.reserved_for(),
        "vendor_id": unit.vendor_id(),
        "origin": unit.origin(),
        "purchased_on": unit.purchased_on(),
        "received_at": unit.received_at(),
        "unit_cost": unit.unit_cost(),
        "warranty_start": warranty.start,
        "warranty_end": warranty.end,
        "equipment_ref": unit.equipment_ref(),
    })
}

pub fn staging_to_json(staging: &JobStaging) -> JsonValue {
    json!({
        "job_id": staging.job_id(),
        "technician": staging.technician(),
        "items": staging.items(),
    })
}
