use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, JobId, Money, UserId, VendorId};
use fieldstock_events::Event;

fieldstock_core::aggregate_id!(
    /// Serialized unit identifier.
    UnitId
);

/// Lifecycle status of a serialized unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    InStock,
    InTransit,
    Installed,
    Returned,
    Defective,
    WarrantyClaim,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::InStock => "in_stock",
            UnitStatus::InTransit => "in_transit",
            UnitStatus::Installed => "installed",
            UnitStatus::Returned => "returned",
            UnitStatus::Defective => "defective",
            UnitStatus::WarrantyClaim => "warranty_claim",
        }
    }

    /// Allowed status transitions.
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (InStock, InTransit | Installed | Defective | WarrantyClaim)
                | (InTransit, InStock | Defective)
                | (Installed, Returned | Defective | WarrantyClaim)
                | (Returned, InStock | Defective | WarrantyClaim)
                | (Defective, WarrantyClaim | Returned | InStock)
                | (WarrantyClaim, Returned | InStock | Defective)
        )
    }

    /// Statuses in which the unit must physically sit at a stock location.
    pub fn requires_location(self) -> bool {
        matches!(self, UnitStatus::InStock | UnitStatus::InTransit | UnitStatus::Returned)
    }
}

impl core::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for UnitStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_stock" => Ok(UnitStatus::InStock),
            "in_transit" => Ok(UnitStatus::InTransit),
            "installed" => Ok(UnitStatus::Installed),
            "returned" => Ok(UnitStatus::Returned),
            "defective" => Ok(UnitStatus::Defective),
            "warranty_claim" => Ok(UnitStatus::WarrantyClaim),
            other => Err(DomainError::validation(format!("unknown unit status '{other}'"))),
        }
    }
}

/// Warranty coverage dates (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WarrantyWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl WarrantyWindow {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> DomainResult<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if e < s {
                return Err(DomainError::validation(format!(
                    "warranty end {e} is before warranty start {s}"
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// A unit is covered on `date` when an end date exists and `date` falls inside the window.
    pub fn covers(&self, date: NaiveDate) -> bool {
        match self.end {
            Some(end) => self.start.is_none_or(|start| start <= date) && date <= end,
            None => false,
        }
    }
}

/// Purchase order line a unit was received against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOrigin {
    pub order_id: AggregateId,
    pub order_number: String,
    pub line_no: u32,
}

/// Aggregate root: SerializedUnit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedUnit {
    id: UnitId,
    part_id: Option<PartId>,
    serial_number: String,
    status: UnitStatus,
    location: Option<LocationId>,
    reserved_for: Option<JobId>,
    vendor_id: Option<VendorId>,
    origin: Option<UnitOrigin>,
    purchased_on: Option<NaiveDate>,
    received_at: Option<DateTime<Utc>>,
    unit_cost: Money,
    warranty: WarrantyWindow,
    equipment_ref: Option<String>,
    version: u64,
    created: bool,
}

impl SerializedUnit {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: UnitId) -> Self {
        Self {
            id,
            part_id: None,
            serial_number: String::new(),
            status: UnitStatus::InStock,
            location: None,
            reserved_for: None,
            vendor_id: None,
            origin: None,
            purchased_on: None,
            received_at: None,
            unit_cost: Money::ZERO,
            warranty: WarrantyWindow::default(),
            equipment_ref: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> UnitId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn part_id(&self) -> Option<PartId> {
        self.part_id
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub fn location(&self) -> Option<LocationId> {
        self.location
    }

    /// Job the unit is staged for, while it waits at a staging location.
    pub fn reserved_for(&self) -> Option<JobId> {
        self.reserved_for
    }

    pub fn vendor_id(&self) -> Option<VendorId> {
        self.vendor_id
    }

    pub fn origin(&self) -> Option<&UnitOrigin> {
        self.origin.as_ref()
    }

    pub fn purchased_on(&self) -> Option<NaiveDate> {
        self.purchased_on
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn unit_cost(&self) -> Money {
        self.unit_cost
    }

    pub fn warranty(&self) -> WarrantyWindow {
        self.warranty
    }

    pub fn equipment_ref(&self) -> Option<&str> {
        self.equipment_ref.as_deref()
    }

    pub fn is_under_warranty(&self, date: NaiveDate) -> bool {
        self.warranty.covers(date)
    }

    /// Case-insensitive substring match on the serial number, the equipment the unit is
    /// installed in, or the purchase order it came from.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        [
            Some(self.serial_number.as_str()),
            self.equipment_ref.as_deref(),
            self.origin.as_ref().map(|o| o.order_number.as_str()),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&needle))
    }
}

impl AggregateRoot for SerializedUnit {
    type Id = UnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterUnit (receiving only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUnit {
    pub unit_id: UnitId,
    pub part_id: PartId,
    pub serial_number: String,
    /// `in_stock`, or `defective` for units received damaged.
    pub status: UnitStatus,
    pub location: LocationId,
    pub reserved_for: Option<JobId>,
    pub vendor_id: Option<VendorId>,
    pub origin: Option<UnitOrigin>,
    pub purchased_on: Option<NaiveDate>,
    pub unit_cost: Money,
    pub warranty: WarrantyWindow,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeUnitStatus.
///
/// `location` brings a unit without a location (installed, out for warranty) back into
/// stock; it is rejected for units that already sit somewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeUnitStatus {
    pub unit_id: UnitId,
    pub status: UnitStatus,
    pub equipment_ref: Option<String>,
    pub location: Option<LocationId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RelocateUnit (transfer, pickup and release flows).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateUnit {
    pub unit_id: UnitId,
    pub location: LocationId,
    pub reserved_for: Option<JobId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitCommand {
    RegisterUnit(RegisterUnit),
    ChangeUnitStatus(ChangeUnitStatus),
    RelocateUnit(RelocateUnit),
}

/// Event: UnitRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRegistered {
    pub unit_id: UnitId,
    pub part_id: PartId,
    pub serial_number: String,
    pub status: UnitStatus,
    pub location: LocationId,
    pub reserved_for: Option<JobId>,
    pub vendor_id: Option<VendorId>,
    pub origin: Option<UnitOrigin>,
    pub purchased_on: Option<NaiveDate>,
    pub unit_cost: Money,
    pub warranty: WarrantyWindow,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatusChanged {
    pub unit_id: UnitId,
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub equipment_ref: Option<String>,
    pub location: Option<LocationId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitRelocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRelocated {
    pub unit_id: UnitId,
    pub from: Option<LocationId>,
    pub to: LocationId,
    pub reserved_for: Option<JobId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitEvent {
    UnitRegistered(UnitRegistered),
    UnitStatusChanged(UnitStatusChanged),
    UnitRelocated(UnitRelocated),
}

impl Event for UnitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UnitEvent::UnitRegistered(_) => "assets.unit.registered",
            UnitEvent::UnitStatusChanged(_) => "assets.unit.status_changed",
            UnitEvent::UnitRelocated(_) => "assets.unit.relocated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UnitEvent::UnitRegistered(e) => e.occurred_at,
            UnitEvent::UnitStatusChanged(e) => e.occurred_at,
            UnitEvent::UnitRelocated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SerializedUnit {
    type Command = UnitCommand;
    type Event = UnitEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UnitEvent::UnitRegistered(e) => {
                self.id = e.unit_id;
                self.part_id = Some(e.part_id);
                self.serial_number = e.serial_number.clone();
                self.status = e.status;
                self.location = Some(e.location);
                self.reserved_for = e.reserved_for;
                self.vendor_id = e.vendor_id;
                self.origin = e.origin.clone();
                self.purchased_on = e.purchased_on;
                self.received_at = Some(e.occurred_at);
                self.unit_cost = e.unit_cost;
                self.warranty = e.warranty;
                self.created = true;
            }
            UnitEvent::UnitStatusChanged(e) => {
                self.status = e.to;
                if e.to == UnitStatus::Installed {
                    self.equipment_ref = e.equipment_ref.clone();
                    self.location = None;
                    self.reserved_for = None;
                } else {
                    self.equipment_ref = None;
                    if let Some(location) = e.location {
                        self.location = Some(location);
                    }
                }
            }
            UnitEvent::UnitRelocated(e) => {
                self.location = Some(e.to);
                self.reserved_for = e.reserved_for;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            UnitCommand::RegisterUnit(cmd) => self.handle_register(cmd),
            UnitCommand::ChangeUnitStatus(cmd) => self.handle_change_status(cmd),
            UnitCommand::RelocateUnit(cmd) => self.handle_relocate(cmd),
        }
    }
}

impl SerializedUnit {
    fn ensure_exists(&self, unit_id: UnitId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("serialized unit {unit_id}")));
        }
        if self.id != unit_id {
            return Err(DomainError::invariant("unit_id mismatch"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterUnit) -> Result<Vec<UnitEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("serialized unit already exists"));
        }
        if cmd.serial_number.trim().is_empty() {
            return Err(DomainError::validation("serial number cannot be empty"));
        }
        if !matches!(cmd.status, UnitStatus::InStock | UnitStatus::Defective) {
            return Err(DomainError::validation(
                "units are received either in_stock or defective",
            ));
        }
        WarrantyWindow::new(cmd.warranty.start, cmd.warranty.end)?;

        Ok(vec![UnitEvent::UnitRegistered(UnitRegistered {
            unit_id: cmd.unit_id,
            part_id: cmd.part_id,
            serial_number: cmd.serial_number.trim().to_string(),
            status: cmd.status,
            location: cmd.location,
            reserved_for: cmd.reserved_for,
            vendor_id: cmd.vendor_id,
            origin: cmd.origin.clone(),
            purchased_on: cmd.purchased_on,
            unit_cost: cmd.unit_cost,
            warranty: cmd.warranty,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_status(&self, cmd: &ChangeUnitStatus) -> Result<Vec<UnitEvent>, DomainError> {
        self.ensure_exists(cmd.unit_id)?;

        let next = cmd.status;
        if next == self.status {
            return Err(DomainError::invariant(format!(
                "unit {} is already {next}",
                self.serial_number
            )));
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "unit {} cannot go from {} to {next}",
                self.serial_number, self.status
            )));
        }

        let equipment_ref = cmd
            .equipment_ref
            .as_ref()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        if next == UnitStatus::Installed {
            if equipment_ref.is_none() {
                return Err(DomainError::validation(
                    "installing a unit requires an equipment reference",
                ));
            }
            if cmd.location.is_some() {
                return Err(DomainError::validation("installed units have no stock location"));
            }
            if self.location.is_none() {
                return Err(DomainError::invariant(format!(
                    "unit {} is not in stock",
                    self.serial_number
                )));
            }
            if let Some(job) = self.reserved_for {
                return Err(DomainError::invariant(format!(
                    "unit {} is staged for job {job}; pick it up first",
                    self.serial_number
                )));
            }
        } else if equipment_ref.is_some() {
            return Err(DomainError::validation(
                "equipment reference only applies when installing",
            ));
        }

        match (self.location, cmd.location) {
            (Some(current), Some(_)) => {
                return Err(DomainError::validation(format!(
                    "unit {} is already at location {current}; use a transfer to move it",
                    self.serial_number
                )));
            }
            (None, None) if next.requires_location() => {
                return Err(DomainError::validation(format!(
                    "a location is required to bring unit {} back as {next}",
                    self.serial_number
                )));
            }
            _ => {}
        }

        Ok(vec![UnitEvent::UnitStatusChanged(UnitStatusChanged {
            unit_id: cmd.unit_id,
            from: self.status,
            to: next,
            equipment_ref,
            location: cmd.location,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_relocate(&self, cmd: &RelocateUnit) -> Result<Vec<UnitEvent>, DomainError> {
        self.ensure_exists(cmd.unit_id)?;

        let Some(current) = self.location else {
            return Err(DomainError::invariant(format!(
                "unit {} is not in stock",
                self.serial_number
            )));
        };
        if current == cmd.location && self.reserved_for == cmd.reserved_for {
            return Err(DomainError::invariant(format!(
                "unit {} is already at location {current}",
                self.serial_number
            )));
        }

        Ok(vec![UnitEvent::UnitRelocated(UnitRelocated {
            unit_id: cmd.unit_id,
            from: Some(current),
            to: cmd.location,
            reserved_for: cmd.reserved_for,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn registered(status: UnitStatus) -> SerializedUnit {
        let unit_id = UnitId::generate();
        let mut unit = SerializedUnit::empty(unit_id);
        let events = unit
            .handle(&UnitCommand::RegisterUnit(RegisterUnit {
                unit_id,
                part_id: PartId::generate(),
                serial_number: "CMP-00042".to_string(),
                status,
                location: LocationId::generate(),
                reserved_for: None,
                vendor_id: Some(VendorId::new()),
                origin: None,
                purchased_on: Some(date(2026, 3, 1)),
                unit_cost: Money::from_cents(48_000),
                warranty: WarrantyWindow::new(Some(date(2026, 3, 1)), Some(date(2031, 3, 1))).unwrap(),
                actor: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        unit.apply(&events[0]);
        unit
    }

    fn change(unit: &SerializedUnit, status: UnitStatus, equipment: Option<&str>, location: Option<LocationId>) -> DomainResult<Vec<UnitEvent>> {
        unit.handle(&UnitCommand::ChangeUnitStatus(ChangeUnitStatus {
            unit_id: unit.id_typed(),
            status,
            equipment_ref: equipment.map(str::to_string),
            location,
            actor: UserId::new(),
            occurred_at: Utc::now(),
        }))
    }

    #[test]
    fn transition_table() {
        use UnitStatus::*;
        assert!(InStock.can_transition_to(Installed));
        assert!(Installed.can_transition_to(Returned));
        assert!(!Installed.can_transition_to(InStock));
        assert!(!InTransit.can_transition_to(Installed));
        assert!(!Defective.can_transition_to(Installed));
        assert!(WarrantyClaim.can_transition_to(InStock));
    }

    #[test]
    fn installing_requires_equipment_reference() {
        let unit = registered(UnitStatus::InStock);
        let err = change(&unit, UnitStatus::Installed, None, None).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut unit = unit;
        let events = change(&unit, UnitStatus::Installed, Some("RTU-3 rooftop"), None).unwrap();
        unit.apply(&events[0]);
        assert_eq!(unit.status(), UnitStatus::Installed);
        assert_eq!(unit.equipment_ref(), Some("RTU-3 rooftop"));
        assert_eq!(unit.location(), None);
    }

    #[test]
    fn returning_an_installed_unit_needs_a_location() {
        let mut unit = registered(UnitStatus::InStock);
        let events = change(&unit, UnitStatus::Installed, Some("AHU-1"), None).unwrap();
        unit.apply(&events[0]);

        let err = change(&unit, UnitStatus::Returned, None, None).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let shop = LocationId::generate();
        let events = change(&unit, UnitStatus::Returned, None, Some(shop)).unwrap();
        unit.apply(&events[0]);
        assert_eq!(unit.location(), Some(shop));
        assert_eq!(unit.equipment_ref(), None);
    }

    #[test]
    fn defective_units_can_be_claimed_under_warranty() {
        let mut unit = registered(UnitStatus::Defective);
        let events = change(&unit, UnitStatus::WarrantyClaim, None, None).unwrap();
        unit.apply(&events[0]);
        assert_eq!(unit.status(), UnitStatus::WarrantyClaim);
        assert!(unit.is_under_warranty(date(2027, 1, 1)));
        assert!(!unit.is_under_warranty(date(2032, 1, 1)));
    }

    #[test]
    fn warranty_end_cannot_precede_start() {
        let err = WarrantyWindow::new(Some(date(2026, 5, 1)), Some(date(2026, 4, 1))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(!WarrantyWindow::default().covers(date(2026, 1, 1)));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let unit = registered(UnitStatus::InStock);
        assert!(unit.matches_search("cmp-000"));
        assert!(unit.matches_search("0042"));
        assert!(!unit.matches_search("xyz"));
    }

    #[test]
    fn relocating_to_the_same_place_is_rejected() {
        let unit = registered(UnitStatus::InStock);
        let here = unit.location().unwrap();
        let err = unit
            .handle(&UnitCommand::RelocateUnit(RelocateUnit {
                unit_id: unit.id_typed(),
                location: here,
                reserved_for: None,
                actor: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }
}
