use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_core::{Aggregate, AggregateRoot, DomainError, UserId};
use fieldstock_events::Event;

fieldstock_core::aggregate_id!(
    /// Stock location identifier.
    LocationId
);

/// Kind of place inventory can physically reside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Warehouse,
    Vehicle,
    ProjectSite,
    CustomerSite,
    Vendor,
}

impl core::str::FromStr for LocationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warehouse" => Ok(LocationType::Warehouse),
            "vehicle" | "truck" => Ok(LocationType::Vehicle),
            "project_site" => Ok(LocationType::ProjectSite),
            "customer_site" => Ok(LocationType::CustomerSite),
            "vendor" => Ok(LocationType::Vendor),
            other => Err(DomainError::validation(format!("unknown location_type '{other}'"))),
        }
    }
}

/// Aggregate root: StockLocation.
///
/// Only vehicles carry an assigned technician, and at most one at a time. Replacing an
/// assigned technician needs `reassign = true`. The technician side of the pairing
/// (one vehicle per technician) lives in [`crate::VehicleAssignment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLocation {
    id: LocationId,
    name: String,
    location_type: LocationType,
    assigned_technician: Option<UserId>,
    active: bool,
    version: u64,
    created: bool,
}

impl StockLocation {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: LocationId) -> Self {
        Self {
            id,
            name: String::new(),
            location_type: LocationType::Warehouse,
            assigned_technician: None,
            active: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> LocationId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location_type(&self) -> LocationType {
        self.location_type
    }

    pub fn assigned_technician(&self) -> Option<UserId> {
        self.assigned_technician
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Exists and is active: the condition for any stock movement touching it.
    pub fn is_usable(&self) -> bool {
        self.created && self.active
    }
}

impl AggregateRoot for StockLocation {
    type Id = LocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateLocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLocation {
    pub location_id: LocationId,
    pub name: String,
    pub location_type: LocationType,
    pub assigned_technician: Option<UserId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignTechnician.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignTechnician {
    pub location_id: LocationId,
    pub technician: UserId,
    /// Must be set to replace a different technician already on the vehicle.
    pub reassign: bool,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UnassignTechnician.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignTechnician {
    pub location_id: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivateLocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateLocation {
    pub location_id: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReactivateLocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactivateLocation {
    pub location_id: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationCommand {
    CreateLocation(CreateLocation),
    AssignTechnician(AssignTechnician),
    UnassignTechnician(UnassignTechnician),
    DeactivateLocation(DeactivateLocation),
    ReactivateLocation(ReactivateLocation),
}

/// Event: LocationCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationCreated {
    pub location_id: LocationId,
    pub name: String,
    pub location_type: LocationType,
    pub assigned_technician: Option<UserId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TechnicianAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicianAssigned {
    pub location_id: LocationId,
    pub technician: UserId,
    pub previous: Option<UserId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TechnicianUnassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicianUnassigned {
    pub location_id: LocationId,
    pub technician: UserId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LocationDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDeactivated {
    pub location_id: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LocationReactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationReactivated {
    pub location_id: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationEvent {
    LocationCreated(LocationCreated),
    TechnicianAssigned(TechnicianAssigned),
    TechnicianUnassigned(TechnicianUnassigned),
    LocationDeactivated(LocationDeactivated),
    LocationReactivated(LocationReactivated),
}

impl Event for LocationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LocationEvent::LocationCreated(_) => "catalog.location.created",
            LocationEvent::TechnicianAssigned(_) => "catalog.location.technician_assigned",
            LocationEvent::TechnicianUnassigned(_) => "catalog.location.technician_unassigned",
            LocationEvent::LocationDeactivated(_) => "catalog.location.deactivated",
            LocationEvent::LocationReactivated(_) => "catalog.location.reactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LocationEvent::LocationCreated(e) => e.occurred_at,
            LocationEvent::TechnicianAssigned(e) => e.occurred_at,
            LocationEvent::TechnicianUnassigned(e) => e.occurred_at,
            LocationEvent::LocationDeactivated(e) => e.occurred_at,
            LocationEvent::LocationReactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockLocation {
    type Command = LocationCommand;
    type Event = LocationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LocationEvent::LocationCreated(e) => {
                self.id = e.location_id;
                self.name = e.name.clone();
                self.location_type = e.location_type;
                self.assigned_technician = e.assigned_technician;
                self.active = true;
                self.created = true;
            }
            LocationEvent::TechnicianAssigned(e) => {
                self.assigned_technician = Some(e.technician);
            }
            LocationEvent::TechnicianUnassigned(_) => {
                self.assigned_technician = None;
            }
            LocationEvent::LocationDeactivated(_) => {
                self.active = false;
            }
            LocationEvent::LocationReactivated(_) => {
                self.active = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LocationCommand::CreateLocation(cmd) => self.handle_create(cmd),
            LocationCommand::AssignTechnician(cmd) => self.handle_assign(cmd),
            LocationCommand::UnassignTechnician(cmd) => self.handle_unassign(cmd),
            LocationCommand::DeactivateLocation(cmd) => self.handle_deactivate(cmd),
            LocationCommand::ReactivateLocation(cmd) => self.handle_reactivate(cmd),
        }
    }
}

impl StockLocation {
    fn ensure_exists(&self, location_id: LocationId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("location {location_id}")));
        }
        if self.id != location_id {
            return Err(DomainError::invariant("location_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateLocation) -> Result<Vec<LocationEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("location already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.assigned_technician.is_some() && cmd.location_type != LocationType::Vehicle {
            return Err(DomainError::validation(
                "only vehicle locations can have an assigned technician",
            ));
        }

        Ok(vec![LocationEvent::LocationCreated(LocationCreated {
            location_id: cmd.location_id,
            name: cmd.name.trim().to_string(),
            location_type: cmd.location_type,
            assigned_technician: cmd.assigned_technician,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign(&self, cmd: &AssignTechnician) -> Result<Vec<LocationEvent>, DomainError> {
        self.ensure_exists(cmd.location_id)?;

        if self.location_type != LocationType::Vehicle {
            return Err(DomainError::validation(format!(
                "location '{}' is not a vehicle; only vehicles have technicians",
                self.name
            )));
        }
        if !self.active {
            return Err(DomainError::invariant(format!("location '{}' is inactive", self.name)));
        }

        match self.assigned_technician {
            Some(current) if current == cmd.technician => Ok(vec![]),
            Some(current) if !cmd.reassign => Err(DomainError::conflict(format!(
                "vehicle '{}' is already assigned to technician {current}; reassign explicitly",
                self.name
            ))),
            previous => Ok(vec![LocationEvent::TechnicianAssigned(TechnicianAssigned {
                location_id: cmd.location_id,
                technician: cmd.technician,
                previous,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            })]),
        }
    }

    fn handle_unassign(&self, cmd: &UnassignTechnician) -> Result<Vec<LocationEvent>, DomainError> {
        self.ensure_exists(cmd.location_id)?;

        let Some(technician) = self.assigned_technician else {
            return Ok(vec![]);
        };

        Ok(vec![LocationEvent::TechnicianUnassigned(TechnicianUnassigned {
            location_id: cmd.location_id,
            technician,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateLocation) -> Result<Vec<LocationEvent>, DomainError> {
        self.ensure_exists(cmd.location_id)?;

        if !self.active {
            return Err(DomainError::invariant("location is already inactive"));
        }
        if self.assigned_technician.is_some() {
            return Err(DomainError::invariant(format!(
                "unassign the technician from '{}' before deactivating it",
                self.name
            )));
        }

        Ok(vec![LocationEvent::LocationDeactivated(LocationDeactivated {
            location_id: cmd.location_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reactivate(&self, cmd: &ReactivateLocation) -> Result<Vec<LocationEvent>, DomainError> {
        self.ensure_exists(cmd.location_id)?;

        if self.active {
            return Err(DomainError::invariant("location is already active"));
        }

        Ok(vec![LocationEvent::LocationReactivated(LocationReactivated {
            location_id: cmd.location_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
