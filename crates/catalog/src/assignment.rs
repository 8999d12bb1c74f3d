use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_core::{Aggregate, AggregateRoot, DomainError, UserId};
use fieldstock_events::Event;

use crate::location::LocationId;

/// Aggregate root: the vehicle currently held by one technician.
///
/// Keyed by the technician's id. Written together with the vehicle's
/// [`crate::StockLocation`] so a technician never ends up assigned to two vehicles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleAssignment {
    technician: UserId,
    vehicle: Option<LocationId>,
    version: u64,
}

impl VehicleAssignment {
    pub fn empty(technician: UserId) -> Self {
        Self {
            technician,
            vehicle: None,
            version: 0,
        }
    }

    pub fn technician(&self) -> UserId {
        self.technician
    }

    pub fn vehicle(&self) -> Option<LocationId> {
        self.vehicle
    }
}

impl AggregateRoot for VehicleAssignment {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.technician
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimVehicle {
    pub technician: UserId,
    pub vehicle: LocationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseVehicle {
    pub technician: UserId,
    pub vehicle: LocationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentCommand {
    ClaimVehicle(ClaimVehicle),
    ReleaseVehicle(ReleaseVehicle),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleClaimed {
    pub technician: UserId,
    pub vehicle: LocationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleReleased {
    pub technician: UserId,
    pub vehicle: LocationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentEvent {
    VehicleClaimed(VehicleClaimed),
    VehicleReleased(VehicleReleased),
}

impl Event for AssignmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AssignmentEvent::VehicleClaimed(_) => "catalog.assignment.vehicle_claimed",
            AssignmentEvent::VehicleReleased(_) => "catalog.assignment.vehicle_released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AssignmentEvent::VehicleClaimed(e) => e.occurred_at,
            AssignmentEvent::VehicleReleased(e) => e.occurred_at,
        }
    }
}

impl Aggregate for VehicleAssignment {
    type Command = AssignmentCommand;
    type Event = AssignmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AssignmentEvent::VehicleClaimed(e) => {
                self.technician = e.technician;
                self.vehicle = Some(e.vehicle);
            }
            AssignmentEvent::VehicleReleased(_) => {
                self.vehicle = None;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AssignmentCommand::ClaimVehicle(cmd) => {
                if cmd.technician != self.technician {
                    return Err(DomainError::invariant("technician mismatch"));
                }
                match self.vehicle {
                    Some(current) if current == cmd.vehicle => Ok(vec![]),
                    Some(current) => Err(DomainError::conflict(format!(
                        "technician {} is already assigned to vehicle {current}",
                        cmd.technician
                    ))),
                    None => Ok(vec![AssignmentEvent::VehicleClaimed(VehicleClaimed {
                        technician: cmd.technician,
                        vehicle: cmd.vehicle,
                        occurred_at: cmd.occurred_at,
                    })]),
                }
            }
            AssignmentCommand::ReleaseVehicle(cmd) => {
                if self.vehicle != Some(cmd.vehicle) {
                    return Ok(vec![]);
                }
                Ok(vec![AssignmentEvent::VehicleReleased(VehicleReleased {
                    technician: cmd.technician,
                    vehicle: cmd.vehicle,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn technician_holds_at_most_one_vehicle() {
        let tech = UserId::new();
        let first = LocationId::generate();
        let mut assignment = VehicleAssignment::empty(tech);

        let events = assignment
            .handle(&AssignmentCommand::ClaimVehicle(ClaimVehicle {
                technician: tech,
                vehicle: first,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assignment.apply(&events[0]);
        assert_eq!(assignment.vehicle(), Some(first));

        let err = assignment
            .handle(&AssignmentCommand::ClaimVehicle(ClaimVehicle {
                technician: tech,
                vehicle: LocationId::generate(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn releasing_another_vehicle_is_a_no_op() {
        let tech = UserId::new();
        let assignment = VehicleAssignment::empty(tech);
        let events = assignment
            .handle(&AssignmentCommand::ReleaseVehicle(ReleaseVehicle {
                technician: tech,
                vehicle: LocationId::generate(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }
}
