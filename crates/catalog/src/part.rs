use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_core::{Aggregate, AggregateRoot, DomainError, Money, UserId};
use fieldstock_events::Event;

fieldstock_core::aggregate_id!(
    /// Catalog part identifier. Also keys the part's stock ledger stream.
    PartId
);

/// Part vs tool. Both behave identically; the category only drives display labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartCategory {
    #[default]
    Part,
    Tool,
}

impl PartCategory {
    pub fn label(self) -> &'static str {
        match self {
            PartCategory::Part => "Part",
            PartCategory::Tool => "Tool",
        }
    }
}

impl core::str::FromStr for PartCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "part" => Ok(PartCategory::Part),
            "tool" => Ok(PartCategory::Tool),
            other => Err(DomainError::validation(format!(
                "unknown category '{other}' (expected part or tool)"
            ))),
        }
    }
}

/// Aggregate root: Part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    id: PartId,
    sku: String,
    name: String,
    category: PartCategory,
    is_serialized: bool,
    unit_cost: Money,
    active: bool,
    version: u64,
    created: bool,
}

impl Part {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PartId) -> Self {
        Self {
            id,
            sku: String::new(),
            name: String::new(),
            category: PartCategory::Part,
            is_serialized: false,
            unit_cost: Money::ZERO,
            active: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PartId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> PartCategory {
        self.category
    }

    pub fn is_serialized(&self) -> bool {
        self.is_serialized
    }

    pub fn unit_cost(&self) -> Money {
        self.unit_cost
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl AggregateRoot for Part {
    type Id = PartId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePart {
    pub part_id: PartId,
    pub sku: String,
    pub name: String,
    pub category: PartCategory,
    pub is_serialized: bool,
    pub unit_cost: Money,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdatePart (name and/or catalog cost).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePart {
    pub part_id: PartId,
    pub name: Option<String>,
    pub unit_cost: Option<Money>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetSerialized.
///
/// `has_stock_history` is supplied by the caller from the part's ledger stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSerialized {
    pub part_id: PartId,
    pub is_serialized: bool,
    pub has_stock_history: bool,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivatePart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivatePart {
    pub part_id: PartId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartCommand {
    CreatePart(CreatePart),
    UpdatePart(UpdatePart),
    SetSerialized(SetSerialized),
    DeactivatePart(DeactivatePart),
}

/// Event: PartCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartCreated {
    pub part_id: PartId,
    pub sku: String,
    pub name: String,
    pub category: PartCategory,
    pub is_serialized: bool,
    pub unit_cost: Money,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PartUpdated (carries the resulting values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartUpdated {
    pub part_id: PartId,
    pub name: String,
    pub unit_cost: Money,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PartSerializationChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSerializationChanged {
    pub part_id: PartId,
    pub is_serialized: bool,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PartDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDeactivated {
    pub part_id: PartId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartEvent {
    PartCreated(PartCreated),
    PartUpdated(PartUpdated),
    PartSerializationChanged(PartSerializationChanged),
    PartDeactivated(PartDeactivated),
}

impl Event for PartEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PartEvent::PartCreated(_) => "catalog.part.created",
            PartEvent::PartUpdated(_) => "catalog.part.updated",
            PartEvent::PartSerializationChanged(_) => "catalog.part.serialization_changed",
            PartEvent::PartDeactivated(_) => "catalog.part.deactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PartEvent::PartCreated(e) => e.occurred_at,
            PartEvent::PartUpdated(e) => e.occurred_at,
            PartEvent::PartSerializationChanged(e) => e.occurred_at,
            PartEvent::PartDeactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Part {
    type Command = PartCommand;
    type Event = PartEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PartEvent::PartCreated(e) => {
                self.id = e.part_id;
                self.sku = e.sku.clone();
                self.name = e.name.clone();
                self.category = e.category;
                self.is_serialized = e.is_serialized;
                self.unit_cost = e.unit_cost;
                self.active = true;
                self.created = true;
            }
            PartEvent::PartUpdated(e) => {
                self.name = e.name.clone();
                self.unit_cost = e.unit_cost;
            }
            PartEvent::PartSerializationChanged(e) => {
                self.is_serialized = e.is_serialized;
            }
            PartEvent::PartDeactivated(_) => {
                self.active = false;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PartCommand::CreatePart(cmd) => self.handle_create(cmd),
            PartCommand::UpdatePart(cmd) => self.handle_update(cmd),
            PartCommand::SetSerialized(cmd) => self.handle_set_serialized(cmd),
            PartCommand::DeactivatePart(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl Part {
    fn ensure_exists(&self, part_id: PartId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("part {part_id}")));
        }
        if self.id != part_id {
            return Err(DomainError::invariant("part_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreatePart) -> Result<Vec<PartEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("part already exists"));
        }
        if cmd.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.unit_cost.is_negative() {
            return Err(DomainError::validation("unit_cost cannot be negative"));
        }

        Ok(vec![PartEvent::PartCreated(PartCreated {
            part_id: cmd.part_id,
            sku: cmd.sku.trim().to_string(),
            name: cmd.name.trim().to_string(),
            category: cmd.category,
            is_serialized: cmd.is_serialized,
            unit_cost: cmd.unit_cost,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdatePart) -> Result<Vec<PartEvent>, DomainError> {
        self.ensure_exists(cmd.part_id)?;

        let name = match &cmd.name {
            Some(n) if n.trim().is_empty() => {
                return Err(DomainError::validation("name cannot be empty"));
            }
            Some(n) => n.trim().to_string(),
            None => self.name.clone(),
        };
        let unit_cost = cmd.unit_cost.unwrap_or(self.unit_cost);
        if unit_cost.is_negative() {
            return Err(DomainError::validation("unit_cost cannot be negative"));
        }

        if name == self.name && unit_cost == self.unit_cost {
            return Ok(vec![]);
        }

        Ok(vec![PartEvent::PartUpdated(PartUpdated {
            part_id: cmd.part_id,
            name,
            unit_cost,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_serialized(&self, cmd: &SetSerialized) -> Result<Vec<PartEvent>, DomainError> {
        self.ensure_exists(cmd.part_id)?;

        if self.is_serialized == cmd.is_serialized {
            return Ok(vec![]);
        }
        if cmd.has_stock_history {
            return Err(DomainError::conflict(format!(
                "part {} already has stock movements; is_serialized can no longer change",
                self.sku
            )));
        }

        Ok(vec![PartEvent::PartSerializationChanged(PartSerializationChanged {
            part_id: cmd.part_id,
            is_serialized: cmd.is_serialized,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivatePart) -> Result<Vec<PartEvent>, DomainError> {
        self.ensure_exists(cmd.part_id)?;

        if !self.active {
            return Err(DomainError::invariant("part is already inactive"));
        }

        Ok(vec![PartEvent::PartDeactivated(PartDeactivated {
            part_id: cmd.part_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
