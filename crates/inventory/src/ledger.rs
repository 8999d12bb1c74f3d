use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::{Aggregate, AggregateRoot, DomainError, JobId, UserId};
use fieldstock_events::Event;

use crate::movement::{MovementId, MovementReference, MovementType, StockBucket};

/// Aggregate root: the stock ledger of one part.
///
/// Holds the derived balance of every bucket the part has touched, the serial numbers
/// ever received, and running totals of units introduced into and removed from the
/// location graph. Balances never go negative: any movement with a source is refused
/// when the source bucket holds less than the moved quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartLedger {
    part_id: PartId,
    balances: BTreeMap<StockBucket, i64>,
    serials: BTreeSet<String>,
    introduced: i64,
    removed: i64,
    version: u64,
}

impl PartLedger {
    /// Create an empty ledger for rehydration. A ledger needs no creation event.
    pub fn empty(part_id: PartId) -> Self {
        Self {
            part_id,
            balances: BTreeMap::new(),
            serials: BTreeSet::new(),
            introduced: 0,
            removed: 0,
            version: 0,
        }
    }

    pub fn part_id(&self) -> PartId {
        self.part_id
    }

    /// Whether any movement was ever posted for this part.
    pub fn has_history(&self) -> bool {
        self.version > 0
    }

    pub fn bucket_quantity(&self, bucket: &StockBucket) -> i64 {
        self.balances.get(bucket).copied().unwrap_or(0)
    }

    /// General (unreserved) stock at a location.
    pub fn quantity_at(&self, location: LocationId) -> i64 {
        self.bucket_quantity(&StockBucket::general(location))
    }

    /// Stock at a location reserved for a job.
    pub fn reserved_at(&self, location: LocationId, job_id: JobId) -> i64 {
        self.bucket_quantity(&StockBucket::reserved(location, job_id))
    }

    /// Sum over every bucket.
    pub fn total_on_hand(&self) -> i64 {
        self.balances.values().sum()
    }

    /// Units that entered the graph (receipts, positive adjustments, returns from outside).
    pub fn introduced(&self) -> i64 {
        self.introduced
    }

    /// Units that left the graph (installations, disposals, negative adjustments).
    pub fn removed(&self) -> i64 {
        self.removed
    }

    pub fn balances(&self) -> impl Iterator<Item = (&StockBucket, i64)> {
        self.balances.iter().map(|(b, q)| (b, *q))
    }

    pub fn has_serial(&self, serial: &str) -> bool {
        self.serials.contains(serial)
    }
}

impl AggregateRoot for PartLedger {
    type Id = PartId;

    fn id(&self) -> &Self::Id {
        &self.part_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PostMovement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMovement {
    pub movement_id: MovementId,
    pub part_id: PartId,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub from: Option<StockBucket>,
    pub to: Option<StockBucket>,
    /// Serial numbers of the units moved. When present, one per unit.
    pub serial_numbers: Vec<String>,
    pub reference: Option<MovementReference>,
    pub actor: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    PostMovement(PostMovement),
}

/// Event: MovementPosted. This is the immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPosted {
    pub movement_id: MovementId,
    pub part_id: PartId,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub from: Option<StockBucket>,
    pub to: Option<StockBucket>,
    pub serial_numbers: Vec<String>,
    pub reference: Option<MovementReference>,
    pub actor: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    MovementPosted(MovementPosted),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::MovementPosted(_) => "inventory.ledger.movement_posted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::MovementPosted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PartLedger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::MovementPosted(e) => {
                self.part_id = e.part_id;

                if let Some(from) = e.from {
                    let remaining = self.bucket_quantity(&from) - e.quantity;
                    if remaining == 0 {
                        self.balances.remove(&from);
                    } else {
                        self.balances.insert(from, remaining);
                    }
                }
                if let Some(to) = e.to {
                    *self.balances.entry(to).or_insert(0) += e.quantity;
                }

                match Self::effect(e.movement_type, e.from.is_some(), e.to.is_some()) {
                    Effect::Introduces => self.introduced += e.quantity,
                    Effect::Removes => self.removed += e.quantity,
                    Effect::Moves => {}
                }

                if e.movement_type == MovementType::Receipt {
                    self.serials.extend(e.serial_numbers.iter().cloned());
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::PostMovement(cmd) => self.handle_post(cmd),
        }
    }
}

/// How a movement changes the stock held across all locations.
enum Effect {
    Introduces,
    Removes,
    Moves,
}

impl PartLedger {
    fn effect(movement_type: MovementType, has_from: bool, has_to: bool) -> Effect {
        match (movement_type, has_from, has_to) {
            (MovementType::Receipt, _, _) | (MovementType::Return, false, _) => Effect::Introduces,
            (MovementType::Adjustment, false, true) => Effect::Introduces,
            (MovementType::Adjustment, true, _)
            | (MovementType::Installation, _, _)
            | (MovementType::Disposal, _, _) => Effect::Removes,
            _ => Effect::Moves,
        }
    }

    /// Refuse movements whose running totals would not fit in an `i64`.
    ///
    /// Every bucket is bounded by `introduced`, so checking it and the destination
    /// keeps the whole fold in range.
    fn ensure_in_range(&self, cmd: &PostMovement) -> Result<(), DomainError> {
        let too_large = || {
            DomainError::validation(format!(
                "quantity {} would overflow the stock totals for this part",
                cmd.quantity
            ))
        };
        if let Some(to) = &cmd.to {
            self.bucket_quantity(to)
                .checked_add(cmd.quantity)
                .ok_or_else(too_large)?;
        }
        let total = match Self::effect(cmd.movement_type, cmd.from.is_some(), cmd.to.is_some()) {
            Effect::Introduces => self.introduced,
            Effect::Removes => self.removed,
            Effect::Moves => return Ok(()),
        };
        total.checked_add(cmd.quantity).ok_or_else(too_large)?;
        Ok(())
    }

    fn ensure_serials(&self, cmd: &PostMovement) -> Result<(), DomainError> {
        if cmd.serial_numbers.is_empty() {
            return Ok(());
        }
        if cmd.serial_numbers.len() as i64 != cmd.quantity {
            return Err(DomainError::validation(format!(
                "expected {} serial numbers, got {}",
                cmd.quantity,
                cmd.serial_numbers.len()
            )));
        }

        let mut seen = BTreeSet::new();
        for serial in &cmd.serial_numbers {
            if serial.trim().is_empty() {
                return Err(DomainError::validation("serial numbers cannot be blank"));
            }
            if !seen.insert(serial.as_str()) {
                return Err(DomainError::validation(format!(
                    "serial number {serial} is listed twice"
                )));
            }
            if cmd.movement_type == MovementType::Receipt && self.serials.contains(serial) {
                return Err(DomainError::conflict(format!(
                    "serial number {serial} was already received for this part"
                )));
            }
        }
        Ok(())
    }

    fn handle_post(&self, cmd: &PostMovement) -> Result<Vec<LedgerEvent>, DomainError> {
        if self.part_id != cmd.part_id {
            return Err(DomainError::invariant("part_id mismatch"));
        }
        if cmd.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "quantity must be positive (got {})",
                cmd.quantity
            )));
        }

        cmd.movement_type
            .check_endpoints(cmd.from.as_ref(), cmd.to.as_ref())?;

        if let Some(from) = &cmd.from {
            let available = self.bucket_quantity(from);
            if available < cmd.quantity {
                return Err(DomainError::conflict(format!(
                    "insufficient stock at {from}: {available} available, {} requested",
                    cmd.quantity
                )));
            }
        }

        self.ensure_in_range(cmd)?;
        self.ensure_serials(cmd)?;

        Ok(vec![LedgerEvent::MovementPosted(MovementPosted {
            movement_id: cmd.movement_id,
            part_id: cmd.part_id,
            movement_type: cmd.movement_type,
            quantity: cmd.quantity,
            from: cmd.from,
            to: cmd.to,
            serial_numbers: cmd.serial_numbers.clone(),
            reference: cmd.reference.clone(),
            actor: cmd.actor,
            notes: cmd.notes.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
