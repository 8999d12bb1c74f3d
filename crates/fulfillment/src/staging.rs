use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_assets::UnitId;
use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError, JobId, UserId};
use fieldstock_events::Event;

/// The purchase order line a staged item was received against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSource {
    pub order_id: AggregateId,
    pub order_number: String,
    pub line_no: u32,
}

/// Received stock held for a job at a staging location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedItem {
    pub item_no: u32,
    pub part_id: PartId,
    pub quantity: i64,
    pub location: LocationId,
    pub unit_ids: Vec<UnitId>,
    pub source: StagingSource,
    pub staged_at: DateTime<Utc>,
    pub picked_up: bool,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub picked_up_by: Option<UserId>,
    pub destination: Option<LocationId>,
    pub released: bool,
}

impl StagedItem {
    /// Still waiting at the staging location.
    pub fn is_pending(&self) -> bool {
        !self.picked_up && !self.released
    }
}

/// Aggregate root: JobStaging.
///
/// One stream per job. Starts empty; the first staged receipt brings it to life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStaging {
    job_id: JobId,
    technician: Option<UserId>,
    items: Vec<StagedItem>,
    ready_lines: Vec<(AggregateId, u32)>,
    version: u64,
}

impl JobStaging {
    pub fn empty(job_id: JobId) -> Self {
        Self {
            job_id,
            technician: None,
            items: Vec::new(),
            ready_lines: Vec::new(),
            version: 0,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn technician(&self) -> Option<UserId> {
        self.technician
    }

    pub fn items(&self) -> &[StagedItem] {
        &self.items
    }

    pub fn pending_items(&self) -> impl Iterator<Item = &StagedItem> {
        self.items.iter().filter(|i| i.is_pending())
    }

    pub fn has_pending(&self) -> bool {
        self.pending_items().next().is_some()
    }

    /// Whether the job was already signalled ready for this PO line.
    pub fn is_ready_for(&self, order_id: AggregateId, line_no: u32) -> bool {
        self.ready_lines.contains(&(order_id, line_no))
    }
}

impl AggregateRoot for JobStaging {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.job_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageItem {
    pub job_id: JobId,
    pub part_id: PartId,
    pub quantity: i64,
    pub location: LocationId,
    pub unit_ids: Vec<UnitId>,
    pub source: StagingSource,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkReadyForScheduling. Idempotent per PO line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadyForScheduling {
    pub job_id: JobId,
    pub source: StagingSource,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignJobTechnician {
    pub job_id: JobId,
    pub technician: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: PickUp. Moves every pending item to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickUp {
    pub job_id: JobId,
    pub destination: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseItems. Returns every pending item to general stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseItems {
    pub job_id: JobId,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingCommand {
    StageItem(StageItem),
    MarkReadyForScheduling(MarkReadyForScheduling),
    AssignJobTechnician(AssignJobTechnician),
    PickUp(PickUp),
    ReleaseItems(ReleaseItems),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStaged {
    pub job_id: JobId,
    pub item_no: u32,
    pub part_id: PartId,
    pub quantity: i64,
    pub location: LocationId,
    pub unit_ids: Vec<UnitId>,
    pub source: StagingSource,
    pub occurred_at: DateTime<Utc>,
}

/// Event: JobReadyForScheduling, the signal consumed by the job subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReadyForScheduling {
    pub job_id: JobId,
    pub source: StagingSource,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTechnicianAssigned {
    pub job_id: JobId,
    pub technician: UserId,
    pub previous: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsPickedUp {
    pub job_id: JobId,
    pub item_nos: Vec<u32>,
    pub destination: LocationId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsReleased {
    pub job_id: JobId,
    pub item_nos: Vec<u32>,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingEvent {
    ItemStaged(ItemStaged),
    JobReadyForScheduling(JobReadyForScheduling),
    JobTechnicianAssigned(JobTechnicianAssigned),
    ItemsPickedUp(ItemsPickedUp),
    ItemsReleased(ItemsReleased),
}

impl Event for StagingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StagingEvent::ItemStaged(_) => "fulfillment.staging.item_staged",
            StagingEvent::JobReadyForScheduling(_) => "fulfillment.staging.job_ready_for_scheduling",
            StagingEvent::JobTechnicianAssigned(_) => "fulfillment.staging.technician_assigned",
            StagingEvent::ItemsPickedUp(_) => "fulfillment.staging.items_picked_up",
            StagingEvent::ItemsReleased(_) => "fulfillment.staging.items_released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StagingEvent::ItemStaged(e) => e.occurred_at,
            StagingEvent::JobReadyForScheduling(e) => e.occurred_at,
            StagingEvent::JobTechnicianAssigned(e) => e.occurred_at,
            StagingEvent::ItemsPickedUp(e) => e.occurred_at,
            StagingEvent::ItemsReleased(e) => e.occurred_at,
        }
    }
}

impl Aggregate for JobStaging {
    type Command = StagingCommand;
    type Event = StagingEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StagingEvent::ItemStaged(e) => {
                self.job_id = e.job_id;
                self.items.push(StagedItem {
                    item_no: e.item_no,
                    part_id: e.part_id,
                    quantity: e.quantity,
                    location: e.location,
                    unit_ids: e.unit_ids.clone(),
                    source: e.source.clone(),
                    staged_at: e.occurred_at,
                    picked_up: false,
                    picked_up_at: None,
                    picked_up_by: None,
                    destination: None,
                    released: false,
                });
            }
            StagingEvent::JobReadyForScheduling(e) => {
                self.ready_lines.push((e.source.order_id, e.source.line_no));
            }
            StagingEvent::JobTechnicianAssigned(e) => {
                self.technician = Some(e.technician);
            }
            StagingEvent::ItemsPickedUp(e) => {
                for item in self.items.iter_mut().filter(|i| e.item_nos.contains(&i.item_no)) {
                    item.picked_up = true;
                    item.picked_up_at = Some(e.occurred_at);
                    item.picked_up_by = Some(e.actor);
                    item.destination = Some(e.destination);
                }
            }
            StagingEvent::ItemsReleased(e) => {
                for item in self.items.iter_mut().filter(|i| e.item_nos.contains(&i.item_no)) {
                    item.released = true;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StagingCommand::StageItem(cmd) => self.handle_stage(cmd),
            StagingCommand::MarkReadyForScheduling(cmd) => self.handle_mark_ready(cmd),
            StagingCommand::AssignJobTechnician(cmd) => self.handle_assign(cmd),
            StagingCommand::PickUp(cmd) => self.handle_pick_up(cmd),
            StagingCommand::ReleaseItems(cmd) => self.handle_release(cmd),
        }
    }
}

impl JobStaging {
    fn ensure_job(&self, job_id: JobId) -> Result<(), DomainError> {
        if self.job_id != job_id {
            return Err(DomainError::invariant("job_id mismatch"));
        }
        Ok(())
    }

    fn handle_stage(&self, cmd: &StageItem) -> Result<Vec<StagingEvent>, DomainError> {
        self.ensure_job(cmd.job_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("staged quantity must be positive"));
        }
        if !cmd.unit_ids.is_empty() && cmd.unit_ids.len() as i64 != cmd.quantity {
            return Err(DomainError::validation(format!(
                "staged quantity {} does not match {} serialized units",
                cmd.quantity,
                cmd.unit_ids.len()
            )));
        }

        Ok(vec![StagingEvent::ItemStaged(ItemStaged {
            job_id: cmd.job_id,
            item_no: self.items.len() as u32 + 1,
            part_id: cmd.part_id,
            quantity: cmd.quantity,
            location: cmd.location,
            unit_ids: cmd.unit_ids.clone(),
            source: cmd.source.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_ready(
        &self,
        cmd: &MarkReadyForScheduling,
    ) -> Result<Vec<StagingEvent>, DomainError> {
        self.ensure_job(cmd.job_id)?;

        if self.is_ready_for(cmd.source.order_id, cmd.source.line_no) {
            return Ok(vec![]);
        }

        Ok(vec![StagingEvent::JobReadyForScheduling(JobReadyForScheduling {
            job_id: cmd.job_id,
            source: cmd.source.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign(&self, cmd: &AssignJobTechnician) -> Result<Vec<StagingEvent>, DomainError> {
        self.ensure_job(cmd.job_id)?;

        if self.technician == Some(cmd.technician) {
            return Ok(vec![]);
        }

        Ok(vec![StagingEvent::JobTechnicianAssigned(JobTechnicianAssigned {
            job_id: cmd.job_id,
            technician: cmd.technician,
            previous: self.technician,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_pick_up(&self, cmd: &PickUp) -> Result<Vec<StagingEvent>, DomainError> {
        self.ensure_job(cmd.job_id)?;

        let item_nos: Vec<u32> = self.pending_items().map(|i| i.item_no).collect();
        if item_nos.is_empty() {
            return Err(DomainError::conflict(format!(
                "job {} has no staged items waiting for pickup",
                cmd.job_id
            )));
        }
        if self.pending_items().any(|i| i.location == cmd.destination) {
            return Err(DomainError::validation(
                "pickup destination must differ from the staging location",
            ));
        }

        Ok(vec![StagingEvent::ItemsPickedUp(ItemsPickedUp {
            job_id: cmd.job_id,
            item_nos,
            destination: cmd.destination,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseItems) -> Result<Vec<StagingEvent>, DomainError> {
        self.ensure_job(cmd.job_id)?;

        let item_nos: Vec<u32> = self.pending_items().map(|i| i.item_no).collect();
        if item_nos.is_empty() {
            return Err(DomainError::conflict(format!(
                "job {} has no staged items to release",
                cmd.job_id
            )));
        }

        Ok(vec![StagingEvent::ItemsReleased(ItemsReleased {
            job_id: cmd.job_id,
            item_nos,
            reason: cmd.reason.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
