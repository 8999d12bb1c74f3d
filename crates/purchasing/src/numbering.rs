//! Purchase order numbering.
//!
//! One sequence stream for the whole inventory graph. Every order creation appends to
//! it in the same commit as the order itself, so two concurrent creates conflict on the
//! sequence and one of them retries with the next number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use fieldstock_events::Event;

fieldstock_core::aggregate_id!(
    /// Identifier of the PO number sequence stream.
    SequenceId
);

impl SequenceId {
    /// The single sequence stream.
    pub fn purchase_orders() -> Self {
        Self(AggregateId::from_uuid(uuid::Uuid::nil()))
    }
}

/// Aggregate root: PoNumberSequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoNumberSequence {
    id: SequenceId,
    last: Option<u64>,
    version: u64,
}

impl PoNumberSequence {
    pub fn empty(id: SequenceId) -> Self {
        Self {
            id,
            last: None,
            version: 0,
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// The number the next allocation will hand out.
    pub fn next_value(&self, start: u64) -> u64 {
        match self.last {
            Some(last) => (last + 1).max(start),
            None => start,
        }
    }
}

impl AggregateRoot for PoNumberSequence {
    type Id = SequenceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateNumber {
    pub prefix: String,
    pub start: u64,
    /// Order the number is reserved for.
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceCommand {
    AllocateNumber(AllocateNumber),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberAllocated {
    pub value: u64,
    pub number: String,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceEvent {
    NumberAllocated(NumberAllocated),
}

impl Event for SequenceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SequenceEvent::NumberAllocated(_) => "purchasing.sequence.number_allocated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SequenceEvent::NumberAllocated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PoNumberSequence {
    type Command = SequenceCommand;
    type Event = SequenceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SequenceEvent::NumberAllocated(e) => {
                self.last = Some(e.value);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SequenceCommand::AllocateNumber(cmd) => {
                let value = self.next_value(cmd.start);
                Ok(vec![SequenceEvent::NumberAllocated(NumberAllocated {
                    value,
                    number: format!("{}{value}", cmd.prefix),
                    order_id: cmd.order_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}
