//! Movement history: every ledger entry, queryable most-recent-first.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::{JobId, UserId};
use fieldstock_inventory::{
    LedgerEvent, MovementId, MovementReference, MovementType, PartLedger, StockBucket,
};

use crate::aggregates::StreamAggregate;
use crate::event_store::{InlineProjection, StoredEvent};

/// Pagination parameters for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub part_id: Option<PartId>,
    /// Matches either endpoint.
    pub location_id: Option<LocationId>,
    pub movement_type: Option<MovementType>,
    /// Matches a job reservation on either endpoint or a job reference.
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub position: u64,
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

impl MovementRecord {
    fn endpoints(&self) -> impl Iterator<Item = &StockBucket> {
        self.from.iter().chain(self.to.iter())
    }

    fn matches(&self, filter: &MovementFilter) -> bool {
        if filter.part_id.is_some_and(|p| p != self.part_id) {
            return false;
        }
        if filter.movement_type.is_some_and(|t| t != self.movement_type) {
            return false;
        }
        if let Some(location) = filter.location_id {
            if !self.endpoints().any(|b| b.location == location) {
                return false;
            }
        }
        if let Some(job) = filter.job_id {
            let reserved = self.endpoints().any(|b| b.reserved_for == Some(job));
            let referenced = matches!(self.reference, Some(MovementReference::Job { job_id }) if job_id == job);
            if !reserved && !referenced {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPage {
    pub movements: Vec<MovementRecord>,
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

#[derive(Debug, Default)]
pub struct MovementHistoryProjection {
    records: RwLock<Vec<MovementRecord>>,
}

impl MovementHistoryProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Movements matching `filter`, most recent first.
    pub fn query(&self, filter: &MovementFilter, pagination: Pagination) -> MovementPage {
        let pagination = Pagination::new(Some(pagination.limit), Some(pagination.offset));
        let Ok(records) = self.records.read() else {
            return MovementPage {
                movements: Vec::new(),
                total: 0,
                pagination,
                has_more: false,
            };
        };

        let matching: Vec<&MovementRecord> = records.iter().rev().filter(|r| r.matches(filter)).collect();
        let total = matching.len() as u64;
        let movements: Vec<MovementRecord> = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();
        let has_more = (pagination.offset as u64 + movements.len() as u64) < total;

        MovementPage {
            movements,
            total,
            pagination,
            has_more,
        }
    }
}

impl InlineProjection for MovementHistoryProjection {
    fn name(&self) -> &'static str {
        "movement_history"
    }

    fn apply(&self, events: &[StoredEvent]) {
        let Ok(mut records) = self.records.write() else {
            tracing::error!("movement history lock poisoned");
            return;
        };

        for stored in events.iter().filter(|e| e.aggregate_type == PartLedger::AGGREGATE_TYPE) {
            let LedgerEvent::MovementPosted(m) = match stored.decode::<LedgerEvent>() {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(error = %err, "skipping undecodable ledger event");
                    continue;
                }
            };
            records.push(MovementRecord {
                position: stored.position,
                movement_id: m.movement_id,
                part_id: m.part_id,
                movement_type: m.movement_type,
                quantity: m.quantity,
                from: m.from,
                to: m.to,
                serial_numbers: m.serial_numbers,
                reference: m.reference,
                actor: m.actor,
                notes: m.notes,
                occurred_at: m.occurred_at,
            });
        }
        // Commits arrive in position order; replays may not.
        records.sort_by_key(|r| r.position);
    }

    fn reset(&self) {
        if let Ok(mut records) = self.records.write() {
            records.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(position: u64, part_id: PartId, kind: MovementType, to: Option<StockBucket>) -> MovementRecord {
        MovementRecord {
            position,
            movement_id: MovementId::generate(),
            part_id,
            movement_type: kind,
            quantity: 1,
            from: None,
            to,
            serial_numbers: vec![],
            reference: None,
            actor: UserId::new(),
            notes: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn pagination_defaults_and_cap() {
        assert_eq!(Pagination::default().limit, 50);
        assert_eq!(Pagination::new(Some(5_000), None).limit, 1000);
    }

    #[test]
    fn query_is_most_recent_first_and_filtered() {
        let projection = MovementHistoryProjection::new();
        let part = PartId::generate();
        let other = PartId::generate();
        let w1 = LocationId::generate();
        let job = JobId::new();
        {
            let mut records = projection.records.write().unwrap();
            records.push(record(1, part, MovementType::Receipt, Some(StockBucket::general(w1))));
            records.push(record(2, other, MovementType::Receipt, Some(StockBucket::general(w1))));
            records.push(record(3, part, MovementType::Receipt, Some(StockBucket::reserved(w1, job))));
        }

        let page = projection.query(
            &MovementFilter {
                part_id: Some(part),
                ..Default::default()
            },
            Pagination::default(),
        );
        assert_eq!(page.total, 2);
        assert_eq!(page.movements[0].position, 3);

        let page = projection.query(
            &MovementFilter {
                job_id: Some(job),
                ..Default::default()
            },
            Pagination::default(),
        );
        assert_eq!(page.total, 1);

        let page = projection.query(&MovementFilter::default(), Pagination::new(Some(1), Some(1)));
        assert_eq!(page.movements.len(), 1);
        assert_eq!(page.movements[0].position, 2);
        assert!(page.has_more);
    }
}
