//! Materialized quantity per `(part, bucket)`, updated in the same commit as the ledger.
//!
//! The ledger aggregate is the authority on balances; this cache answers
//! `quantityAt(part, location)` without replaying the part's history.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::JobId;
use fieldstock_inventory::{LedgerEvent, MovementPosted, PartLedger, StockBucket};

use crate::aggregates::StreamAggregate;
use crate::event_store::postgres::map_sqlx_error;
use crate::event_store::{EventStoreError, InlineProjection, SqlProjection, StoredEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub part_id: PartId,
    pub location_id: LocationId,
    pub reserved_for: Option<JobId>,
    pub quantity: i64,
}

fn movements(events: &[StoredEvent]) -> impl Iterator<Item = Result<MovementPosted, EventStoreError>> + '_ {
    events
        .iter()
        .filter(|e| e.aggregate_type == PartLedger::AGGREGATE_TYPE)
        .map(|e| {
            e.decode::<LedgerEvent>().map(|ev| match ev {
                LedgerEvent::MovementPosted(m) => m,
            })
        })
}

/// Signed per-bucket deltas of a batch.
///
/// The ledger keeps every bucket within `i64`, so saturation never triggers on
/// committed movements.
fn deltas(events: &[StoredEvent]) -> Result<HashMap<(PartId, StockBucket), i64>, EventStoreError> {
    let mut out: HashMap<(PartId, StockBucket), i64> = HashMap::new();
    for movement in movements(events) {
        let m = movement?;
        if let Some(from) = m.from {
            let delta = out.entry((m.part_id, from)).or_insert(0);
            *delta = delta.saturating_sub(m.quantity);
        }
        if let Some(to) = m.to {
            let delta = out.entry((m.part_id, to)).or_insert(0);
            *delta = delta.saturating_add(m.quantity);
        }
    }
    Ok(out)
}

/// In-process stock levels.
#[derive(Debug, Default)]
pub struct StockLevelsProjection {
    levels: RwLock<HashMap<(PartId, StockBucket), i64>>,
}

impl StockLevelsProjection {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, part_id: PartId, bucket: StockBucket) -> i64 {
        self.levels
            .read()
            .ok()
            .and_then(|levels| levels.get(&(part_id, bucket)).copied())
            .unwrap_or(0)
    }

    /// General (unreserved) stock of a part at a location.
    pub fn quantity_at(&self, part_id: PartId, location_id: LocationId) -> i64 {
        self.bucket(part_id, StockBucket::general(location_id))
    }

    /// Stock of a part at a location reserved for a job.
    pub fn reserved_at(&self, part_id: PartId, location_id: LocationId, job_id: JobId) -> i64 {
        self.bucket(part_id, StockBucket::reserved(location_id, job_id))
    }

    /// Non-zero levels matching the optional part/location filters, sorted.
    pub fn levels(&self, part_id: Option<PartId>, location_id: Option<LocationId>) -> Vec<StockLevel> {
        let Ok(levels) = self.levels.read() else {
            return Vec::new();
        };
        let mut out: Vec<StockLevel> = levels
            .iter()
            .filter(|((p, b), q)| {
                **q != 0
                    && part_id.is_none_or(|id| id == *p)
                    && location_id.is_none_or(|id| id == b.location)
            })
            .map(|((p, b), q)| StockLevel {
                part_id: *p,
                location_id: b.location,
                reserved_for: b.reserved_for,
                quantity: *q,
            })
            .collect();
        out.sort_by_key(|l| (l.part_id, l.location_id, l.reserved_for));
        out
    }
}

impl InlineProjection for StockLevelsProjection {
    fn name(&self) -> &'static str {
        "stock_levels"
    }

    fn check(&self, events: &[StoredEvent]) -> Result<(), EventStoreError> {
        let deltas = deltas(events)?;
        for ((part_id, bucket), delta) in deltas {
            let after = self.bucket(part_id, bucket).saturating_add(delta);
            if after < 0 {
                return Err(EventStoreError::Projection(format!(
                    "stock of part {part_id} at {bucket} would become {after}"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, events: &[StoredEvent]) {
        let deltas = match deltas(events) {
            Ok(d) => d,
            Err(err) => {
                tracing::error!(error = %err, "stock levels could not decode ledger events");
                return;
            }
        };
        let Ok(mut levels) = self.levels.write() else {
            tracing::error!("stock levels lock poisoned");
            return;
        };
        for (key, delta) in deltas {
            let entry = levels.entry(key).or_insert(0);
            *entry = entry.saturating_add(delta);
            if *entry == 0 {
                levels.remove(&key);
            }
        }
    }

    fn reset(&self) {
        if let Ok(mut levels) = self.levels.write() {
            levels.clear();
        }
    }
}

/// `stock_levels` table, upserted inside the Postgres commit transaction.
///
/// General stock is stored with the nil UUID as `reserved_for` so the primary key stays
/// non-null. The `CHECK (quantity >= 0)` turns a negative balance into a rolled-back
/// commit.
#[derive(Debug, Default)]
pub struct StockLevelsTable;

#[async_trait::async_trait]
impl SqlProjection for StockLevelsTable {
    fn name(&self) -> &'static str {
        "stock_levels"
    }

    fn schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS stock_levels (
            part_id UUID NOT NULL,
            location_id UUID NOT NULL,
            reserved_for UUID NOT NULL,
            quantity BIGINT NOT NULL CHECK (quantity >= 0),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (part_id, location_id, reserved_for)
        )
        "#]
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[StoredEvent],
    ) -> Result<(), EventStoreError> {
        let mut deltas: Vec<_> = deltas(events)?.into_iter().collect();
        // Stable order keeps row locks consistent across concurrent commits.
        deltas.sort_by_key(|(key, _)| *key);

        for ((part_id, bucket), delta) in deltas {
            let reserved_for = bucket
                .reserved_for
                .map(|j| *j.as_uuid())
                .unwrap_or_else(Uuid::nil);
            sqlx::query(
                r#"
                INSERT INTO stock_levels (part_id, location_id, reserved_for, quantity)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (part_id, location_id, reserved_for)
                DO UPDATE SET quantity = stock_levels.quantity + EXCLUDED.quantity,
                              updated_at = now()
                "#,
            )
            .bind(part_id.aggregate_id().as_uuid())
            .bind(bucket.location.aggregate_id().as_uuid())
            .bind(reserved_for)
            .bind(delta)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_stock_level", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fieldstock_core::{AggregateId, UserId};
    use fieldstock_inventory::{MovementId, MovementType};

    fn posted(part_id: PartId, kind: MovementType, qty: i64, from: Option<StockBucket>, to: Option<StockBucket>, position: u64) -> StoredEvent {
        let event = LedgerEvent::MovementPosted(MovementPosted {
            movement_id: MovementId::generate(),
            part_id,
            movement_type: kind,
            quantity: qty,
            from,
            to,
            serial_numbers: vec![],
            reference: None,
            actor: UserId::new(),
            notes: None,
            occurred_at: Utc::now(),
        });
        StoredEvent {
            event_id: Uuid::now_v7(),
            aggregate_id: AggregateId::from_uuid(*part_id.aggregate_id().as_uuid()),
            aggregate_type: PartLedger::AGGREGATE_TYPE.to_string(),
            sequence_number: position,
            position,
            event_type: "inventory.ledger.movement_posted".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(&event).unwrap(),
        }
    }

    #[test]
    fn transfer_moves_quantity_between_buckets() {
        let projection = StockLevelsProjection::new();
        let part = PartId::generate();
        let w1 = LocationId::generate();
        let v1 = LocationId::generate();

        projection.apply(&[posted(part, MovementType::Receipt, 10, None, Some(StockBucket::general(w1)), 1)]);
        let transfer = [posted(
            part,
            MovementType::Transfer,
            3,
            Some(StockBucket::general(w1)),
            Some(StockBucket::general(v1)),
            2,
        )];
        projection.check(&transfer).unwrap();
        projection.apply(&transfer);

        assert_eq!(projection.quantity_at(part, w1), 7);
        assert_eq!(projection.quantity_at(part, v1), 3);
        assert_eq!(projection.levels(Some(part), None).len(), 2);
    }

    #[test]
    fn check_refuses_negative_balance() {
        let projection = StockLevelsProjection::new();
        let part = PartId::generate();
        let w1 = LocationId::generate();
        let err = projection
            .check(&[posted(part, MovementType::Disposal, 1, Some(StockBucket::general(w1)), None, 1)])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Projection(_)));
    }

    #[test]
    fn reserved_stock_is_separate_from_general() {
        let projection = StockLevelsProjection::new();
        let part = PartId::generate();
        let site = LocationId::generate();
        let job = JobId::new();
        projection.apply(&[posted(part, MovementType::Receipt, 2, None, Some(StockBucket::reserved(site, job)), 1)]);
        assert_eq!(projection.quantity_at(part, site), 0);
        assert_eq!(projection.reserved_at(part, site, job), 2);
    }
}
