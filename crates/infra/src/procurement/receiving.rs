//! Receiving goods against a purchase order.
//!
//! One receiving pass is one commit. It touches the order, the ledger of every received
//! part, one unit stream per serial number, the staging of every job-linked line and the
//! requests whose lines complete. Either all of it lands or none of it does.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_assets::{RegisterUnit, SerializedUnit, UnitCommand, UnitId, UnitOrigin, UnitStatus, WarrantyWindow};
use fieldstock_catalog::{Part, PartId};
use fieldstock_core::{JobId, UserId};
use fieldstock_fulfillment::{
    JobStaging, MarkReadyForScheduling, StageItem, StagingCommand, StagingEvent, StagingSource,
};
use fieldstock_inventory::{
    LedgerCommand, MovementId, MovementReference, MovementType, PartLedger, PostMovement,
    StockBucket,
};
use fieldstock_purchasing::{
    PlannedLine, PurchaseOrderId, PurchaseOrderStatus, ReceiptLineInput, plan_receipt,
};
use fieldstock_requests::{PartsRequest, RecordLineReceived, RequestCommand, RequestEvent, RequestId};

use super::purchasing::existing_order;
use super::{Procurement, existing_part, usable_locations};
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLineResult {
    pub line_no: u32,
    pub part_id: PartId,
    pub requested: i64,
    pub accepted: i64,
    pub damaged: i64,
    /// More was entered than the line had left to receive.
    pub clamped: bool,
    pub completes_line: bool,
    pub unit_ids: Vec<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptResult {
    pub order_id: PurchaseOrderId,
    pub order_number: String,
    pub status: PurchaseOrderStatus,
    pub lines: Vec<ReceiptLineResult>,
    /// Requests that became fully received in this pass.
    pub requests_received: Vec<RequestId>,
    /// Jobs that got a ready-for-scheduling signal in this pass.
    pub jobs_ready: Vec<JobId>,
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    /// Receive a pass of goods against an approved or partially received order.
    ///
    /// Quantities above what a line has left are clamped, not refused. Serialized
    /// parts need one serial number per accepted unit. A pass that ends up accepting
    /// nothing commits nothing and reports the order unchanged.
    #[instrument(skip_all, fields(%order_id, lines = inputs.len(), %actor))]
    pub async fn receive_goods(
        &self,
        order_id: PurchaseOrderId,
        inputs: Vec<ReceiptLineInput>,
        actor: UserId,
    ) -> OperationResult<ReceiptResult> {
        let inputs = inputs.as_slice();
        self.with_retry("receive_goods", move || self.receive_once(order_id, inputs, actor))
            .await
    }

    async fn receive_once(
        &self,
        order_id: PurchaseOrderId,
        inputs: &[ReceiptLineInput],
        actor: UserId,
    ) -> OperationResult<ReceiptResult> {
        let now = Utc::now();
        let mut uow = self.unit_of_work();
        let mut order = existing_order(&mut uow, order_id).await?;

        let part_ids: BTreeSet<PartId> = order.lines().iter().map(|l| l.part_id).collect();
        let mut parts: HashMap<PartId, Part> = HashMap::with_capacity(part_ids.len());
        for part_id in part_ids {
            parts.insert(part_id, existing_part(&mut uow, part_id).await?);
        }

        let plan = plan_receipt(&order, inputs, |part_id| {
            parts.get(&part_id).is_some_and(|p| p.is_serialized())
        })?;

        let mut result = ReceiptResult {
            order_id,
            order_number: order.number().to_string(),
            status: order.status(),
            lines: plan.lines.iter().map(|l| line_result(l, Vec::new())).collect(),
            requests_received: Vec::new(),
            jobs_ready: Vec::new(),
        };
        if !plan.has_receipts() {
            tracing::info!("nothing accepted; receipt not recorded");
            return Ok(result);
        }

        usable_locations(&mut uow, plan.accepted_lines().filter_map(|l| l.location)).await?;
        let receive = plan.to_command(&order, actor, now);
        uow.execute(&mut order, receive)?;

        let mut ledgers: HashMap<PartId, PartLedger> = HashMap::new();
        let mut stagings: HashMap<JobId, JobStaging> = HashMap::new();
        let mut requests: HashMap<RequestId, PartsRequest> = HashMap::new();

        for line in plan.accepted_lines() {
            let Some(location) = line.location else {
                continue;
            };
            let context = |e: OperationError| e.context(format!("line {}", line.line_no));
            let origin = UnitOrigin {
                order_id: order_id.aggregate_id(),
                order_number: order.number().to_string(),
                line_no: line.line_no,
            };

            let ledger = uow.load_into(&mut ledgers, line.part_id).await?;
            uow.execute(
                ledger,
                LedgerCommand::PostMovement(PostMovement {
                    movement_id: MovementId::generate(),
                    part_id: line.part_id,
                    movement_type: MovementType::Receipt,
                    quantity: line.accepted,
                    from: None,
                    to: Some(StockBucket::for_job(location, line.job_id)),
                    serial_numbers: line.serial_numbers.clone(),
                    reference: Some(MovementReference::PurchaseOrderLine {
                        order_id: origin.order_id,
                        order_number: origin.order_number.clone(),
                        line_no: line.line_no,
                    }),
                    actor,
                    notes: None,
                    occurred_at: now,
                }),
            )
            .map_err(context)?;

            let warranty = WarrantyWindow::new(line.warranty_start, line.warranty_end)
                .map_err(|e| context(e.into()))?;
            let mut unit_ids = Vec::with_capacity(line.serial_numbers.len());
            for serial in &line.serial_numbers {
                let unit_id = UnitId::generate();
                let mut unit: SerializedUnit = uow.load(unit_id).await?;
                let status = if line.damaged_serials.contains(serial) {
                    UnitStatus::Defective
                } else {
                    UnitStatus::InStock
                };
                uow.execute(
                    &mut unit,
                    UnitCommand::RegisterUnit(RegisterUnit {
                        unit_id,
                        part_id: line.part_id,
                        serial_number: serial.clone(),
                        status,
                        location,
                        reserved_for: line.job_id,
                        vendor_id: order.vendor_id(),
                        origin: Some(origin.clone()),
                        purchased_on: order.order_date(),
                        unit_cost: line.unit_price,
                        warranty,
                        actor,
                        occurred_at: now,
                    }),
                )
                .map_err(context)?;
                unit_ids.push(unit_id);
            }

            if let Some(job_id) = line.job_id {
                let source = StagingSource {
                    order_id: origin.order_id,
                    order_number: origin.order_number.clone(),
                    line_no: line.line_no,
                };
                let staging = uow.load_into(&mut stagings, job_id).await?;
                uow.execute(
                    staging,
                    StagingCommand::StageItem(StageItem {
                        job_id,
                        part_id: line.part_id,
                        quantity: line.accepted,
                        location,
                        unit_ids: unit_ids.clone(),
                        source: source.clone(),
                        occurred_at: now,
                    }),
                )
                .map_err(context)?;
                if line.completes_line {
                    let events = uow.execute(
                        staging,
                        StagingCommand::MarkReadyForScheduling(MarkReadyForScheduling {
                            job_id,
                            source,
                            occurred_at: now,
                        }),
                    )?;
                    if events.iter().any(|e| matches!(e, StagingEvent::JobReadyForScheduling(_)))
                        && !result.jobs_ready.contains(&job_id)
                    {
                        result.jobs_ready.push(job_id);
                    }
                }
            }

            if let (true, Some(link)) = (line.completes_line, line.request) {
                let request = uow.load_into(&mut requests, link.request_id).await?;
                let events = uow.execute(
                    request,
                    RequestCommand::RecordLineReceived(RecordLineReceived {
                        request_id: link.request_id,
                        purchase_order_id: origin.order_id,
                        line_no: line.line_no,
                        occurred_at: now,
                    }),
                )?;
                if events.iter().any(|e| matches!(e, RequestEvent::RequestReceived(_))) {
                    result.requests_received.push(link.request_id);
                }
            }

            if line.clamped {
                tracing::warn!(
                    line_no = line.line_no,
                    requested = line.requested,
                    accepted = line.accepted,
                    "received quantity clamped to what the line had left"
                );
            }
            if let Some(entry) = result.lines.iter_mut().find(|l| l.line_no == line.line_no) {
                entry.unit_ids = unit_ids;
            }
        }

        uow.commit().await?;

        result.status = plan.status_after;
        tracing::info!(
            order_number = %result.order_number,
            status = %result.status,
            requests_received = result.requests_received.len(),
            jobs_ready = result.jobs_ready.len(),
            "goods received"
        );
        Ok(result)
    }
}

fn line_result(line: &PlannedLine, unit_ids: Vec<UnitId>) -> ReceiptLineResult {
    ReceiptLineResult {
        line_no: line.line_no,
        part_id: line.part_id,
        requested: line.requested,
        accepted: line.accepted,
        damaged: line.damaged,
        clamped: line.clamped,
        completes_line: line.completes_line,
        unit_ids,
    }
}
