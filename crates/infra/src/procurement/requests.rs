//! Parts request intake and the request queue views.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_core::{JobId, UserId};
use fieldstock_requests::{
    CancelRequest, CreateRequest, DeleteRequest, NewRequestItem, PartsRequest, ProcurementMetrics,
    QueueEntry, QueueFilter, RequestCommand, RequestId, Urgency, procurement_metrics,
    request_queue,
};

use super::{Procurement, existing_part};
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub job_id: Option<JobId>,
    pub items: Vec<NewRequestItem>,
    #[serde(default)]
    pub urgency: Urgency,
}

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    /// Raise a request. Every item must name an active catalog part.
    #[instrument(skip_all, fields(job_id = ?input.job_id, items = input.items.len(), %actor))]
    pub async fn create_request(&self, input: NewRequest, actor: UserId) -> OperationResult<PartsRequest> {
        let input = &input;
        self.with_retry("create_request", move || async move {
            let mut uow = self.unit_of_work();

            let part_ids: BTreeSet<_> = input.items.iter().map(|i| i.part_id).collect();
            for part_id in part_ids {
                let part = existing_part(&mut uow, part_id).await?;
                if !part.is_active() {
                    return Err(OperationError::conflict(format!(
                        "part {} is inactive and cannot be requested",
                        part.sku()
                    )));
                }
            }

            let request_id = RequestId::generate();
            let mut request: PartsRequest = uow.load(request_id).await?;
            uow.execute(
                &mut request,
                RequestCommand::CreateRequest(CreateRequest {
                    request_id,
                    job_id: input.job_id,
                    items: input.items.clone(),
                    urgency: input.urgency,
                    requester: actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;

            tracing::info!(%request_id, "parts request created");
            Ok(request)
        })
        .await
    }

    #[instrument(skip_all, fields(%request_id, %actor))]
    pub async fn cancel_request(
        &self,
        request_id: RequestId,
        reason: Option<String>,
        actor: UserId,
    ) -> OperationResult<PartsRequest> {
        let reason = &reason;
        self.with_retry("cancel_request", move || async move {
            let mut uow = self.unit_of_work();
            let mut request = existing_request(&mut uow, request_id).await?;
            uow.execute(
                &mut request,
                RequestCommand::CancelRequest(CancelRequest {
                    request_id,
                    reason: reason.clone(),
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(request)
        })
        .await
    }

    /// Delete a request that was never linked to a purchase order.
    #[instrument(skip_all, fields(%request_id, %actor))]
    pub async fn delete_request(&self, request_id: RequestId, actor: UserId) -> OperationResult<()> {
        self.with_retry("delete_request", move || async move {
            let mut uow = self.unit_of_work();
            let mut request = existing_request(&mut uow, request_id).await?;
            uow.execute(
                &mut request,
                RequestCommand::DeleteRequest(DeleteRequest {
                    request_id,
                    actor,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(())
        })
        .await
    }

    pub fn get_request(&self, request_id: RequestId) -> OperationResult<PartsRequest> {
        self.projections
            .requests
            .get(&request_id)
            .filter(|r| r.exists())
            .ok_or_else(|| OperationError::not_found(format!("parts request {request_id}")))
    }

    /// The request queue, oldest first, annotated with days waiting and SLA state.
    pub fn list_requests(&self, filter: QueueFilter) -> Vec<QueueEntry> {
        self.list_requests_at(filter, Utc::now())
    }

    pub fn list_requests_at(&self, filter: QueueFilter, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let requests = self.projections.requests.list(|r| r.exists());
        request_queue(requests.iter(), filter, now, self.settings.sla_days)
    }

    pub fn procurement_metrics(&self) -> ProcurementMetrics {
        self.procurement_metrics_at(Utc::now())
    }

    pub fn procurement_metrics_at(&self, now: DateTime<Utc>) -> ProcurementMetrics {
        let requests = self.projections.requests.list(|r| r.exists());
        procurement_metrics(requests.iter(), now, self.settings.sla_days)
    }
}

/// Load a request that must exist (deleted requests count as missing).
pub(super) async fn existing_request<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    request_id: RequestId,
) -> OperationResult<PartsRequest> {
    let request: PartsRequest = uow.load(request_id).await?;
    if !request.exists() {
        return Err(OperationError::not_found(format!("parts request {request_id}")));
    }
    Ok(request)
}
