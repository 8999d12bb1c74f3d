//! Purchase order creation, draft editing and status transitions.
//!
//! Request propagation happens in the same commit as the order change:
//! lines created from request items link the request, submit/approve flip linked open
//! requests to ordered, and removing lines or cancelling the order cancels the links.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fieldstock_catalog::{Part, PartId};
use fieldstock_core::{JobId, Money, TaxRate, UserId, VendorId};
use fieldstock_purchasing::numbering::SequenceId;
use fieldstock_purchasing::{
    AddLine, AllocateNumber, Approve, Cancel, CreatePurchaseOrder, NewOrderLine, OrderSource,
    PoNumberSequence, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderEvent, PurchaseOrderId,
    PurchaseOrderStatus, RemoveLine, RequestLineRef, SequenceCommand, SequenceEvent, SetCharges,
    Submit, UpdateLine,
};
use fieldstock_requests::{
    CancelLinks, LinkToPurchaseOrder, MarkOrdered, PartsRequest, RequestCommand, RequestId,
};

use super::Procurement;
use crate::error::{OperationError, OperationResult};
use crate::event_store::EventStore;
use crate::unit_of_work::UnitOfWork;

/// A line as entered. Description and price default to the catalog values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineInput {
    pub part_id: PartId,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: i64,
    #[serde(default)]
    pub unit_price: Option<Money>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub request: Option<RequestLineRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseOrder {
    pub vendor_id: VendorId,
    /// Defaults to today (UTC).
    #[serde(default)]
    pub order_date: Option<NaiveDate>,
    #[serde(default)]
    pub expected_delivery: Option<NaiveDate>,
    #[serde(default)]
    pub source: OrderSource,
    #[serde(default)]
    pub tax_rate: Option<TaxRate>,
    #[serde(default)]
    pub shipping: Money,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub lines: Vec<OrderLineInput>,
    /// Requests whose unlinked items become lines.
    #[serde(default)]
    pub request_ids: Vec<RequestId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineChanges {
    pub quantity: Option<i64>,
    pub unit_price: Option<Money>,
    pub description: Option<String>,
}

type PartCache = HashMap<PartId, Part>;
type RequestCache = HashMap<RequestId, PartsRequest>;

impl<S> Procurement<S>
where
    S: EventStore + ?Sized,
{
    /// Create a draft order with a freshly allocated number.
    #[instrument(skip_all, fields(vendor_id = %input.vendor_id, lines = input.lines.len(), requests = input.request_ids.len(), %actor))]
    pub async fn create_purchase_order(
        &self,
        input: NewPurchaseOrder,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        let input = &input;
        self.with_retry("create_purchase_order", move || {
            self.create_purchase_order_once(input, actor)
        })
        .await
    }

    async fn create_purchase_order_once(
        &self,
        input: &NewPurchaseOrder,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        let now = Utc::now();
        let mut uow = self.unit_of_work();
        let mut parts = PartCache::new();
        let mut requests = RequestCache::new();

        let mut lines = Vec::with_capacity(input.lines.len());
        for (idx, line) in input.lines.iter().enumerate() {
            let resolved = resolve_line(&mut uow, &mut parts, &mut requests, line)
                .await
                .map_err(|e| e.context(format!("line {}", idx + 1)))?;
            lines.push(resolved);
        }

        let explicit: HashSet<RequestLineRef> = lines.iter().filter_map(|l| l.request).collect();
        for &request_id in &input.request_ids {
            let request = cached_request(&mut uow, &mut requests, request_id).await?;
            let items: Vec<_> = request
                .unlinked_items()
                .filter(|item| {
                    !explicit.contains(&RequestLineRef {
                        request_id,
                        item_no: item.item_no,
                    })
                })
                .map(|item| OrderLineInput {
                    part_id: item.part_id,
                    description: None,
                    quantity: item.quantity,
                    unit_price: None,
                    job_id: request.job_id(),
                    request: Some(RequestLineRef {
                        request_id,
                        item_no: item.item_no,
                    }),
                })
                .collect();
            for item in &items {
                let resolved = resolve_line(&mut uow, &mut parts, &mut requests, item)
                    .await
                    .map_err(|e| e.context(format!("request {request_id}")))?;
                lines.push(resolved);
            }
        }

        let order_id = PurchaseOrderId::generate();
        let mut sequence: PoNumberSequence = uow.load(SequenceId::purchase_orders()).await?;
        let allocated = uow.execute(
            &mut sequence,
            SequenceCommand::AllocateNumber(AllocateNumber {
                prefix: self.settings.po_prefix.clone(),
                start: self.settings.po_start,
                order_id: order_id.aggregate_id(),
                occurred_at: now,
            }),
        )?;
        let number = allocated
            .into_iter()
            .map(|SequenceEvent::NumberAllocated(e)| e.number)
            .next()
            .ok_or_else(|| OperationError::internal("number sequence allocated nothing"))?;

        let mut order: PurchaseOrder = uow.load(order_id).await?;
        uow.execute(
            &mut order,
            PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                order_id,
                number: number.clone(),
                vendor_id: input.vendor_id,
                order_date: input.order_date.unwrap_or_else(|| now.date_naive()),
                expected_delivery: input.expected_delivery,
                source: input.source,
                tax_rate: input.tax_rate.unwrap_or(self.settings.default_tax_rate),
                shipping: input.shipping,
                notes: input.notes.clone(),
                lines,
                actor,
                occurred_at: now,
            }),
        )?;

        let refs: Vec<_> = order.request_refs().collect();
        link_requests(&mut uow, &mut requests, &order, refs).await?;
        uow.commit().await?;

        tracing::info!(%order_id, %number, lines = order.lines().len(), "purchase order created");
        Ok(order)
    }

    #[instrument(skip_all, fields(%order_id, part_id = %line.part_id, %actor))]
    pub async fn add_line(
        &self,
        order_id: PurchaseOrderId,
        line: OrderLineInput,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        let line = &line;
        self.with_retry("add_line", move || async move {
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            let mut parts = PartCache::new();
            let mut requests = RequestCache::new();

            let resolved = resolve_line(&mut uow, &mut parts, &mut requests, line).await?;
            add_resolved_line(&mut uow, &mut requests, &mut order, resolved).await?;
            uow.commit().await?;
            Ok(order)
        })
        .await
    }

    /// Add one line per unlinked item of `request_id`, at catalog price.
    #[instrument(skip_all, fields(%order_id, %request_id, %actor))]
    pub async fn add_request_lines(
        &self,
        order_id: PurchaseOrderId,
        request_id: RequestId,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        self.with_retry("add_request_lines", move || async move {
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            let mut parts = PartCache::new();
            let mut requests = RequestCache::new();

            let request = cached_request(&mut uow, &mut requests, request_id).await?;
            let job_id = request.job_id();
            let items: Vec<OrderLineInput> = request
                .unlinked_items()
                .map(|item| OrderLineInput {
                    part_id: item.part_id,
                    description: None,
                    quantity: item.quantity,
                    unit_price: None,
                    job_id,
                    request: Some(RequestLineRef {
                        request_id,
                        item_no: item.item_no,
                    }),
                })
                .collect();
            if items.is_empty() {
                return Err(OperationError::validation(format!(
                    "request {request_id} has no items left to order"
                )));
            }

            for item in &items {
                let resolved = resolve_line(&mut uow, &mut parts, &mut requests, item)
                    .await
                    .map_err(|e| e.context(format!("item {}", item.request.map_or(0, |r| r.item_no))))?;
                add_resolved_line(&mut uow, &mut requests, &mut order, resolved).await?;
            }
            uow.commit().await?;
            Ok(order)
        })
        .await
    }

    #[instrument(skip_all, fields(%order_id, line_no = line_no, %actor))]
    pub async fn update_line(
        &self,
        order_id: PurchaseOrderId,
        line_no: u32,
        changes: LineChanges,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        let changes = &changes;
        self.with_retry("update_line", move || async move {
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            uow.execute(
                &mut order,
                PurchaseOrderCommand::UpdateLine(UpdateLine {
                    order_id,
                    line_no,
                    quantity: changes.quantity,
                    unit_price: changes.unit_price,
                    description: changes.description.clone(),
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(order)
        })
        .await
    }

    /// Remove a draft line; its request link, if any, is cancelled.
    #[instrument(skip_all, fields(%order_id, line_no = line_no, %actor))]
    pub async fn remove_line(
        &self,
        order_id: PurchaseOrderId,
        line_no: u32,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        self.with_retry("remove_line", move || async move {
            let now = Utc::now();
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            let events = uow.execute(
                &mut order,
                PurchaseOrderCommand::RemoveLine(RemoveLine {
                    order_id,
                    line_no,
                    occurred_at: now,
                }),
            )?;

            for event in events {
                if let PurchaseOrderEvent::PurchaseOrderLineRemoved(removed) = event {
                    if let Some(link) = removed.request {
                        let mut request: PartsRequest = uow.load(link.request_id).await?;
                        if request.exists() {
                            uow.execute(
                                &mut request,
                                RequestCommand::CancelLinks(CancelLinks {
                                    request_id: link.request_id,
                                    purchase_order_id: order_id.aggregate_id(),
                                    line_no: Some(removed.line_no),
                                    occurred_at: now,
                                }),
                            )?;
                        }
                    }
                }
            }
            uow.commit().await?;
            Ok(order)
        })
        .await
    }

    #[instrument(skip_all, fields(%order_id, %actor))]
    pub async fn set_charges(
        &self,
        order_id: PurchaseOrderId,
        tax_rate: Option<TaxRate>,
        shipping: Option<Money>,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        self.with_retry("set_charges", move || async move {
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            uow.execute(
                &mut order,
                PurchaseOrderCommand::SetCharges(SetCharges {
                    order_id,
                    tax_rate,
                    shipping,
                    occurred_at: Utc::now(),
                }),
            )?;
            uow.commit().await?;
            Ok(order)
        })
        .await
    }

    #[instrument(skip_all, fields(%order_id, %actor))]
    pub async fn submit_purchase_order(
        &self,
        order_id: PurchaseOrderId,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        self.with_retry("submit_purchase_order", move || async move {
            let now = Utc::now();
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            uow.execute(
                &mut order,
                PurchaseOrderCommand::Submit(Submit {
                    order_id,
                    actor,
                    occurred_at: now,
                }),
            )?;
            mark_requests_ordered(&mut uow, &order).await?;
            uow.commit().await?;
            Ok(order)
        })
        .await
    }

    /// Approve a draft or submitted order. Approving twice changes nothing.
    #[instrument(skip_all, fields(%order_id, %actor))]
    pub async fn approve_purchase_order(
        &self,
        order_id: PurchaseOrderId,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        self.with_retry("approve_purchase_order", move || async move {
            let now = Utc::now();
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            uow.execute(
                &mut order,
                PurchaseOrderCommand::Approve(Approve {
                    order_id,
                    actor,
                    occurred_at: now,
                }),
            )?;
            mark_requests_ordered(&mut uow, &order).await?;
            uow.commit().await?;

            tracing::info!(%order_id, number = order.number(), "purchase order approved");
            Ok(order)
        })
        .await
    }

    /// Cancel an order that has received nothing; request links are cancelled with it.
    #[instrument(skip_all, fields(%order_id, %actor))]
    pub async fn cancel_purchase_order(
        &self,
        order_id: PurchaseOrderId,
        reason: Option<String>,
        actor: UserId,
    ) -> OperationResult<PurchaseOrder> {
        let reason = &reason;
        self.with_retry("cancel_purchase_order", move || async move {
            let now = Utc::now();
            let mut uow = self.unit_of_work();
            let mut order = existing_order(&mut uow, order_id).await?;
            uow.execute(
                &mut order,
                PurchaseOrderCommand::Cancel(Cancel {
                    order_id,
                    reason: reason.clone(),
                    actor,
                    occurred_at: now,
                }),
            )?;

            let request_ids: BTreeSet<RequestId> =
                order.request_refs().map(|(_, r)| r.request_id).collect();
            for request_id in request_ids {
                let mut request: PartsRequest = uow.load(request_id).await?;
                if !request.exists() {
                    continue;
                }
                uow.execute(
                    &mut request,
                    RequestCommand::CancelLinks(CancelLinks {
                        request_id,
                        purchase_order_id: order_id.aggregate_id(),
                        line_no: None,
                        occurred_at: now,
                    }),
                )?;
            }
            uow.commit().await?;

            tracing::info!(%order_id, number = order.number(), "purchase order cancelled");
            Ok(order)
        })
        .await
    }

    pub fn get_purchase_order(&self, order_id: PurchaseOrderId) -> OperationResult<PurchaseOrder> {
        self.projections
            .orders
            .get(&order_id)
            .filter(|o| o.exists())
            .ok_or_else(|| OperationError::not_found(format!("purchase order {order_id}")))
    }

    /// Orders newest first, optionally in one status.
    pub fn list_purchase_orders(&self, status: Option<PurchaseOrderStatus>) -> Vec<PurchaseOrder> {
        let mut orders = self
            .projections
            .orders
            .list(|o| o.exists() && status.is_none_or(|s| o.status() == s));
        orders.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.number().cmp(a.number()))
        });
        orders
    }
}

pub(super) async fn existing_order<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    order_id: PurchaseOrderId,
) -> OperationResult<PurchaseOrder> {
    let order: PurchaseOrder = uow.load(order_id).await?;
    if !order.exists() {
        return Err(OperationError::not_found(format!("purchase order {order_id}")));
    }
    Ok(order)
}

async fn cached_request<'m, S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    cache: &'m mut RequestCache,
    request_id: RequestId,
) -> OperationResult<&'m mut PartsRequest> {
    let request = uow.load_into(cache, request_id).await?;
    if !request.exists() {
        return Err(OperationError::not_found(format!("parts request {request_id}")));
    }
    Ok(request)
}

/// Fill in catalog defaults and check the request reference, if any.
async fn resolve_line<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    parts: &mut PartCache,
    requests: &mut RequestCache,
    input: &OrderLineInput,
) -> OperationResult<NewOrderLine> {
    let part = uow.load_into(parts, input.part_id).await?;
    if !part.exists() {
        return Err(OperationError::not_found(format!("part {}", input.part_id)));
    }
    if !part.is_active() {
        return Err(OperationError::conflict(format!(
            "part {} is inactive and cannot be ordered",
            part.sku()
        )));
    }
    let description = input
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(part.name())
        .to_string();
    let unit_price = input.unit_price.unwrap_or(part.unit_cost());

    let mut job_id = input.job_id;
    if let Some(link) = input.request {
        let request = cached_request(uow, requests, link.request_id).await?;
        let item = request.item(link.item_no).ok_or_else(|| {
            OperationError::validation(format!(
                "request {} has no item {}",
                link.request_id, link.item_no
            ))
        })?;
        if item.part_id != input.part_id {
            return Err(OperationError::validation(format!(
                "request {} item {} is for a different part",
                link.request_id, link.item_no
            )));
        }
        match (job_id, request.job_id()) {
            (Some(line_job), Some(request_job)) if line_job != request_job => {
                return Err(OperationError::validation(format!(
                    "line job {line_job} differs from request job {request_job}"
                )));
            }
            (None, request_job) => job_id = request_job,
            _ => {}
        }
    }

    Ok(NewOrderLine {
        part_id: input.part_id,
        description,
        quantity: input.quantity,
        unit_price,
        job_id,
        request: input.request,
    })
}

async fn add_resolved_line<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    requests: &mut RequestCache,
    order: &mut PurchaseOrder,
    line: NewOrderLine,
) -> OperationResult<()> {
    let order_id = order.id_typed();
    let events = uow.execute(
        order,
        PurchaseOrderCommand::AddLine(AddLine {
            order_id,
            line,
            occurred_at: Utc::now(),
        }),
    )?;
    let refs: Vec<(u32, RequestLineRef)> = events
        .into_iter()
        .filter_map(|event| match event {
            PurchaseOrderEvent::PurchaseOrderLineAdded(added) => {
                added.request.map(|r| (added.line_no, r))
            }
            _ => None,
        })
        .collect();
    link_requests(uow, requests, order, refs).await
}

async fn link_requests<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    requests: &mut RequestCache,
    order: &PurchaseOrder,
    refs: Vec<(u32, RequestLineRef)>,
) -> OperationResult<()> {
    for (line_no, link) in refs {
        let request = cached_request(uow, requests, link.request_id).await?;
        uow.execute(
            request,
            RequestCommand::LinkToPurchaseOrder(LinkToPurchaseOrder {
                request_id: link.request_id,
                purchase_order_id: order.id_typed().aggregate_id(),
                order_number: order.number().to_string(),
                line_no,
                item_no: link.item_no,
                occurred_at: Utc::now(),
            }),
        )
        .map_err(|e| e.context(format!("line {line_no}")))?;
    }
    Ok(())
}

async fn mark_requests_ordered<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    order: &PurchaseOrder,
) -> OperationResult<()> {
    let request_ids: BTreeSet<RequestId> = order.request_refs().map(|(_, r)| r.request_id).collect();
    for request_id in request_ids {
        let mut request: PartsRequest = uow.load(request_id).await?;
        if !request.exists() {
            continue;
        }
        uow.execute(
            &mut request,
            RequestCommand::MarkOrdered(MarkOrdered {
                request_id,
                purchase_order_id: order.id_typed().aggregate_id(),
                occurred_at: Utc::now(),
            }),
        )?;
    }
    Ok(())
}
