use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_catalog::PartId;
use fieldstock_core::{
    Aggregate, AggregateRoot, DomainError, JobId, Money, TaxRate, UserId, VendorId,
};
use fieldstock_events::Event;
use fieldstock_requests::RequestId;

fieldstock_core::aggregate_id!(
    /// Purchase order identifier.
    PurchaseOrderId
);

/// Purchase order status lifecycle.
///
/// `draft → submitted → approved → (partial ↔ received)`; `cancelled` from any state
/// before goods arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseOrderStatus {
    Draft,
    Submitted,
    Approved,
    Partial,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Submitted => "submitted",
            PurchaseOrderStatus::Approved => "approved",
            PurchaseOrderStatus::Partial => "partial",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_receivable(self) -> bool {
        matches!(self, PurchaseOrderStatus::Approved | PurchaseOrderStatus::Partial)
    }
}

impl core::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PurchaseOrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(PurchaseOrderStatus::Draft),
            "submitted" => Ok(PurchaseOrderStatus::Submitted),
            "approved" => Ok(PurchaseOrderStatus::Approved),
            "partial" => Ok(PurchaseOrderStatus::Partial),
            "received" => Ok(PurchaseOrderStatus::Received),
            "cancelled" => Ok(PurchaseOrderStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown purchase order status '{other}'"))),
        }
    }
}

/// Channel the order is placed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    #[default]
    LocalVendor,
    VendorPortal,
}

impl core::str::FromStr for OrderSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local_vendor" => Ok(OrderSource::LocalVendor),
            "vendor_portal" => Ok(OrderSource::VendorPortal),
            other => Err(DomainError::validation(format!("unknown order source '{other}'"))),
        }
    }
}

/// The request item a line was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestLineRef {
    pub request_id: RequestId,
    pub item_no: u32,
}

/// Purchase order line.
///
/// `quantity_received` and `quantity_damaged` are cumulative across receiving passes;
/// `quantity_received ≤ quantity_ordered` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLine {
    pub line_no: u32,
    pub part_id: PartId,
    pub description: String,
    pub quantity_ordered: i64,
    pub quantity_received: i64,
    pub quantity_damaged: i64,
    pub unit_price: Money,
    pub job_id: Option<JobId>,
    pub request: Option<RequestLineRef>,
}

impl PurchaseOrderLine {
    pub fn remaining(&self) -> i64 {
        (self.quantity_ordered - self.quantity_received).max(0)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity_ordered)
    }
}

/// Line input for [`CreatePurchaseOrder`] and [`AddLine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub part_id: PartId,
    pub description: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub job_id: Option<JobId>,
    pub request: Option<RequestLineRef>,
}

/// Quantities accepted for one line in a receiving pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReceipt {
    pub line_no: u32,
    pub quantity: i64,
    pub damaged: i64,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    number: String,
    vendor_id: Option<VendorId>,
    order_date: Option<NaiveDate>,
    expected_delivery: Option<NaiveDate>,
    source: OrderSource,
    status: PurchaseOrderStatus,
    lines: Vec<PurchaseOrderLine>,
    next_line_no: u32,
    tax_rate: TaxRate,
    shipping: Money,
    subtotal: Money,
    tax: Money,
    total: Money,
    notes: Option<String>,
    created_by: Option<UserId>,
    created_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            number: String::new(),
            vendor_id: None,
            order_date: None,
            expected_delivery: None,
            source: OrderSource::default(),
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            next_line_no: 1,
            tax_rate: TaxRate::ZERO,
            shipping: Money::ZERO,
            subtotal: Money::ZERO,
            tax: Money::ZERO,
            total: Money::ZERO,
            notes: None,
            created_by: None,
            created_at: None,
            cancel_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn vendor_id(&self) -> Option<VendorId> {
        self.vendor_id
    }

    pub fn order_date(&self) -> Option<NaiveDate> {
        self.order_date
    }

    pub fn expected_delivery(&self) -> Option<NaiveDate> {
        self.expected_delivery
    }

    pub fn source(&self) -> OrderSource {
        self.source
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[PurchaseOrderLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&PurchaseOrderLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn tax_rate(&self) -> TaxRate {
        self.tax_rate
    }

    pub fn shipping(&self) -> Money {
        self.shipping
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn tax(&self) -> Money {
        self.tax
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn has_receipts(&self) -> bool {
        self.lines.iter().any(|l| l.quantity_received > 0)
    }

    /// Request items referenced by this order's lines.
    pub fn request_refs(&self) -> impl Iterator<Item = (u32, RequestLineRef)> + '_ {
        self.lines
            .iter()
            .filter_map(|l| l.request.map(|r| (l.line_no, r)))
    }

    /// Status after applying `receipts` to the current line counters.
    ///
    /// `received` when every line is complete, `partial` once anything has arrived,
    /// otherwise unchanged.
    pub fn status_after(&self, receipts: &[LineReceipt]) -> PurchaseOrderStatus {
        let mut any_received = false;
        let mut all_complete = true;
        for line in &self.lines {
            let now: i64 = receipts
                .iter()
                .filter(|r| r.line_no == line.line_no)
                .map(|r| r.quantity)
                .sum();
            let received = line.quantity_received + now;
            any_received |= received > 0;
            all_complete &= received >= line.quantity_ordered;
        }

        if all_complete && !self.lines.is_empty() {
            PurchaseOrderStatus::Received
        } else if any_received {
            PurchaseOrderStatus::Partial
        } else {
            self.status
        }
    }

    fn line_amounts(&self) -> impl Iterator<Item = (i64, Money)> + '_ {
        self.lines.iter().map(|l| (l.quantity_ordered, l.unit_price))
    }

    fn recompute_totals(&mut self) {
        self.subtotal = self.lines.iter().map(PurchaseOrderLine::line_total).sum();
        self.tax = self.tax_rate.tax_on(self.subtotal);
        self.total = self.subtotal + self.tax + self.shipping;
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub order_id: PurchaseOrderId,
    /// Allocated by [`crate::PoNumberSequence`].
    pub number: String,
    pub vendor_id: VendorId,
    pub order_date: NaiveDate,
    pub expected_delivery: Option<NaiveDate>,
    pub source: OrderSource,
    pub tax_rate: TaxRate,
    pub shipping: Money,
    pub notes: Option<String>,
    pub lines: Vec<NewOrderLine>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub order_id: PurchaseOrderId,
    pub line: NewOrderLine,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateLine (only allowed in Draft). `None` keeps the current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLine {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub quantity: Option<i64>,
    pub unit_price: Option<Money>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLine {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetCharges (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCharges {
    pub order_id: PurchaseOrderId,
    pub tax_rate: Option<TaxRate>,
    pub shipping: Option<Money>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submit {
    pub order_id: PurchaseOrderId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Approve. Approving an approved order is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approve {
    pub order_id: PurchaseOrderId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveGoods.
///
/// Strict: quantities must already be clamped (see [`crate::plan_receipt`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveGoods {
    pub order_id: PurchaseOrderId,
    pub lines: Vec<LineReceipt>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    AddLine(AddLine),
    UpdateLine(UpdateLine),
    RemoveLine(RemoveLine),
    SetCharges(SetCharges),
    Submit(Submit),
    Approve(Approve),
    Cancel(Cancel),
    ReceiveGoods(ReceiveGoods),
}

/// Event: PurchaseOrderCreated (header only; lines follow as `LineAdded`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub order_id: PurchaseOrderId,
    pub number: String,
    pub vendor_id: VendorId,
    pub order_date: NaiveDate,
    pub expected_delivery: Option<NaiveDate>,
    pub source: OrderSource,
    pub tax_rate: TaxRate,
    pub shipping: Money,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLineAdded {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub part_id: PartId,
    pub description: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub job_id: Option<JobId>,
    pub request: Option<RequestLineRef>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderLineUpdated (carries the full new values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLineUpdated {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub quantity: i64,
    pub unit_price: Money,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLineRemoved {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub request: Option<RequestLineRef>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargesSet {
    pub order_id: PurchaseOrderId,
    pub tax_rate: TaxRate,
    pub shipping: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderSubmitted {
    pub order_id: PurchaseOrderId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderApproved {
    pub order_id: PurchaseOrderId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCancelled {
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GoodsReceived.
///
/// Carries the accepted quantities of one receiving pass. Ledger, unit and staging
/// effects are separate events on their own streams, committed in the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub order_id: PurchaseOrderId,
    pub lines: Vec<LineReceipt>,
    pub status_after: PurchaseOrderStatus,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderLineAdded(PurchaseOrderLineAdded),
    PurchaseOrderLineUpdated(PurchaseOrderLineUpdated),
    PurchaseOrderLineRemoved(PurchaseOrderLineRemoved),
    ChargesSet(ChargesSet),
    PurchaseOrderSubmitted(PurchaseOrderSubmitted),
    PurchaseOrderApproved(PurchaseOrderApproved),
    PurchaseOrderCancelled(PurchaseOrderCancelled),
    GoodsReceived(GoodsReceived),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseOrderLineAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::PurchaseOrderLineUpdated(_) => "purchasing.order.line_updated",
            PurchaseOrderEvent::PurchaseOrderLineRemoved(_) => "purchasing.order.line_removed",
            PurchaseOrderEvent::ChargesSet(_) => "purchasing.order.charges_set",
            PurchaseOrderEvent::PurchaseOrderSubmitted(_) => "purchasing.order.submitted",
            PurchaseOrderEvent::PurchaseOrderApproved(_) => "purchasing.order.approved",
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => "purchasing.order.cancelled",
            PurchaseOrderEvent::GoodsReceived(_) => "purchasing.order.goods_received",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderLineUpdated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderLineRemoved(e) => e.occurred_at,
            PurchaseOrderEvent::ChargesSet(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderSubmitted(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderApproved(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderCancelled(e) => e.occurred_at,
            PurchaseOrderEvent::GoodsReceived(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.number = e.number.clone();
                self.vendor_id = Some(e.vendor_id);
                self.order_date = Some(e.order_date);
                self.expected_delivery = e.expected_delivery;
                self.source = e.source;
                self.tax_rate = e.tax_rate;
                self.shipping = e.shipping;
                self.notes = e.notes.clone();
                self.created_by = Some(e.actor);
                self.created_at = Some(e.occurred_at);
                self.status = PurchaseOrderStatus::Draft;
                self.lines.clear();
                self.next_line_no = 1;
                self.created = true;
                self.recompute_totals();
            }
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => {
                self.lines.push(PurchaseOrderLine {
                    line_no: e.line_no,
                    part_id: e.part_id,
                    description: e.description.clone(),
                    quantity_ordered: e.quantity,
                    quantity_received: 0,
                    quantity_damaged: 0,
                    unit_price: e.unit_price,
                    job_id: e.job_id,
                    request: e.request,
                });
                self.next_line_no = self.next_line_no.max(e.line_no + 1);
                self.recompute_totals();
            }
            PurchaseOrderEvent::PurchaseOrderLineUpdated(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == e.line_no) {
                    line.quantity_ordered = e.quantity;
                    line.unit_price = e.unit_price;
                    line.description = e.description.clone();
                }
                self.recompute_totals();
            }
            PurchaseOrderEvent::PurchaseOrderLineRemoved(e) => {
                self.lines.retain(|l| l.line_no != e.line_no);
                self.recompute_totals();
            }
            PurchaseOrderEvent::ChargesSet(e) => {
                self.tax_rate = e.tax_rate;
                self.shipping = e.shipping;
                self.recompute_totals();
            }
            PurchaseOrderEvent::PurchaseOrderSubmitted(_) => {
                self.status = PurchaseOrderStatus::Submitted;
            }
            PurchaseOrderEvent::PurchaseOrderApproved(_) => {
                self.status = PurchaseOrderStatus::Approved;
            }
            PurchaseOrderEvent::PurchaseOrderCancelled(e) => {
                self.status = PurchaseOrderStatus::Cancelled;
                self.cancel_reason = e.reason.clone();
            }
            PurchaseOrderEvent::GoodsReceived(e) => {
                for receipt in &e.lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == receipt.line_no) {
                        line.quantity_received += receipt.quantity;
                        line.quantity_damaged += receipt.damaged;
                    }
                }
                self.status = e.status_after;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::UpdateLine(cmd) => self.handle_update_line(cmd),
            PurchaseOrderCommand::RemoveLine(cmd) => self.handle_remove_line(cmd),
            PurchaseOrderCommand::SetCharges(cmd) => self.handle_set_charges(cmd),
            PurchaseOrderCommand::Submit(cmd) => self.handle_submit(cmd),
            PurchaseOrderCommand::Approve(cmd) => self.handle_approve(cmd),
            PurchaseOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
            PurchaseOrderCommand::ReceiveGoods(cmd) => self.handle_receive(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_order(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("purchase order {order_id}")));
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_draft(&self) -> Result<(), DomainError> {
        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invariant(format!(
                "purchase order {} is {}; lines and charges can only change while draft",
                self.number, self.status
            )));
        }
        Ok(())
    }

    fn check_new_line(&self, line: &NewOrderLine, pending: &[RequestLineRef]) -> Result<(), DomainError> {
        if line.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if line.unit_price.is_negative() {
            return Err(DomainError::validation("unit price cannot be negative"));
        }
        if line.description.trim().is_empty() {
            return Err(DomainError::validation("line description cannot be empty"));
        }
        if let Some(request) = line.request {
            let duplicate = self.lines.iter().any(|l| l.request == Some(request))
                || pending.contains(&request);
            if duplicate {
                return Err(DomainError::conflict(format!(
                    "request {} item {} is already on purchase order {}",
                    request.request_id, request.item_no, self.number
                )));
            }
        }
        Ok(())
    }

    fn line_added(&self, line_no: u32, line: &NewOrderLine, occurred_at: DateTime<Utc>) -> PurchaseOrderEvent {
        PurchaseOrderEvent::PurchaseOrderLineAdded(PurchaseOrderLineAdded {
            order_id: self.id,
            line_no,
            part_id: line.part_id,
            description: line.description.trim().to_string(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            job_id: line.job_id,
            request: line.request,
            occurred_at,
        })
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.number.trim().is_empty() {
            return Err(DomainError::validation("purchase order number cannot be empty"));
        }
        if cmd.shipping.is_negative() {
            return Err(DomainError::validation("shipping cannot be negative"));
        }
        if let Some(expected) = cmd.expected_delivery {
            if expected < cmd.order_date {
                return Err(DomainError::validation(
                    "expected delivery cannot be before the order date",
                ));
            }
        }

        let mut events = vec![PurchaseOrderEvent::PurchaseOrderCreated(PurchaseOrderCreated {
            order_id: cmd.order_id,
            number: cmd.number.trim().to_string(),
            vendor_id: cmd.vendor_id,
            order_date: cmd.order_date,
            expected_delivery: cmd.expected_delivery,
            source: cmd.source,
            tax_rate: cmd.tax_rate,
            shipping: cmd.shipping,
            notes: cmd.notes.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })];

        let mut pending = Vec::new();
        let mut draft = Self::empty(cmd.order_id);
        draft.number = cmd.number.trim().to_string();
        for (idx, line) in cmd.lines.iter().enumerate() {
            let line_no = idx as u32 + 1;
            draft
                .check_new_line(line, &pending)
                .map_err(|e| prefix_line(line_no, e))?;
            if let Some(request) = line.request {
                pending.push(request);
            }
            events.push(draft.line_added(line_no, line, cmd.occurred_at));
        }
        ensure_totals_fit(
            cmd.lines.iter().map(|l| (l.quantity, l.unit_price)),
            cmd.tax_rate,
            cmd.shipping,
        )?;
        Ok(events)
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;
        self.ensure_draft()?;
        self.check_new_line(&cmd.line, &[])?;
        ensure_totals_fit(
            self.line_amounts()
                .chain([(cmd.line.quantity, cmd.line.unit_price)]),
            self.tax_rate,
            self.shipping,
        )?;

        Ok(vec![self.line_added(self.next_line_no, &cmd.line, cmd.occurred_at)])
    }

    fn handle_update_line(&self, cmd: &UpdateLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;
        self.ensure_draft()?;

        let line = self.line(cmd.line_no).ok_or_else(|| {
            DomainError::not_found(format!("line {} on purchase order {}", cmd.line_no, self.number))
        })?;
        let quantity = cmd.quantity.unwrap_or(line.quantity_ordered);
        let unit_price = cmd.unit_price.unwrap_or(line.unit_price);
        let description = cmd
            .description
            .as_ref()
            .map(|d| d.trim().to_string())
            .unwrap_or_else(|| line.description.clone());

        if quantity <= 0 {
            return Err(prefix_line(cmd.line_no, DomainError::validation("quantity must be positive")));
        }
        if unit_price.is_negative() {
            return Err(prefix_line(cmd.line_no, DomainError::validation("unit price cannot be negative")));
        }
        if description.is_empty() {
            return Err(prefix_line(cmd.line_no, DomainError::validation("description cannot be empty")));
        }
        if quantity == line.quantity_ordered
            && unit_price == line.unit_price
            && description == line.description
        {
            return Ok(vec![]);
        }
        ensure_totals_fit(
            self.lines.iter().map(|l| {
                if l.line_no == cmd.line_no {
                    (quantity, unit_price)
                } else {
                    (l.quantity_ordered, l.unit_price)
                }
            }),
            self.tax_rate,
            self.shipping,
        )
        .map_err(|e| prefix_line(cmd.line_no, e))?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderLineUpdated(PurchaseOrderLineUpdated {
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            quantity,
            unit_price,
            description,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_line(&self, cmd: &RemoveLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;
        self.ensure_draft()?;

        let line = self.line(cmd.line_no).ok_or_else(|| {
            DomainError::not_found(format!("line {} on purchase order {}", cmd.line_no, self.number))
        })?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderLineRemoved(PurchaseOrderLineRemoved {
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            request: line.request,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_charges(&self, cmd: &SetCharges) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;
        self.ensure_draft()?;

        let tax_rate = cmd.tax_rate.unwrap_or(self.tax_rate);
        let shipping = cmd.shipping.unwrap_or(self.shipping);
        if shipping.is_negative() {
            return Err(DomainError::validation("shipping cannot be negative"));
        }
        if tax_rate == self.tax_rate && shipping == self.shipping {
            return Ok(vec![]);
        }
        ensure_totals_fit(self.line_amounts(), tax_rate, shipping)?;

        Ok(vec![PurchaseOrderEvent::ChargesSet(ChargesSet {
            order_id: cmd.order_id,
            tax_rate,
            shipping,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &Submit) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;

        match self.status {
            PurchaseOrderStatus::Draft => {}
            PurchaseOrderStatus::Submitted => return Ok(vec![]),
            other => {
                return Err(DomainError::invariant(format!(
                    "purchase order {} is {other} and cannot be submitted",
                    self.number
                )));
            }
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot submit purchase order without lines",
            ));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderSubmitted(PurchaseOrderSubmitted {
            order_id: cmd.order_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &Approve) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;

        match self.status {
            PurchaseOrderStatus::Draft | PurchaseOrderStatus::Submitted => {}
            PurchaseOrderStatus::Approved => return Ok(vec![]),
            other => {
                return Err(DomainError::invariant(format!(
                    "purchase order {} is {other} and cannot be approved",
                    self.number
                )));
            }
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot approve purchase order without lines",
            ));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderApproved(PurchaseOrderApproved {
            order_id: cmd.order_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;

        if !matches!(
            self.status,
            PurchaseOrderStatus::Draft | PurchaseOrderStatus::Submitted | PurchaseOrderStatus::Approved
        ) {
            return Err(DomainError::invariant(format!(
                "purchase order {} is {} and cannot be cancelled",
                self.number, self.status
            )));
        }
        if self.has_receipts() {
            return Err(DomainError::invariant(format!(
                "purchase order {} has received goods and cannot be cancelled",
                self.number
            )));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCancelled(PurchaseOrderCancelled {
            order_id: cmd.order_id,
            reason: cmd.reason.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveGoods) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_order(cmd.order_id)?;

        // Invariant: Cannot receive before approval.
        if !self.status.is_receivable() {
            return Err(DomainError::invariant(format!(
                "purchase order {} is {}; only approved or partially received orders can be received",
                self.number, self.status
            )));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("no lines to receive"));
        }

        let mut seen = HashSet::new();
        for receipt in &cmd.lines {
            if !seen.insert(receipt.line_no) {
                return Err(DomainError::validation(format!(
                    "line {}: listed more than once",
                    receipt.line_no
                )));
            }
            let line = self.line(receipt.line_no).ok_or_else(|| {
                DomainError::validation(format!(
                    "line {}: not on purchase order {}",
                    receipt.line_no, self.number
                ))
            })?;
            if receipt.quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "line {}: received quantity must be positive",
                    receipt.line_no
                )));
            }
            if receipt.quantity > line.remaining() {
                return Err(DomainError::conflict(format!(
                    "line {}: receiving {} would exceed the {} remaining",
                    receipt.line_no,
                    receipt.quantity,
                    line.remaining()
                )));
            }
            if receipt.damaged < 0 || receipt.damaged > receipt.quantity {
                return Err(DomainError::validation(format!(
                    "line {}: damaged quantity must be between 0 and {}",
                    receipt.line_no, receipt.quantity
                )));
            }
        }

        Ok(vec![PurchaseOrderEvent::GoodsReceived(GoodsReceived {
            order_id: cmd.order_id,
            lines: cmd.lines.clone(),
            status_after: self.status_after(&cmd.lines),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}

/// Refuse lines and charges whose totals would not fit in [`Money`].
fn ensure_totals_fit(
    lines: impl IntoIterator<Item = (i64, Money)>,
    tax_rate: TaxRate,
    shipping: Money,
) -> Result<(), DomainError> {
    let total = lines
        .into_iter()
        .try_fold(Money::ZERO, |acc, (quantity, price)| {
            price.checked_times(quantity).and_then(|t| acc.checked_add(t))
        })
        .and_then(|subtotal| subtotal.checked_add(tax_rate.checked_tax_on(subtotal)?))
        .and_then(|total| total.checked_add(shipping));
    match total {
        Some(_) => Ok(()),
        None => Err(DomainError::validation("purchase order total is too large")),
    }
}

fn prefix_line(line_no: u32, err: DomainError) -> DomainError {
    match err {
        DomainError::Validation(msg) => DomainError::Validation(format!("line {line_no}: {msg}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldstock_core::AggregateId;

    fn test_order_id() -> PurchaseOrderId {
        PurchaseOrderId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn line(quantity: i64, price_cents: i64) -> NewOrderLine {
        NewOrderLine {
            part_id: PartId::generate(),
            description: "Condenser fan motor".to_string(),
            quantity,
            unit_price: Money::from_cents(price_cents),
            job_id: None,
            request: None,
        }
    }

    fn created(lines: Vec<NewOrderLine>, tax_bp: u32, shipping_cents: i64) -> PurchaseOrder {
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        let events = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                order_id,
                number: "PO-100".to_string(),
                vendor_id: VendorId::new(),
                order_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
                expected_delivery: None,
                source: OrderSource::LocalVendor,
                tax_rate: TaxRate::from_basis_points(tax_bp),
                shipping: Money::from_cents(shipping_cents),
                notes: None,
                lines,
                actor: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap();
        for event in &events {
            order.apply(event);
        }
        order
    }

    fn execute(order: &mut PurchaseOrder, command: PurchaseOrderCommand) -> Vec<PurchaseOrderEvent> {
        let events = order.handle(&command).unwrap();
        for event in &events {
            order.apply(event);
        }
        events
    }

    fn approved(lines: Vec<NewOrderLine>) -> PurchaseOrder {
        let mut order = created(lines, 0, 0);
        let order_id = order.id_typed();
        execute(
            &mut order,
            PurchaseOrderCommand::Approve(Approve {
                order_id,
                actor: UserId::new(),
                occurred_at: test_time(),
            }),
        );
        order
    }

    fn receive(order_id: PurchaseOrderId, line_no: u32, quantity: i64) -> PurchaseOrderCommand {
        PurchaseOrderCommand::ReceiveGoods(ReceiveGoods {
            order_id,
            lines: vec![LineReceipt {
                line_no,
                quantity,
                damaged: 0,
            }],
            actor: UserId::new(),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn totals_follow_line_changes_while_draft() {
        let mut order = created(vec![line(2, 1_000), line(1, 550)], 800, 1_500);
        assert_eq!(order.subtotal(), Money::from_cents(2_550));
        assert_eq!(order.tax(), Money::from_cents(204));
        assert_eq!(order.total(), Money::from_cents(2_550 + 204 + 1_500));

        let order_id = order.id_typed();
        execute(
            &mut order,
            PurchaseOrderCommand::UpdateLine(UpdateLine {
                order_id,
                line_no: 1,
                quantity: Some(3),
                unit_price: None,
                description: None,
                occurred_at: test_time(),
            }),
        );
        execute(
            &mut order,
            PurchaseOrderCommand::RemoveLine(RemoveLine {
                order_id,
                line_no: 2,
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.subtotal(), Money::from_cents(3_000));
        assert_eq!(order.tax(), Money::from_cents(240));
        assert_eq!(order.total(), Money::from_cents(3_000 + 240 + 1_500));
    }

    #[test]
    fn totals_that_do_not_fit_are_refused() {
        let order_id = test_order_id();
        let err = PurchaseOrder::empty(order_id)
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                order_id,
                number: "PO-100".to_string(),
                vendor_id: VendorId::new(),
                order_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
                expected_delivery: None,
                source: OrderSource::LocalVendor,
                tax_rate: TaxRate::ZERO,
                shipping: Money::ZERO,
                notes: None,
                lines: vec![line(i64::MAX / 2, 1_000)],
                actor: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut order = created(vec![line(1, i64::MAX / 2)], 0, 0);
        let order_id = order.id_typed();
        let add = order.handle(&PurchaseOrderCommand::AddLine(AddLine {
            order_id,
            line: line(1, i64::MAX / 2 + 2),
            occurred_at: test_time(),
        }));
        assert!(matches!(add, Err(DomainError::Validation(_))));

        let update = order.handle(&PurchaseOrderCommand::UpdateLine(UpdateLine {
            order_id,
            line_no: 1,
            quantity: Some(3),
            unit_price: None,
            description: None,
            occurred_at: test_time(),
        }));
        assert!(matches!(update, Err(DomainError::Validation(msg)) if msg.starts_with("line 1:")));

        let charges = order.handle(&PurchaseOrderCommand::SetCharges(SetCharges {
            order_id,
            tax_rate: Some(TaxRate::from_basis_points(20_000)),
            shipping: None,
            occurred_at: test_time(),
        }));
        assert!(matches!(charges, Err(DomainError::Validation(_))));

        execute(
            &mut order,
            PurchaseOrderCommand::SetCharges(SetCharges {
                order_id,
                tax_rate: None,
                shipping: Some(Money::from_cents(500)),
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.total(), Money::from_cents(i64::MAX / 2 + 500));
    }

    #[test]
    fn new_lines_take_the_next_number_after_removal() {
        let mut order = created(vec![line(1, 100), line(1, 100)], 0, 0);
        let order_id = order.id_typed();
        execute(
            &mut order,
            PurchaseOrderCommand::RemoveLine(RemoveLine {
                order_id,
                line_no: 2,
                occurred_at: test_time(),
            }),
        );
        execute(
            &mut order,
            PurchaseOrderCommand::AddLine(AddLine {
                order_id,
                line: line(4, 100),
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.lines().last().unwrap().line_no, 3);
    }

    #[test]
    fn cannot_receive_before_approval() {
        let order = created(vec![line(10, 100)], 0, 0);
        let err = order.handle(&receive(order.id_typed(), 1, 1)).unwrap_err();
        match err {
            DomainError::InvariantViolation(msg) if msg.contains("draft") => {}
            _ => panic!("Expected invariant violation for draft order"),
        }
    }

    #[test]
    fn partial_then_received() {
        let mut order = approved(vec![line(10, 100)]);
        let order_id = order.id_typed();

        execute(&mut order, receive(order_id, 1, 4));
        assert_eq!(order.status(), PurchaseOrderStatus::Partial);
        assert_eq!(order.lines()[0].quantity_received, 4);

        execute(&mut order, receive(order_id, 1, 6));
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert_eq!(order.lines()[0].remaining(), 0);
    }

    #[test]
    fn aggregate_refuses_over_receipt() {
        let mut order = approved(vec![line(5, 100)]);
        let order_id = order.id_typed();
        execute(&mut order, receive(order_id, 1, 3));

        let err = order.handle(&receive(order_id, 1, 3)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(order.lines()[0].quantity_received, 3);
    }

    #[test]
    fn draft_edits_are_refused_after_approval() {
        let order = approved(vec![line(1, 100)]);
        let err = order
            .handle(&PurchaseOrderCommand::AddLine(AddLine {
                order_id: order.id_typed(),
                line: line(1, 100),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn re_approving_is_a_no_op() {
        let order = approved(vec![line(1, 100)]);
        let events = order
            .handle(&PurchaseOrderCommand::Approve(Approve {
                order_id: order.id_typed(),
                actor: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn received_goods_block_cancellation() {
        let mut order = approved(vec![line(2, 100)]);
        let order_id = order.id_typed();
        execute(&mut order, receive(order_id, 1, 1));

        let err = order
            .handle(&PurchaseOrderCommand::Cancel(Cancel {
                order_id,
                reason: Some("vendor out of stock".to_string()),
                actor: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn the_same_request_item_cannot_appear_twice() {
        let request = RequestLineRef {
            request_id: RequestId::generate(),
            item_no: 1,
        };
        let mut first = line(1, 100);
        first.request = Some(request);
        let mut second = line(1, 100);
        second.request = Some(request);

        let order_id = test_order_id();
        let err = PurchaseOrder::empty(order_id)
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                order_id,
                number: "PO-101".to_string(),
                vendor_id: VendorId::new(),
                order_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
                expected_delivery: None,
                source: OrderSource::VendorPortal,
                tax_rate: TaxRate::ZERO,
                shipping: Money::ZERO,
                notes: None,
                lines: vec![first, second],
                actor: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
