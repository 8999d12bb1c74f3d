use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_catalog::PartId;
use fieldstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError, JobId, UserId};
use fieldstock_events::Event;

fieldstock_core::aggregate_id!(
    /// Parts request identifier.
    RequestId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl core::str::FromStr for Urgency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "medium" => Ok(Urgency::Medium),
            "high" => Ok(Urgency::High),
            "critical" => Ok(Urgency::Critical),
            other => Err(DomainError::validation(format!("unknown urgency '{other}'"))),
        }
    }
}

/// Request status lifecycle: `open → ordered → received`, or `cancelled`.
///
/// Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Open,
    Ordered,
    Received,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::Ordered => "ordered",
            RequestStatus::Received => "received",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    fn is_live(self) -> bool {
        matches!(self, RequestStatus::Open | RequestStatus::Ordered)
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestItem {
    pub item_no: u32,
    pub part_id: PartId,
    pub quantity: i64,
    pub note: Option<String>,
}

/// Item input for [`CreateRequest`]; numbering is assigned by the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequestItem {
    pub part_id: PartId,
    pub quantity: i64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Active,
    Fulfilled,
    Cancelled,
}

/// A purchase order line that orders one of this request's items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLink {
    pub purchase_order_id: AggregateId,
    pub order_number: String,
    pub line_no: u32,
    pub item_no: u32,
    pub state: LinkState,
}

impl RequestLink {
    fn targets(&self, purchase_order_id: AggregateId, line_no: u32) -> bool {
        self.purchase_order_id == purchase_order_id && self.line_no == line_no
    }
}

/// Aggregate root: PartsRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartsRequest {
    id: RequestId,
    job_id: Option<JobId>,
    items: Vec<RequestItem>,
    urgency: Urgency,
    status: RequestStatus,
    requester: Option<UserId>,
    requested_at: Option<DateTime<Utc>>,
    ordered_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    links: Vec<RequestLink>,
    deleted: bool,
    version: u64,
    created: bool,
}

impl PartsRequest {
    pub fn empty(id: RequestId) -> Self {
        Self {
            id,
            job_id: None,
            items: Vec::new(),
            urgency: Urgency::default(),
            status: RequestStatus::Open,
            requester: None,
            requested_at: None,
            ordered_at: None,
            received_at: None,
            cancelled_at: None,
            links: Vec::new(),
            deleted: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RequestId {
        self.id
    }

    /// Created and not deleted.
    pub fn exists(&self) -> bool {
        self.created && !self.deleted
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn items(&self) -> &[RequestItem] {
        &self.items
    }

    pub fn item(&self, item_no: u32) -> Option<&RequestItem> {
        self.items.iter().find(|i| i.item_no == item_no)
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.requested_at
    }

    pub fn ordered_at(&self) -> Option<DateTime<Utc>> {
        self.ordered_at
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn links(&self) -> &[RequestLink] {
        &self.links
    }

    /// Items not currently covered by an active or fulfilled link.
    pub fn unlinked_items(&self) -> impl Iterator<Item = &RequestItem> {
        self.items.iter().filter(|item| {
            !self
                .links
                .iter()
                .any(|l| l.item_no == item.item_no && l.state != LinkState::Cancelled)
        })
    }

    /// Every item has arrived on some purchase order line.
    fn all_items_fulfilled(&self) -> bool {
        self.items.iter().all(|item| {
            self.links
                .iter()
                .any(|l| l.item_no == item.item_no && l.state == LinkState::Fulfilled)
        })
    }
}

impl AggregateRoot for PartsRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub request_id: RequestId,
    pub job_id: Option<JobId>,
    pub items: Vec<NewRequestItem>,
    pub urgency: Urgency,
    pub requester: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkToPurchaseOrder. Issued by the purchase order engine, never by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkToPurchaseOrder {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub order_number: String,
    pub line_no: u32,
    pub item_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOrdered. A no-op unless the request is open and linked to the order.
///
/// Sent when a linked order is submitted or approved. A link from a draft order leaves
/// the request `open`, since the draft can still be edited or cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOrdered {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordLineReceived. Sent once a linked line is fully received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLineReceived {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelLinks. `line_no = None` cancels every active link to the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelLinks {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub line_no: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: RequestId,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCommand {
    CreateRequest(CreateRequest),
    LinkToPurchaseOrder(LinkToPurchaseOrder),
    MarkOrdered(MarkOrdered),
    RecordLineReceived(RecordLineReceived),
    CancelLinks(CancelLinks),
    CancelRequest(CancelRequest),
    DeleteRequest(DeleteRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreated {
    pub request_id: RequestId,
    pub job_id: Option<JobId>,
    pub items: Vec<RequestItem>,
    pub urgency: Urgency,
    pub requester: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLinked {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub order_number: String,
    pub line_no: u32,
    pub item_no: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOrdered {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFulfilled {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCancelled {
    pub request_id: RequestId,
    pub purchase_order_id: AggregateId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReceived {
    pub request_id: RequestId,
    pub job_id: Option<JobId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub request_id: RequestId,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDeleted {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    RequestCreated(RequestCreated),
    RequestLinked(RequestLinked),
    RequestOrdered(RequestOrdered),
    LinkFulfilled(LinkFulfilled),
    LinkCancelled(LinkCancelled),
    RequestReceived(RequestReceived),
    RequestCancelled(RequestCancelled),
    RequestDeleted(RequestDeleted),
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::RequestCreated(_) => "requests.request.created",
            RequestEvent::RequestLinked(_) => "requests.request.linked",
            RequestEvent::RequestOrdered(_) => "requests.request.ordered",
            RequestEvent::LinkFulfilled(_) => "requests.request.link_fulfilled",
            RequestEvent::LinkCancelled(_) => "requests.request.link_cancelled",
            RequestEvent::RequestReceived(_) => "requests.request.received",
            RequestEvent::RequestCancelled(_) => "requests.request.cancelled",
            RequestEvent::RequestDeleted(_) => "requests.request.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RequestEvent::RequestCreated(e) => e.occurred_at,
            RequestEvent::RequestLinked(e) => e.occurred_at,
            RequestEvent::RequestOrdered(e) => e.occurred_at,
            RequestEvent::LinkFulfilled(e) => e.occurred_at,
            RequestEvent::LinkCancelled(e) => e.occurred_at,
            RequestEvent::RequestReceived(e) => e.occurred_at,
            RequestEvent::RequestCancelled(e) => e.occurred_at,
            RequestEvent::RequestDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PartsRequest {
    type Command = RequestCommand;
    type Event = RequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RequestEvent::RequestCreated(e) => {
                self.id = e.request_id;
                self.job_id = e.job_id;
                self.items = e.items.clone();
                self.urgency = e.urgency;
                self.status = RequestStatus::Open;
                self.requester = Some(e.requester);
                self.requested_at = Some(e.occurred_at);
                self.created = true;
            }
            RequestEvent::RequestLinked(e) => {
                self.links.push(RequestLink {
                    purchase_order_id: e.purchase_order_id,
                    order_number: e.order_number.clone(),
                    line_no: e.line_no,
                    item_no: e.item_no,
                    state: LinkState::Active,
                });
            }
            RequestEvent::RequestOrdered(e) => {
                self.status = RequestStatus::Ordered;
                self.ordered_at = Some(e.occurred_at);
            }
            RequestEvent::LinkFulfilled(e) => {
                for link in self.links.iter_mut() {
                    if link.state == LinkState::Active && link.targets(e.purchase_order_id, e.line_no) {
                        link.state = LinkState::Fulfilled;
                    }
                }
            }
            RequestEvent::LinkCancelled(e) => {
                for link in self.links.iter_mut() {
                    if link.state == LinkState::Active && link.targets(e.purchase_order_id, e.line_no) {
                        link.state = LinkState::Cancelled;
                    }
                }
            }
            RequestEvent::RequestReceived(e) => {
                self.status = RequestStatus::Received;
                self.received_at = Some(e.occurred_at);
            }
            RequestEvent::RequestCancelled(e) => {
                self.status = RequestStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
            }
            RequestEvent::RequestDeleted(_) => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RequestCommand::CreateRequest(cmd) => self.handle_create(cmd),
            RequestCommand::LinkToPurchaseOrder(cmd) => self.handle_link(cmd),
            RequestCommand::MarkOrdered(cmd) => self.handle_mark_ordered(cmd),
            RequestCommand::RecordLineReceived(cmd) => self.handle_line_received(cmd),
            RequestCommand::CancelLinks(cmd) => self.handle_cancel_links(cmd),
            RequestCommand::CancelRequest(cmd) => self.handle_cancel(cmd),
            RequestCommand::DeleteRequest(cmd) => self.handle_delete(cmd),
        }
    }
}

impl PartsRequest {
    fn ensure_exists(&self, request_id: RequestId) -> Result<(), DomainError> {
        if !self.exists() {
            return Err(DomainError::not_found(format!("parts request {request_id}")));
        }
        if self.id != request_id {
            return Err(DomainError::invariant("request_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("parts request already exists"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("a parts request needs at least one item"));
        }

        let mut items = Vec::with_capacity(cmd.items.len());
        for (idx, item) in cmd.items.iter().enumerate() {
            let item_no = idx as u32 + 1;
            if item.quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "item {item_no}: quantity must be positive"
                )));
            }
            items.push(RequestItem {
                item_no,
                part_id: item.part_id,
                quantity: item.quantity,
                note: item
                    .note
                    .as_ref()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty()),
            });
        }

        Ok(vec![RequestEvent::RequestCreated(RequestCreated {
            request_id: cmd.request_id,
            job_id: cmd.job_id,
            items,
            urgency: cmd.urgency,
            requester: cmd.requester,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link(&self, cmd: &LinkToPurchaseOrder) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.item(cmd.item_no).is_none() {
            return Err(DomainError::validation(format!(
                "request {} has no item {}",
                self.id, cmd.item_no
            )));
        }

        let existing = self
            .links
            .iter()
            .find(|l| l.item_no == cmd.item_no && l.state != LinkState::Cancelled);
        match existing {
            Some(link) if link.targets(cmd.purchase_order_id, cmd.line_no) => return Ok(vec![]),
            Some(link) => {
                return Err(DomainError::conflict(format!(
                    "request {} item {} is already on order via {} line {}",
                    self.id, cmd.item_no, link.order_number, link.line_no
                )));
            }
            None => {}
        }

        if !self.status.is_live() {
            return Err(DomainError::invariant(format!(
                "request {} is {} and cannot be linked to a purchase order",
                self.id, self.status
            )));
        }

        Ok(vec![RequestEvent::RequestLinked(RequestLinked {
            request_id: cmd.request_id,
            purchase_order_id: cmd.purchase_order_id,
            order_number: cmd.order_number.clone(),
            line_no: cmd.line_no,
            item_no: cmd.item_no,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_ordered(&self, cmd: &MarkOrdered) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let linked = self
            .links
            .iter()
            .any(|l| l.purchase_order_id == cmd.purchase_order_id && l.state != LinkState::Cancelled);
        if self.status != RequestStatus::Open || !linked {
            return Ok(vec![]);
        }

        Ok(vec![RequestEvent::RequestOrdered(RequestOrdered {
            request_id: cmd.request_id,
            purchase_order_id: cmd.purchase_order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_line_received(
        &self,
        cmd: &RecordLineReceived,
    ) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let has_active = self
            .links
            .iter()
            .any(|l| l.state == LinkState::Active && l.targets(cmd.purchase_order_id, cmd.line_no));
        if !has_active {
            return Ok(vec![]);
        }

        let fulfilled = RequestEvent::LinkFulfilled(LinkFulfilled {
            request_id: cmd.request_id,
            purchase_order_id: cmd.purchase_order_id,
            line_no: cmd.line_no,
            occurred_at: cmd.occurred_at,
        });
        let mut events = vec![fulfilled.clone()];

        let mut after = self.clone();
        after.apply(&fulfilled);
        events.extend(after.completion_events(cmd.purchase_order_id, cmd.occurred_at));
        Ok(events)
    }

    fn handle_cancel_links(&self, cmd: &CancelLinks) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let mut events = Vec::new();
        for link in &self.links {
            let matches_line = cmd.line_no.is_none_or(|line| link.line_no == line);
            if link.state == LinkState::Active
                && link.purchase_order_id == cmd.purchase_order_id
                && matches_line
            {
                let event = RequestEvent::LinkCancelled(LinkCancelled {
                    request_id: cmd.request_id,
                    purchase_order_id: cmd.purchase_order_id,
                    line_no: link.line_no,
                    occurred_at: cmd.occurred_at,
                });
                events.push(event);
            }
        }
        Ok(events)
    }

    /// `ordered`/`received` follow-ups once every item is fulfilled.
    fn completion_events(
        &self,
        purchase_order_id: AggregateId,
        occurred_at: DateTime<Utc>,
    ) -> Vec<RequestEvent> {
        if !self.status.is_live() || !self.all_items_fulfilled() {
            return vec![];
        }

        let mut events = Vec::new();
        if self.status == RequestStatus::Open {
            events.push(RequestEvent::RequestOrdered(RequestOrdered {
                request_id: self.id,
                purchase_order_id,
                occurred_at,
            }));
        }
        events.push(RequestEvent::RequestReceived(RequestReceived {
            request_id: self.id,
            job_id: self.job_id,
            occurred_at,
        }));
        events
    }

    fn handle_cancel(&self, cmd: &CancelRequest) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if !self.status.is_live() {
            return Err(DomainError::invariant(format!(
                "request {} is already {}",
                self.id, self.status
            )));
        }

        Ok(vec![RequestEvent::RequestCancelled(RequestCancelled {
            request_id: cmd.request_id,
            reason: cmd.reason.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteRequest) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if !self.links.is_empty() {
            return Err(DomainError::conflict(format!(
                "request {} has been linked to a purchase order; cancel it instead",
                self.id
            )));
        }

        Ok(vec![RequestEvent::RequestDeleted(RequestDeleted {
            request_id: cmd.request_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_po_id() -> AggregateId {
        AggregateId::new()
    }

    fn open_request(item_count: usize) -> PartsRequest {
        let request_id = RequestId::generate();
        let mut request = PartsRequest::empty(request_id);
        let items = (0..item_count)
            .map(|_| NewRequestItem {
                part_id: PartId::generate(),
                quantity: 2,
                note: None,
            })
            .collect();
        let events = request
            .handle(&RequestCommand::CreateRequest(CreateRequest {
                request_id,
                job_id: Some(JobId::new()),
                items,
                urgency: Urgency::High,
                requester: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        request.apply(&events[0]);
        request
    }

    fn run(request: &mut PartsRequest, command: RequestCommand) -> Vec<RequestEvent> {
        let events = request.handle(&command).unwrap();
        for event in &events {
            request.apply(event);
        }
        events
    }

    fn link(request_id: RequestId, po: AggregateId, line_no: u32, item_no: u32) -> RequestCommand {
        RequestCommand::LinkToPurchaseOrder(LinkToPurchaseOrder {
            request_id,
            purchase_order_id: po,
            order_number: "PO-100".to_string(),
            line_no,
            item_no,
            occurred_at: Utc::now(),
        })
    }

    fn received(request_id: RequestId, po: AggregateId, line_no: u32) -> RequestCommand {
        RequestCommand::RecordLineReceived(RecordLineReceived {
            request_id,
            purchase_order_id: po,
            line_no,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn request_without_items_is_rejected() {
        let request_id = RequestId::generate();
        let err = PartsRequest::empty(request_id)
            .handle(&RequestCommand::CreateRequest(CreateRequest {
                request_id,
                job_id: None,
                items: vec![],
                urgency: Urgency::Low,
                requester: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("at least one item") => {}
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn linking_twice_has_the_effect_of_linking_once() {
        let mut request = open_request(1);
        let id = request.id_typed();
        let po = test_po_id();

        assert_eq!(run(&mut request, link(id, po, 1, 1)).len(), 1);
        assert!(run(&mut request, link(id, po, 1, 1)).is_empty());
        assert_eq!(request.links().len(), 1);
    }

    #[test]
    fn mark_ordered_is_idempotent() {
        let mut request = open_request(1);
        let id = request.id_typed();
        let po = test_po_id();
        run(&mut request, link(id, po, 1, 1));

        let mark = RequestCommand::MarkOrdered(MarkOrdered {
            request_id: id,
            purchase_order_id: po,
            occurred_at: Utc::now(),
        });
        assert_eq!(run(&mut request, mark.clone()).len(), 1);
        assert_eq!(request.status(), RequestStatus::Ordered);
        assert!(run(&mut request, mark).is_empty());
    }

    #[test]
    fn received_only_once_every_link_is_fulfilled() {
        let mut request = open_request(2);
        let id = request.id_typed();
        let po = test_po_id();
        run(&mut request, link(id, po, 1, 1));
        run(&mut request, link(id, po, 2, 2));

        run(&mut request, received(id, po, 1));
        assert_eq!(request.status(), RequestStatus::Open);

        run(&mut request, received(id, po, 2));
        assert_eq!(request.status(), RequestStatus::Received);
        assert!(request.received_at().is_some());

        // A late duplicate notification changes nothing.
        assert!(run(&mut request, received(id, po, 2)).is_empty());
        assert_eq!(request.status(), RequestStatus::Received);
    }

    #[test]
    fn items_never_ordered_keep_the_request_on_order() {
        let mut request = open_request(2);
        let id = request.id_typed();
        let first = test_po_id();
        run(&mut request, link(id, first, 1, 1));
        run(
            &mut request,
            RequestCommand::MarkOrdered(MarkOrdered {
                request_id: id,
                purchase_order_id: first,
                occurred_at: Utc::now(),
            }),
        );

        run(&mut request, received(id, first, 1));
        assert_eq!(request.status(), RequestStatus::Ordered);
        assert!(request.received_at().is_none());

        let second = test_po_id();
        assert_eq!(run(&mut request, link(id, second, 1, 2)).len(), 1);
        run(&mut request, received(id, second, 1));
        assert_eq!(request.status(), RequestStatus::Received);
    }

    #[test]
    fn linking_from_a_draft_leaves_the_request_open() {
        let mut request = open_request(1);
        let id = request.id_typed();
        run(&mut request, link(id, test_po_id(), 1, 1));

        assert_eq!(request.status(), RequestStatus::Open);
        assert!(request.ordered_at().is_none());
    }

    #[test]
    fn cancelled_links_free_the_item_for_a_new_order() {
        let mut request = open_request(1);
        let id = request.id_typed();
        let first = test_po_id();
        run(&mut request, link(id, first, 1, 1));

        let second = test_po_id();
        assert!(matches!(
            request.handle(&link(id, second, 1, 1)),
            Err(DomainError::Conflict(_))
        ));

        run(
            &mut request,
            RequestCommand::CancelLinks(CancelLinks {
                request_id: id,
                purchase_order_id: first,
                line_no: None,
                occurred_at: Utc::now(),
            }),
        );
        assert_eq!(request.links()[0].state, LinkState::Cancelled);
        assert_eq!(run(&mut request, link(id, second, 1, 1)).len(), 1);
    }

    #[test]
    fn linked_requests_cannot_be_deleted() {
        let mut request = open_request(1);
        let id = request.id_typed();
        run(&mut request, link(id, test_po_id(), 1, 1));

        let err = request
            .handle(&RequestCommand::DeleteRequest(DeleteRequest {
                request_id: id,
                actor: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn deleted_requests_are_not_found() {
        let mut request = open_request(1);
        let id = request.id_typed();
        run(
            &mut request,
            RequestCommand::DeleteRequest(DeleteRequest {
                request_id: id,
                actor: UserId::new(),
                occurred_at: Utc::now(),
            }),
        );
        assert!(!request.exists());
        assert!(matches!(
            request.handle(&link(id, test_po_id(), 1, 1)),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn received_requests_cannot_be_cancelled() {
        let mut request = open_request(1);
        let id = request.id_typed();
        let po = test_po_id();
        run(&mut request, link(id, po, 1, 1));
        run(&mut request, received(id, po, 1));

        let err = request
            .handle(&RequestCommand::CancelRequest(CancelRequest {
                request_id: id,
                reason: None,
                actor: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }
}
