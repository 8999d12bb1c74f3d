//! Read-side functions over rehydrated requests: queue filters, SLA and metrics.
//!
//! Nothing here is stored; every figure is recomputed from request state and `now`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use fieldstock_core::{DomainError, JobId, UserId};

use crate::request::{PartsRequest, RequestId, RequestItem, RequestStatus, Urgency};

/// Default number of days an open request may wait before breaching SLA.
pub const DEFAULT_SLA_DAYS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFilter {
    #[default]
    All,
    Open,
    Ordered,
}

impl QueueFilter {
    pub fn accepts(self, status: RequestStatus) -> bool {
        match self {
            QueueFilter::All => true,
            QueueFilter::Open => status == RequestStatus::Open,
            QueueFilter::Ordered => status == RequestStatus::Ordered,
        }
    }
}

impl core::str::FromStr for QueueFilter {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(QueueFilter::All),
            "open" => Ok(QueueFilter::Open),
            "ordered" => Ok(QueueFilter::Ordered),
            other => Err(DomainError::validation(format!("unknown request filter '{other}'"))),
        }
    }
}

/// Whole days elapsed since `requested_at`.
pub fn days_waiting(requested_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - requested_at).num_days().max(0)
}

/// An open request breaches SLA when it has waited strictly more than `threshold_days`.
pub fn is_sla_breached(
    status: RequestStatus,
    requested_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_days: i64,
) -> bool {
    status == RequestStatus::Open && days_waiting(requested_at, now) > threshold_days
}

/// One row of the request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub request_id: RequestId,
    pub job_id: Option<JobId>,
    pub urgency: Urgency,
    pub status: RequestStatus,
    pub requester: Option<UserId>,
    pub requested_at: DateTime<Utc>,
    pub items: Vec<RequestItem>,
    /// Only computed for open requests.
    pub days_waiting: Option<i64>,
    pub sla_breached: bool,
}

/// Requests matching `filter`, oldest first.
pub fn request_queue<'a>(
    requests: impl IntoIterator<Item = &'a PartsRequest>,
    filter: QueueFilter,
    now: DateTime<Utc>,
    sla_days: i64,
) -> Vec<QueueEntry> {
    let mut entries: Vec<QueueEntry> = requests
        .into_iter()
        .filter(|r| r.exists() && filter.accepts(r.status()))
        .filter_map(|r| {
            let requested_at = r.requested_at()?;
            let open = r.status() == RequestStatus::Open;
            Some(QueueEntry {
                request_id: r.id_typed(),
                job_id: r.job_id(),
                urgency: r.urgency(),
                status: r.status(),
                requester: r.requester(),
                requested_at,
                items: r.items().to_vec(),
                days_waiting: open.then(|| days_waiting(requested_at, now)),
                sla_breached: is_sla_breached(r.status(), requested_at, now, sla_days),
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });
    entries
}

/// Procurement dashboard figures.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcurementMetrics {
    pub pending: usize,
    pub on_order: usize,
    pub received_this_week: usize,
    pub avg_days_to_fulfill: Option<f64>,
    pub sla_breach_count: usize,
}

pub fn procurement_metrics<'a>(
    requests: impl IntoIterator<Item = &'a PartsRequest>,
    now: DateTime<Utc>,
    sla_days: i64,
) -> ProcurementMetrics {
    let week_ago = now - Duration::days(7);
    let mut metrics = ProcurementMetrics::default();
    let mut fulfill_days = Vec::new();

    for request in requests.into_iter().filter(|r| r.exists()) {
        let Some(requested_at) = request.requested_at() else {
            continue;
        };
        match request.status() {
            RequestStatus::Open => {
                metrics.pending += 1;
                if is_sla_breached(RequestStatus::Open, requested_at, now, sla_days) {
                    metrics.sla_breach_count += 1;
                }
            }
            RequestStatus::Ordered => metrics.on_order += 1,
            RequestStatus::Received => {
                if let Some(received_at) = request.received_at() {
                    if received_at > week_ago && received_at <= now {
                        metrics.received_this_week += 1;
                    }
                    let secs = (received_at - requested_at).num_seconds().max(0) as f64;
                    fulfill_days.push(secs / 86_400.0);
                }
            }
            RequestStatus::Cancelled => {}
        }
    }

    if !fulfill_days.is_empty() {
        metrics.avg_days_to_fulfill =
            Some(fulfill_days.iter().sum::<f64>() / fulfill_days.len() as f64);
    }
    metrics
}
