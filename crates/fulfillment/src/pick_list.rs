//! Pick lists: staged, not-yet-picked-up items per job, grouped by technician.
//!
//! Derived on read from [`JobStaging`] state; never stored.

use serde::{Deserialize, Serialize};

use fieldstock_assets::UnitId;
use fieldstock_catalog::{LocationId, PartId};
use fieldstock_core::{JobId, UserId};

use crate::staging::JobStaging;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickListItem {
    pub item_no: u32,
    pub part_id: PartId,
    pub quantity: i64,
    pub location: LocationId,
    pub unit_ids: Vec<UnitId>,
    pub order_number: String,
    pub line_no: u32,
    pub picked_up: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickList {
    pub job_id: JobId,
    pub technician: Option<UserId>,
    pub items: Vec<PickListItem>,
    pub picked_items: usize,
    pub total_items: usize,
    /// `picked_items / total_items`.
    pub ratio: f64,
}

impl PickList {
    /// Build the pick list for a job, or `None` when nothing is waiting.
    ///
    /// Released items are left out entirely.
    pub fn for_job(staging: &JobStaging) -> Option<PickList> {
        if !staging.has_pending() {
            return None;
        }

        let items: Vec<PickListItem> = staging
            .items()
            .iter()
            .filter(|i| !i.released)
            .map(|i| PickListItem {
                item_no: i.item_no,
                part_id: i.part_id,
                quantity: i.quantity,
                location: i.location,
                unit_ids: i.unit_ids.clone(),
                order_number: i.source.order_number.clone(),
                line_no: i.source.line_no,
                picked_up: i.picked_up,
            })
            .collect();

        let picked_items = items.iter().filter(|i| i.picked_up).count();
        let total_items = items.len();
        Some(PickList {
            job_id: staging.job_id(),
            technician: staging.technician(),
            ratio: picked_items as f64 / total_items.max(1) as f64,
            picked_items,
            total_items,
            items,
        })
    }
}

/// Pick lists for one technician (`None` = unassigned jobs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupGroup {
    pub technician: Option<UserId>,
    pub jobs: Vec<PickList>,
}

/// Jobs with staged items waiting for pickup, grouped by assigned technician.
///
/// With `technician = Some(..)` only that technician's group is returned ("my pickups").
pub fn parts_ready_for_pickup<'a>(
    stagings: impl IntoIterator<Item = &'a JobStaging>,
    technician: Option<UserId>,
) -> Vec<PickupGroup> {
    let mut groups: Vec<PickupGroup> = Vec::new();

    for list in stagings.into_iter().filter_map(PickList::for_job) {
        if technician.is_some() && list.technician != technician {
            continue;
        }
        match groups.iter_mut().find(|g| g.technician == list.technician) {
            Some(group) => group.jobs.push(list),
            None => groups.push(PickupGroup {
                technician: list.technician,
                jobs: vec![list],
            }),
        }
    }

    // Assigned technicians first, unassigned last.
    groups.sort_by(|a, b| match (a.technician, b.technician) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => core::cmp::Ordering::Less,
        (None, Some(_)) => core::cmp::Ordering::Greater,
        (None, None) => core::cmp::Ordering::Equal,
    });
    for group in &mut groups {
        group.jobs.sort_by_key(|j| j.job_id);
    }
    groups
}
