//! Binding of domain aggregates to event-store streams.

use serde::de::DeserializeOwned;
use serde::Serialize;

use fieldstock_assets::{SerializedUnit, UnitId};
use fieldstock_catalog::{LocationId, Part, PartId, StockLocation, VehicleAssignment};
use fieldstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError, JobId, UserId};
use fieldstock_fulfillment::JobStaging;
use fieldstock_inventory::PartLedger;
use fieldstock_purchasing::numbering::SequenceId;
use fieldstock_purchasing::{PoNumberSequence, PurchaseOrder, PurchaseOrderId};
use fieldstock_requests::{PartsRequest, RequestId};

use crate::event_store::StreamId;

/// An aggregate that lives in exactly one stream per instance.
pub trait StreamAggregate:
    Aggregate<
        Error = DomainError,
        Event: fieldstock_events::Event + Serialize + DeserializeOwned + Send + Sync,
        Id: Copy + Send + Sync,
    > + Clone
    + Send
    + Sync
    + 'static
{
    /// Stream type name, e.g. `"purchasing.order"`.
    const AGGREGATE_TYPE: &'static str;

    /// Fresh, not-yet-created instance ready for rehydration.
    fn blank(id: Self::Id) -> Self;

    fn stream_key(id: &Self::Id) -> AggregateId;

    fn id_from_key(key: AggregateId) -> Self::Id;

    fn stream_id(id: &Self::Id) -> StreamId {
        StreamId::new(Self::AGGREGATE_TYPE, Self::stream_key(id))
    }

    fn own_stream(&self) -> StreamId {
        Self::stream_id(self.id())
    }
}

macro_rules! typed_id_stream {
    ($aggregate:ty, $id:ty, $name:literal) => {
        impl StreamAggregate for $aggregate {
            const AGGREGATE_TYPE: &'static str = $name;

            fn blank(id: $id) -> Self {
                <$aggregate>::empty(id)
            }

            fn stream_key(id: &$id) -> AggregateId {
                id.aggregate_id()
            }

            fn id_from_key(key: AggregateId) -> $id {
                <$id>::new(key)
            }
        }
    };
}

typed_id_stream!(Part, PartId, "catalog.part");
typed_id_stream!(StockLocation, LocationId, "catalog.location");
typed_id_stream!(PartLedger, PartId, "inventory.ledger");
typed_id_stream!(SerializedUnit, UnitId, "assets.unit");
typed_id_stream!(PurchaseOrder, PurchaseOrderId, "purchasing.order");
typed_id_stream!(PoNumberSequence, SequenceId, "purchasing.sequence");
typed_id_stream!(PartsRequest, RequestId, "requests.request");

impl StreamAggregate for VehicleAssignment {
    const AGGREGATE_TYPE: &'static str = "catalog.vehicle_assignment";

    fn blank(id: UserId) -> Self {
        VehicleAssignment::empty(id)
    }

    fn stream_key(id: &UserId) -> AggregateId {
        AggregateId::from_uuid(*id.as_uuid())
    }

    fn id_from_key(key: AggregateId) -> UserId {
        UserId::from_uuid(*key.as_uuid())
    }
}

impl StreamAggregate for JobStaging {
    const AGGREGATE_TYPE: &'static str = "fulfillment.staging";

    fn blank(id: JobId) -> Self {
        JobStaging::empty(id)
    }

    fn stream_key(id: &JobId) -> AggregateId {
        AggregateId::from_uuid(*id.as_uuid())
    }

    fn id_from_key(key: AggregateId) -> JobId {
        JobId::from_uuid(*key.as_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_and_ledger_share_an_id_but_not_a_stream() {
        let part = PartId::generate();
        assert_ne!(Part::stream_id(&part), PartLedger::stream_id(&part));
        assert_eq!(Part::stream_id(&part).aggregate_id, part.aggregate_id());
    }

    #[test]
    fn stream_keys_round_trip() {
        let job = JobId::new();
        assert_eq!(JobStaging::id_from_key(JobStaging::stream_key(&job)), job);
        let tech = UserId::new();
        assert_eq!(VehicleAssignment::id_from_key(VehicleAssignment::stream_key(&tech)), tech);
    }
}
