//! End-to-end tests across the procurement operations.
//!
//! Flow: request → purchase order → receiving → ledger/units/staging → pickup
//!
//! Verifies:
//! - Stock, order counters and request status stay consistent across commits
//! - A failing operation leaves every stream it touched unchanged
//! - Concurrent receipts never push a line past its ordered quantity

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    use fieldstock_catalog::{LocationId, LocationType, PartId};
    use fieldstock_core::{AggregateId, JobId, Money, UserId, VendorId};
    use fieldstock_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use fieldstock_purchasing::{PurchaseOrderId, PurchaseOrderStatus, ReceiptLineInput, RequestLineRef};
    use fieldstock_requests::{NewRequestItem, QueueFilter, RequestId, RequestStatus, Urgency};

    use crate::error::ErrorKind;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::procurement::{
        NewLocation, NewPart, NewPurchaseOrder, NewRequest, OrderLineInput, Procurement,
        ProcurementSettings, TransferRequest,
    };

    struct Shop<S: ?Sized = InMemoryEventStore> {
        procurement: Procurement<S>,
        actor: UserId,
        warehouse: LocationId,
        vehicle: LocationId,
    }

    async fn shop() -> Shop {
        shop_on(Procurement::in_memory(ProcurementSettings::default())).await
    }

    async fn shop_on<S: EventStore + ?Sized>(procurement: Procurement<S>) -> Shop<S> {
        let actor = UserId::new();
        let location = |name: &str, location_type| NewLocation {
            name: name.to_string(),
            location_type,
            assigned_technician: None,
        };
        let warehouse = procurement
            .create_location(location("W1", LocationType::Warehouse), actor)
            .await
            .unwrap()
            .id_typed();
        let vehicle = procurement
            .create_location(location("V1", LocationType::Vehicle), actor)
            .await
            .unwrap()
            .id_typed();
        Shop {
            procurement,
            actor,
            warehouse,
            vehicle,
        }
    }

    impl<S: EventStore + ?Sized> Shop<S> {
        async fn part(&self, sku: &str, serialized: bool) -> PartId {
            self.procurement
                .create_part(
                    NewPart {
                        sku: sku.to_string(),
                        name: format!("{sku} (test)"),
                        category: Default::default(),
                        is_serialized: serialized,
                        unit_cost: Money::from_cents(2_500),
                    },
                    self.actor,
                )
                .await
                .unwrap()
                .id_typed()
        }

        async fn request(&self, job_id: JobId, items: &[(PartId, i64)]) -> RequestId {
            self.procurement
                .create_request(
                    NewRequest {
                        job_id: Some(job_id),
                        items: items
                            .iter()
                            .map(|&(part_id, quantity)| NewRequestItem {
                                part_id,
                                quantity,
                                note: None,
                            })
                            .collect(),
                        urgency: Urgency::High,
                    },
                    self.actor,
                )
                .await
                .unwrap()
                .id_typed()
        }

        async fn approved_order(&self, lines: Vec<OrderLineInput>, request_ids: Vec<RequestId>) -> PurchaseOrderId {
            let order_id = self
                .procurement
                .create_purchase_order(
                    NewPurchaseOrder {
                        vendor_id: VendorId::new(),
                        order_date: None,
                        expected_delivery: None,
                        source: Default::default(),
                        tax_rate: None,
                        shipping: Money::ZERO,
                        notes: None,
                        lines,
                        request_ids,
                    },
                    self.actor,
                )
                .await
                .unwrap()
                .id_typed();
            self.procurement.submit_purchase_order(order_id, self.actor).await.unwrap();
            self.procurement.approve_purchase_order(order_id, self.actor).await.unwrap();
            order_id
        }

        async fn receive(&self, order_id: PurchaseOrderId, line_no: u32, quantity: i64) -> crate::procurement::ReceiptResult {
            self.procurement
                .receive_goods(order_id, vec![receipt(line_no, quantity, self.warehouse)], self.actor)
                .await
                .unwrap()
        }
    }

    fn line(part_id: PartId, quantity: i64) -> OrderLineInput {
        OrderLineInput {
            part_id,
            description: None,
            quantity,
            unit_price: None,
            job_id: None,
            request: None,
        }
    }

    fn receipt(line_no: u32, quantity: i64, location: LocationId) -> ReceiptLineInput {
        ReceiptLineInput {
            line_no,
            quantity,
            location: Some(location),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn receive_in_two_passes_then_transfer_to_a_vehicle() {
        let shop = shop().await;
        let p1 = shop.part("P1", false).await;
        let order_id = shop.approved_order(vec![line(p1, 10)], vec![]).await;
        assert_eq!(shop.procurement.get_purchase_order(order_id).unwrap().number(), "PO-100");

        let first = shop.receive(order_id, 1, 4).await;
        assert_eq!(first.status, PurchaseOrderStatus::Partial);
        assert_eq!(shop.procurement.quantity_at(p1, shop.warehouse), 4);

        let second = shop.receive(order_id, 1, 6).await;
        assert_eq!(second.status, PurchaseOrderStatus::Received);
        let order = shop.procurement.get_purchase_order(order_id).unwrap();
        assert_eq!(order.lines()[0].quantity_received, 10);
        assert_eq!(shop.procurement.quantity_at(p1, shop.warehouse), 10);

        shop.procurement
            .transfer(
                TransferRequest {
                    part_id: p1,
                    from: shop.warehouse,
                    to: shop.vehicle,
                    quantity: 3,
                    unit_ids: vec![],
                    notes: None,
                },
                shop.actor,
            )
            .await
            .unwrap();
        assert_eq!(shop.procurement.quantity_at(p1, shop.warehouse), 7);
        assert_eq!(shop.procurement.quantity_at(p1, shop.vehicle), 3);
    }

    #[tokio::test]
    async fn missing_serial_numbers_leave_line_counters_unchanged() {
        let shop = shop().await;
        let compressor = shop.part("CMP-3T", true).await;
        let order_id = shop.approved_order(vec![line(compressor, 3)], vec![]).await;
        let events_before = shop.procurement.store().load_all().await.unwrap().len();

        let err = shop
            .procurement
            .receive_goods(
                order_id,
                vec![ReceiptLineInput {
                    serial_numbers: vec!["SN-1".to_string(), "SN-2".to_string()],
                    ..receipt(1, 3, shop.warehouse)
                }],
                shop.actor,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.message, "line 1: expected 3 serial numbers, got 2");
        let order = shop.procurement.get_purchase_order(order_id).unwrap();
        assert_eq!(order.lines()[0].quantity_received, 0);
        assert_eq!(shop.procurement.store().load_all().await.unwrap().len(), events_before);
        assert!(shop.procurement.list_units(&Default::default()).is_empty());
    }

    #[tokio::test]
    async fn pickup_without_a_vehicle_moves_nothing() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let capacitor = shop.part("CAP-45", false).await;
        let job_id = JobId::new();
        let request_id = shop.request(job_id, &[(filter, 2), (capacitor, 1)]).await;
        let order_id = shop.approved_order(vec![], vec![request_id]).await;
        shop.procurement
            .receive_goods(
                order_id,
                vec![receipt(1, 2, shop.warehouse), receipt(2, 1, shop.warehouse)],
                shop.actor,
            )
            .await
            .unwrap();
        assert_eq!(shop.procurement.pick_list(job_id).unwrap().items.len(), 2);

        let technician = UserId::new();
        let err = shop
            .procurement
            .pickup_parts_for_ticket(job_id, technician, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(shop.procurement.reserved_at(filter, shop.warehouse, job_id), 2);
        assert_eq!(shop.procurement.reserved_at(capacitor, shop.warehouse, job_id), 1);
        let staging = shop.procurement.projections().stagings.get(&job_id).unwrap();
        assert_eq!(staging.pending_items().count(), 2);
    }

    #[tokio::test]
    async fn pickup_with_an_explicit_destination_still_needs_a_vehicle() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let job_id = JobId::new();
        let request_id = shop.request(job_id, &[(filter, 2)]).await;
        let order_id = shop.approved_order(vec![], vec![request_id]).await;
        shop.receive(order_id, 1, 2).await;
        let overflow = shop
            .procurement
            .create_location(
                NewLocation {
                    name: "W2".to_string(),
                    location_type: LocationType::Warehouse,
                    assigned_technician: None,
                },
                shop.actor,
            )
            .await
            .unwrap()
            .id_typed();

        let technician = UserId::new();
        let err = shop
            .procurement
            .pickup_parts_for_ticket(job_id, technician, Some(overflow))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        // With a vehicle assigned, a warehouse is still not a pickup destination.
        shop.procurement
            .assign_technician(shop.vehicle, technician, false, shop.actor)
            .await
            .unwrap();
        let err = shop
            .procurement
            .pickup_parts_for_ticket(job_id, technician, Some(overflow))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        assert_eq!(shop.procurement.quantity_at(filter, overflow), 0);
        assert_eq!(shop.procurement.reserved_at(filter, shop.warehouse, job_id), 2);

        let pickup = shop
            .procurement
            .pickup_parts_for_ticket(job_id, technician, Some(shop.vehicle))
            .await
            .unwrap();
        assert_eq!(pickup.destination, shop.vehicle);
        assert_eq!(shop.procurement.quantity_at(filter, shop.vehicle), 2);
    }

    #[tokio::test]
    async fn pickup_moves_every_staged_item_onto_the_technicians_vehicle() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let compressor = shop.part("CMP-3T", true).await;
        let technician = UserId::new();
        shop.procurement
            .assign_technician(shop.vehicle, technician, false, shop.actor)
            .await
            .unwrap();

        let job_id = JobId::new();
        let request_id = shop.request(job_id, &[(filter, 2), (compressor, 1)]).await;
        let order_id = shop.approved_order(vec![], vec![request_id]).await;
        let receipt_result = shop
            .procurement
            .receive_goods(
                order_id,
                vec![
                    receipt(1, 2, shop.warehouse),
                    ReceiptLineInput {
                        serial_numbers: vec!["CMP-77".to_string()],
                        ..receipt(2, 1, shop.warehouse)
                    },
                ],
                shop.actor,
            )
            .await
            .unwrap();
        assert_eq!(receipt_result.jobs_ready, vec![job_id]);
        shop.procurement
            .assign_job_technician(job_id, technician, shop.actor)
            .await
            .unwrap();
        assert_eq!(shop.procurement.parts_ready_for_pickup(Some(technician)).len(), 1);

        let pickup = shop
            .procurement
            .pickup_parts_for_ticket(job_id, technician, None)
            .await
            .unwrap();

        assert_eq!(pickup.destination, shop.vehicle);
        assert_eq!(pickup.items_transferred, 2);
        assert_eq!(shop.procurement.quantity_at(filter, shop.vehicle), 2);
        assert_eq!(shop.procurement.quantity_at(compressor, shop.vehicle), 1);
        assert_eq!(shop.procurement.reserved_at(filter, shop.warehouse, job_id), 0);
        let unit = shop.procurement.get_unit(receipt_result.lines[1].unit_ids[0]).unwrap();
        assert_eq!(unit.location(), Some(shop.vehicle));
        assert_eq!(unit.reserved_for(), None);
        assert!(shop.procurement.pick_list(job_id).is_none());
        assert!(shop.procurement.parts_ready_for_pickup(Some(technician)).is_empty());
    }

    #[tokio::test]
    async fn released_items_return_to_general_stock() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let job_id = JobId::new();
        let request_id = shop.request(job_id, &[(filter, 4)]).await;
        let order_id = shop.approved_order(vec![], vec![request_id]).await;
        shop.receive(order_id, 1, 4).await;

        let released = shop
            .procurement
            .release_staged_items(job_id, Some("job cancelled".to_string()), shop.actor)
            .await
            .unwrap();

        assert_eq!(released.quantity, 4);
        assert_eq!(shop.procurement.reserved_at(filter, shop.warehouse, job_id), 0);
        assert_eq!(shop.procurement.quantity_at(filter, shop.warehouse), 4);
    }

    #[tokio::test]
    async fn linking_the_same_request_item_twice_links_it_once() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let request_id = shop.request(JobId::new(), &[(filter, 2)]).await;

        let order = shop
            .procurement
            .create_purchase_order(
                NewPurchaseOrder {
                    vendor_id: VendorId::new(),
                    order_date: None,
                    expected_delivery: None,
                    source: Default::default(),
                    tax_rate: None,
                    shipping: Money::ZERO,
                    notes: None,
                    lines: vec![OrderLineInput {
                        request: Some(RequestLineRef {
                            request_id,
                            item_no: 1,
                        }),
                        ..line(filter, 2)
                    }],
                    request_ids: vec![request_id],
                },
                shop.actor,
            )
            .await
            .unwrap();

        assert_eq!(order.lines().len(), 1);
        let request = shop.procurement.get_request(request_id).unwrap();
        assert_eq!(request.links().len(), 1);
    }

    #[tokio::test]
    async fn request_stays_on_order_until_every_item_arrives() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let capacitor = shop.part("CAP-45", false).await;
        let request_id = shop.request(JobId::new(), &[(filter, 2), (capacitor, 3)]).await;

        let first = shop
            .approved_order(
                vec![OrderLineInput {
                    request: Some(RequestLineRef {
                        request_id,
                        item_no: 1,
                    }),
                    ..line(filter, 2)
                }],
                vec![],
            )
            .await;
        shop.receive(first, 1, 2).await;

        let request = shop.procurement.get_request(request_id).unwrap();
        assert_eq!(request.status(), RequestStatus::Ordered);
        assert_eq!(request.unlinked_items().count(), 1);

        let second = shop.approved_order(vec![], vec![request_id]).await;
        let order = shop.procurement.get_purchase_order(second).unwrap();
        assert_eq!(order.lines().len(), 1);
        assert_eq!(order.lines()[0].part_id, capacitor);

        shop.receive(second, 1, 3).await;
        let request = shop.procurement.get_request(request_id).unwrap();
        assert_eq!(request.status(), RequestStatus::Received);
    }

    #[tokio::test]
    async fn receipts_that_would_overflow_stock_are_refused() {
        let shop = shop().await;
        let washer = shop.part("WSH-08", false).await;
        let free = |quantity| OrderLineInput {
            unit_price: Some(Money::ZERO),
            ..line(washer, quantity)
        };
        let bulk = shop.approved_order(vec![free(i64::MAX)], vec![]).await;
        shop.receive(bulk, 1, i64::MAX).await;

        let extra = shop.approved_order(vec![free(1)], vec![]).await;
        let err = shop
            .procurement
            .receive_goods(extra, vec![receipt(1, 1, shop.warehouse)], shop.actor)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(shop.procurement.quantity_at(washer, shop.warehouse), i64::MAX);
        let order = shop.procurement.get_purchase_order(extra).unwrap();
        assert_eq!(order.lines()[0].quantity_received, 0);
    }

    #[tokio::test]
    async fn statuses_never_move_backwards() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let request_id = shop.request(JobId::new(), &[(filter, 1)]).await;
        let order_id = shop.approved_order(vec![], vec![request_id]).await;
        assert_eq!(
            shop.procurement.get_request(request_id).unwrap().status(),
            RequestStatus::Ordered
        );
        shop.receive(order_id, 1, 1).await;

        let resubmit = shop
            .procurement
            .submit_purchase_order(order_id, shop.actor)
            .await
            .unwrap_err();
        assert_eq!(resubmit.kind, ErrorKind::Conflict);
        let cancel_order = shop
            .procurement
            .cancel_purchase_order(order_id, Some("late".to_string()), shop.actor)
            .await
            .unwrap_err();
        assert_eq!(cancel_order.kind, ErrorKind::Conflict);
        let cancel_request = shop
            .procurement
            .cancel_request(request_id, None, shop.actor)
            .await
            .unwrap_err();
        assert_eq!(cancel_request.kind, ErrorKind::Conflict);

        assert_eq!(
            shop.procurement.get_purchase_order(order_id).unwrap().status(),
            PurchaseOrderStatus::Received
        );
        assert_eq!(
            shop.procurement.get_request(request_id).unwrap().status(),
            RequestStatus::Received
        );
        assert!(shop.procurement.list_requests(QueueFilter::Open).is_empty());
    }

    #[tokio::test]
    async fn failed_transfers_roll_back_unit_relocations() {
        let shop = shop().await;
        let compressor = shop.part("CMP-3T", true).await;
        let order_id = shop.approved_order(vec![line(compressor, 2)], vec![]).await;
        let result = shop
            .procurement
            .receive_goods(
                order_id,
                vec![ReceiptLineInput {
                    serial_numbers: vec!["SN-1".to_string(), "SN-2".to_string()],
                    ..receipt(1, 2, shop.warehouse)
                }],
                shop.actor,
            )
            .await
            .unwrap();
        let unit_ids = result.lines[0].unit_ids.clone();

        // The second unit id is unknown, so the whole transfer must fail.
        let err = shop
            .procurement
            .transfer(
                TransferRequest {
                    part_id: compressor,
                    from: shop.warehouse,
                    to: shop.vehicle,
                    quantity: 2,
                    unit_ids: vec![unit_ids[0], fieldstock_assets::UnitId::generate()],
                    notes: None,
                },
                shop.actor,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotFound);
        let unit = shop.procurement.get_unit(unit_ids[0]).unwrap();
        assert_eq!(unit.location(), Some(shop.warehouse));
        assert_eq!(shop.procurement.quantity_at(compressor, shop.warehouse), 2);
        assert_eq!(shop.procurement.quantity_at(compressor, shop.vehicle), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_receipts_never_over_receive() {
        let shop = shop().await;
        let filter = shop.part("FLT-2020", false).await;
        let order_id = shop.approved_order(vec![line(filter, 5)], vec![]).await;

        let passes: Vec<_> = (0..4)
            .map(|_| {
                let procurement = shop.procurement.clone();
                let (warehouse, actor) = (shop.warehouse, shop.actor);
                tokio::spawn(async move {
                    procurement
                        .receive_goods(order_id, vec![receipt(1, 3, warehouse)], actor)
                        .await
                })
            })
            .collect();
        for pass in passes {
            match pass.await.unwrap() {
                Ok(_) => {}
                Err(err) => assert_eq!(err.kind, ErrorKind::Conflict, "unexpected error: {err:?}"),
            }
        }

        let order = shop.procurement.get_purchase_order(order_id).unwrap();
        assert_eq!(order.lines()[0].quantity_received, 5);
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert_eq!(shop.procurement.quantity_at(filter, shop.warehouse), 5);
    }

    #[tokio::test]
    async fn ready_for_scheduling_is_published_on_the_bus() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>> = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();
        let shop = shop_on(Procurement::in_memory_with_bus(ProcurementSettings::default(), bus.clone())).await;
        let filter = shop.part("FLT-2020", false).await;
        let job_id = JobId::new();
        let request_id = shop.request(job_id, &[(filter, 1)]).await;
        let order_id = shop.approved_order(vec![], vec![request_id]).await;
        subscription.drain();

        shop.procurement
            .receive_goods(order_id, vec![receipt(1, 1, shop.warehouse)], shop.actor)
            .await
            .unwrap();

        let mut ready = Vec::new();
        while let Ok(envelope) = subscription.recv_timeout(Duration::from_millis(50)) {
            if envelope.event_type() == "fulfillment.staging.job_ready_for_scheduling" {
                ready.push(envelope.aggregate_id());
            }
        }
        assert_eq!(ready, vec![AggregateId::from_uuid(*job_id.as_uuid())]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 24,
            ..ProptestConfig::default()
        })]

        #[test]
        fn receiving_passes_never_exceed_the_ordered_quantity(
            ordered in 1i64..20,
            passes in proptest::collection::vec(0i64..12, 1..8),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let shop = shop().await;
                let part = shop.part("BULK-1", false).await;
                let order_id = shop.approved_order(vec![line(part, ordered)], vec![]).await;

                for quantity in passes {
                    // Passes after the line completes are refused; counters must still hold.
                    let _ = shop
                        .procurement
                        .receive_goods(order_id, vec![receipt(1, quantity, shop.warehouse)], shop.actor)
                        .await;
                    let order = shop.procurement.get_purchase_order(order_id).unwrap();
                    let received = order.lines()[0].quantity_received;
                    prop_assert!(received <= ordered);
                    prop_assert_eq!(shop.procurement.quantity_at(part, shop.warehouse), received);
                }
                Ok(())
            })?;
        }
    }
}
