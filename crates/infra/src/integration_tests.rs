//! Integration tests for the full bus pipeline.
//!
//! Tests: publish → store → dispatcher → subscriptions → retry / stats / maintenance
//!
//! Verifies:
//! - Urgent events are dispatched without waiting for a poll tick
//! - Retry backoff follows 1s, 4s, 16s and ends in Failed
//! - Tenant isolation is preserved
//! - Concurrent publishing converges with no event counted twice
//! - A handler that outlives its lease is not run again by another worker
//! - Handler concurrency stays under the configured cap

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    use rentaldesk_core::{Clock, ManualClock, TenantId};
    use rentaldesk_events::{
        BusinessEvent, EventDraft, EventId, EventState, EventType, FixedTenant, HandlerError,
        Priority, SubscriptionSpec, handler_fn,
    };

    use crate::event_bus::{BusConfig, EventBus};
    use crate::event_store::{
        ClaimRequest, EventQuery, EventRecordStore, EventStatus, InMemoryEventStore, Pagination,
    };

    struct Harness {
        bus: Arc<EventBus>,
        store: Arc<InMemoryEventStore>,
        clock: Arc<ManualClock>,
        tenant: TenantId,
    }

    fn harness() -> Harness {
        harness_on(Arc::new(InMemoryEventStore::new()), TenantId::new())
    }

    fn harness_on(store: Arc<InMemoryEventStore>, tenant: TenantId) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let bus = EventBus::builder(store.clone(), Arc::new(FixedTenant(tenant)))
            .clock(clock.clone())
            .config(BusConfig::default().with_worker_id("it-worker"))
            .build()
            .unwrap();
        Harness {
            bus: Arc::new(bus),
            store,
            clock,
            tenant,
        }
    }

    fn draft(event_type: EventType) -> EventDraft {
        EventDraft::new(event_type, "integration").with_data(serde_json::json!({"amount": 250}))
    }

    /// Handler that fails the first `failures` calls.
    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Arc<dyn rentaldesk_events::EventHandler> {
        handler_fn(move |_e| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(HandlerError::new(format!("attempt {} failed", n + 1)))
                } else {
                    Ok(())
                }
            }
        })
    }

    fn bus_with(
        store: Arc<InMemoryEventStore>,
        tenant: TenantId,
        clock: Arc<ManualClock>,
        config: BusConfig,
    ) -> Arc<EventBus> {
        let bus = EventBus::builder(store, Arc::new(FixedTenant(tenant)))
            .clock(clock)
            .config(config)
            .build()
            .unwrap();
        Arc::new(bus)
    }

    async fn stored(h: &Harness, id: EventId) -> BusinessEvent {
        h.store.get(h.tenant, id).await.unwrap().unwrap()
    }

    async fn wait_until_processed(h: &Harness, id: EventId) -> BusinessEvent {
        for _ in 0..200 {
            let event = stored(h, id).await;
            if event.processed {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event {id} was not processed in time");
    }

    #[tokio::test]
    async fn critical_event_is_dispatched_immediately() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.bus
            .subscribe(
                SubscriptionSpec::new("cash-ledger")
                    .event_type(EventType::PaymentReceived)
                    .handler(flaky(0, calls.clone())),
            )
            .unwrap();

        let result = h
            .bus
            .publish(draft(EventType::PaymentReceived).with_priority(Priority::Critical))
            .await;
        assert!(result.success);
        assert!(result.subscribers_notified >= 1);

        // No poll tick has run; only the immediate path can process it.
        let event = wait_until_processed(&h, result.event_id.unwrap()).await;
        assert!(event.processing_time_ms.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The poller sees nothing left to do, so the handler is not invoked twice.
        let report = h.bus.dispatch_once().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_and_never_stored() {
        let h = harness();
        let id = EventId::new();
        let result = h
            .bus
            .publish(EventDraft::new("not_a_real_type", "integration").with_id(id).with_data(serde_json::json!({})))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Invalid event type"));
        assert!(h.bus.get_event(id).await.unwrap().is_none());
        assert_eq!(h.bus.get_stats().await.unwrap().total_events, 0);
    }

    #[tokio::test]
    async fn handler_failing_twice_then_succeeding_follows_backoff() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.bus
            .subscribe(
                SubscriptionSpec::new("fleet-sync")
                    .event_type(EventType::VehicleReturned)
                    .handler(flaky(2, calls.clone())),
            )
            .unwrap();

        let id = h.bus.publish(draft(EventType::VehicleReturned)).await.event_id.unwrap();
        let t0 = h.clock.now();
        assert_eq!(stored(&h, id).await.state(t0), EventState::Pending);

        // Attempt 1 fails: +1s.
        assert_eq!(h.bus.dispatch_once().await.unwrap().retried, 1);
        let e = stored(&h, id).await;
        assert_eq!(e.state(h.clock.now()), EventState::RetryPending);
        assert_eq!((e.retry_count, e.scheduled_at), (1, t0 + ChronoDuration::seconds(1)));
        assert!(e.error.is_none());

        // Not due yet.
        assert_eq!(h.bus.dispatch_once().await.unwrap().claimed, 0);

        // Attempt 2 fails: +4s.
        h.clock.advance(ChronoDuration::seconds(1));
        assert_eq!(stored(&h, id).await.state(h.clock.now()), EventState::Pending);
        assert_eq!(h.bus.dispatch_once().await.unwrap().retried, 1);
        let e = stored(&h, id).await;
        assert_eq!(e.retry_count, 2);
        assert_eq!(e.scheduled_at, h.clock.now() + ChronoDuration::seconds(4));

        // Attempt 3 succeeds.
        h.clock.advance(ChronoDuration::seconds(4));
        assert_eq!(h.bus.dispatch_once().await.unwrap().processed, 1);
        let e = stored(&h, id).await;
        assert_eq!(e.state(h.clock.now()), EventState::Processed);
        assert_eq!(e.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let info = &h.bus.get_stats().await.unwrap().subscriptions[0];
        assert_eq!((info.processed_count, info.error_count), (1, 2));
    }

    #[tokio::test]
    async fn exhausted_event_fails_and_manual_retry_rearms_it() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.bus
            .subscribe(
                SubscriptionSpec::new("gl-posting")
                    .event_type(EventType::JournalEntryPosted)
                    .handler(flaky(usize::MAX, calls.clone())),
            )
            .unwrap();

        let id = h.bus.publish(draft(EventType::JournalEntryPosted)).await.event_id.unwrap();

        let mut delays = Vec::new();
        for _ in 0..3 {
            let before = h.clock.now();
            h.bus.dispatch_once().await.unwrap();
            let e = stored(&h, id).await;
            let delay = e.scheduled_at - before;
            delays.push(delay.num_seconds());
            h.clock.advance(delay);
        }
        assert_eq!(delays, vec![1, 4, 16]);

        let report = h.bus.dispatch_once().await.unwrap();
        assert_eq!(report.failed, 1);
        let e = stored(&h, id).await;
        assert!(!e.processed);
        assert_eq!(e.retry_count, 3);
        assert!(e.error.as_deref().unwrap().contains("gl-posting"));
        assert_eq!(e.state(h.clock.now()), EventState::Failed);

        // Failed is terminal for the poller.
        h.clock.advance(ChronoDuration::hours(1));
        assert_eq!(h.bus.dispatch_once().await.unwrap().claimed, 0);
        assert_eq!(h.bus.get_stats().await.unwrap().failed_events, 1);

        // Cleanup never deletes failed events.
        h.clock.advance(ChronoDuration::days(90));
        assert_eq!(h.bus.cleanup_old_events(30).await.unwrap().deleted, 0);

        let retry = h.bus.retry_failed_events().await.unwrap();
        assert_eq!(retry.rearmed, vec![id]);
        let e = stored(&h, id).await;
        assert!(e.error.is_none());
        assert_eq!(e.retry_count, 3);

        // Eligible again within one cycle; still failing, so back to Failed.
        let report = h.bus.dispatch_once().await.unwrap();
        assert_eq!((report.claimed, report.failed), (1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(stored(&h, id).await.is_failed());
    }

    #[tokio::test]
    async fn rearmed_event_can_succeed() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.bus
            .subscribe(
                SubscriptionSpec::new("payroll")
                    .event_type(EventType::PayrollProcessed)
                    .handler(flaky(1, calls.clone())),
            )
            .unwrap();

        let id = h
            .bus
            .publish(draft(EventType::PayrollProcessed).with_max_retries(0))
            .await
            .event_id
            .unwrap();
        assert_eq!(h.bus.dispatch_once().await.unwrap().failed, 1);

        h.bus.retry_failed_events().await.unwrap();
        assert_eq!(h.bus.dispatch_once().await.unwrap().processed, 1);
        assert!(stored(&h, id).await.processed);
    }

    #[tokio::test]
    async fn cleanup_purges_only_old_processed_events() {
        let h = harness();
        let old = h.bus.publish(draft(EventType::CostRecorded)).await.event_id.unwrap();
        h.bus.dispatch_once().await.unwrap();

        h.clock.advance(ChronoDuration::days(31));
        let fresh = h.bus.publish(draft(EventType::CostRecorded)).await.event_id.unwrap();
        h.bus.dispatch_once().await.unwrap();
        let pending = h.bus.publish(draft(EventType::CostRecorded)).await.event_id.unwrap();

        let report = h.bus.cleanup_old_events(30).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(h.bus.get_event(old).await.unwrap().is_none());
        assert!(h.bus.get_event(fresh).await.unwrap().is_some());
        assert!(h.bus.get_event(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unsubscribed_handler_is_not_selected_again() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = h
            .bus
            .subscribe(
                SubscriptionSpec::new("crm")
                    .event_type(EventType::CustomerUpdated)
                    .handler(flaky(0, calls.clone())),
            )
            .unwrap();

        h.bus.publish(draft(EventType::CustomerUpdated)).await;
        h.bus.dispatch_once().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(h.bus.unsubscribe(sub));
        let result = h.bus.publish(draft(EventType::CustomerUpdated)).await;
        assert_eq!(result.subscribers_notified, 0);
        assert_eq!(h.bus.dispatch_once().await.unwrap().processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filters_narrow_delivery() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.bus
            .subscribe(
                SubscriptionSpec::new("big-refunds")
                    .event_type(EventType::PaymentRefunded)
                    .filter(|e| e.data["amount"].as_i64().is_some_and(|a| a >= 1000))
                    .handler(flaky(0, calls.clone())),
            )
            .unwrap();

        let small = h.bus.publish(draft(EventType::PaymentRefunded)).await;
        let big = h
            .bus
            .publish(draft(EventType::PaymentRefunded).with_data(serde_json::json!({"amount": 5000})))
            .await;
        assert_eq!(small.subscribers_notified, 0);
        assert_eq!(big.subscribers_notified, 1);

        assert_eq!(h.bus.dispatch_once().await.unwrap().processed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tenants_never_see_each_other() {
        let store = Arc::new(InMemoryEventStore::new());
        let a = harness_on(store.clone(), TenantId::new());
        let b = harness_on(store, TenantId::new());

        let id = a.bus.publish(draft(EventType::ContractSigned)).await.event_id.unwrap();
        assert!(b.bus.get_event(id).await.unwrap().is_none());
        assert_eq!(b.bus.dispatch_once().await.unwrap().claimed, 0);
        assert_eq!(b.bus.get_stats().await.unwrap().total_events, 0);

        // Publishing for another tenant explicitly lands in that tenant only.
        let other = b
            .bus
            .publish(draft(EventType::ContractSigned).for_tenant(a.tenant))
            .await
            .event_id
            .unwrap();
        assert!(a.bus.get_event(other).await.unwrap().is_some());
        assert!(b.bus.get_event(other).await.unwrap().is_none());
        assert_eq!(a.bus.dispatch_once().await.unwrap().claimed, 2);
    }

    #[tokio::test]
    async fn list_events_filters_by_status() {
        let h = harness();
        h.bus.publish(draft(EventType::InvoiceIssued)).await;
        h.bus.dispatch_once().await.unwrap();
        h.bus.publish(draft(EventType::InvoiceOverdue)).await;

        let pending = h
            .bus
            .list_events(
                &EventQuery {
                    status: Some(EventStatus::Pending),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(pending.total, 1);
        assert_eq!(pending.events[0].event_type, EventType::InvoiceOverdue);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn thousand_concurrent_publishes_converge() {
        let h = harness();
        let delivered = Arc::new(AtomicUsize::new(0));

        let subsets: [&[EventType]; 10] = [
            &[EventType::ContractCreated],
            &[EventType::ContractCreated, EventType::ContractSigned],
            &[EventType::PaymentReceived],
            &[EventType::PaymentReceived, EventType::PaymentFailed],
            &[EventType::VehicleRented, EventType::VehicleReturned],
            &[EventType::VehicleReturned],
            &[EventType::CostRecorded],
            &[EventType::CustomerRegistered],
            &[EventType::EmployeeHired, EventType::PayrollProcessed],
            &[EventType::SystemError, EventType::SecurityLoginFailed],
        ];
        for (i, types) in subsets.iter().enumerate() {
            let counter = delivered.clone();
            h.bus
                .subscribe(
                    SubscriptionSpec::new(format!("sub-{i}"))
                        .event_types(types.iter().copied())
                        .handler(handler_fn(move |_e| {
                            let counter = counter.clone();
                            async move {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        })),
                )
                .unwrap();
        }

        let kinds: Vec<EventType> = subsets.iter().flat_map(|t| t.iter().copied()).collect();
        let priorities = [Priority::Low, Priority::Medium, Priority::High, Priority::Critical];

        let publishes: Vec<_> = (0..1000)
            .map(|i| {
                let bus = h.bus.clone();
                let event_type = kinds[i % kinds.len()];
                let priority = priorities[i % priorities.len()];
                tokio::spawn(async move {
                    bus.publish(
                        EventDraft::new(event_type, "load")
                            .with_priority(priority)
                            .with_data(serde_json::json!({"i": i})),
                    )
                    .await
                })
            })
            .collect();
        for publish in publishes {
            assert!(publish.await.unwrap().success);
        }

        let mut stats = h.bus.get_stats().await.unwrap();
        for _ in 0..500 {
            assert_eq!(
                stats.pending_events + stats.processed_events + stats.failed_events,
                stats.total_events
            );
            if stats.pending_events == 0 {
                break;
            }
            h.bus.dispatch_once().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            stats = h.bus.get_stats().await.unwrap();
        }

        assert_eq!(stats.total_events, 1000);
        assert_eq!(stats.pending_events, 0);
        assert_eq!(stats.processed_events, 1000);
        assert_eq!(stats.failed_events, 0);
        assert_eq!(stats.subscribers_count, 10);

        let expected: usize = (0..1000)
            .map(|i| {
                let t = kinds[i % kinds.len()];
                subsets.iter().filter(|s| s.contains(&t)).count()
            })
            .sum();
        assert_eq!(delivered.load(Ordering::SeqCst), expected);
    }

    #[tokio::test]
    async fn slow_handler_keeps_its_claim_from_a_second_worker() {
        let store = Arc::new(InMemoryEventStore::new());
        let tenant = TenantId::new();
        let clock = Arc::new(ManualClock::starting_now());
        let config = |worker: &str| {
            BusConfig::default()
                .with_worker_id(worker)
                .with_lease_duration(Duration::from_millis(150))
        };
        let a = bus_with(store.clone(), tenant, clock.clone(), config("worker-a"));
        let b = bus_with(store.clone(), tenant, clock.clone(), config("worker-b"));

        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        for bus in [&a, &b] {
            let (calls, gate) = (calls.clone(), gate.clone());
            bus.subscribe(
                SubscriptionSpec::new("quarter-close")
                    .event_type(EventType::PeriodClosed)
                    .timeout(Duration::from_secs(600))
                    .handler(handler_fn(move |_e| {
                        let (calls, gate) = (calls.clone(), gate.clone());
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            Ok(())
                        }
                    })),
            )
            .unwrap();
        }
        assert_eq!(a.registry().active_count(), 1);

        let id = a.publish(draft(EventType::PeriodClosed)).await.event_id.unwrap();
        let tick = {
            let a = a.clone();
            tokio::spawn(async move { a.dispatch_once().await })
        };
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let claimed_by = store.get(tenant, id).await.unwrap().unwrap().claimed_by;
        assert_eq!(claimed_by.as_deref(), Some(a.config().worker_id.as_str()));

        // Well past the original lease; worker a is still inside its handler.
        clock.advance(ChronoDuration::seconds(301));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = b.dispatch_once().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        let report = tick.await.unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.get(tenant, id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn handler_concurrency_respects_the_configured_cap() {
        let store = Arc::new(InMemoryEventStore::new());
        let tenant = TenantId::new();
        let bus = bus_with(
            store,
            tenant,
            Arc::new(ManualClock::starting_now()),
            BusConfig::default().with_worker_id("capped").with_max_in_flight(3),
        );

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for name in ["payroll", "attendance-audit"] {
            let (current, peak) = (current.clone(), peak.clone());
            bus.subscribe(
                SubscriptionSpec::new(name)
                    .event_type(EventType::AttendanceRecorded)
                    .handler(handler_fn(move |_e| {
                        let (current, peak) = (current.clone(), peak.clone());
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(15)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })),
            )
            .unwrap();
        }
        for _ in 0..8 {
            assert!(bus.publish(draft(EventType::AttendanceRecorded)).await.success);
        }

        let report = bus.dispatch_once().await.unwrap();
        assert_eq!(report.processed, 8);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak > 1);
        assert!(peak <= bus.config().max_in_flight, "peak {peak} over the cap");
    }

    #[tokio::test]
    async fn poller_survives_a_panicking_filter() {
        let h = harness();
        let store = h.store.clone();
        let bus = bus_with(
            store,
            h.tenant,
            h.clock.clone(),
            BusConfig::default()
                .with_worker_id("poller")
                .with_poll_interval(Duration::from_millis(10)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            SubscriptionSpec::new("blacklist-sync")
                .event_type(EventType::CustomerBlacklisted)
                .filter(|e| e.data["reason"].as_str().unwrap().starts_with("fraud"))
                .handler(flaky(0, calls.clone())),
        )
        .unwrap();
        bus.start().unwrap();

        let first = bus.publish(draft(EventType::CustomerBlacklisted)).await;
        assert!(first.success);
        wait_until_processed(&h, first.event_id.unwrap()).await;
        assert!(bus.is_running());

        let second = bus.publish(draft(EventType::CustomerBlacklisted)).await;
        wait_until_processed(&h, second.event_id.unwrap()).await;
        assert!(bus.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.stop().await;
    }

    proptest! {
        #[test]
        fn claimed_batches_are_priority_desc_then_oldest_first(
            specs in prop::collection::vec((0i16..4, 0i64..600), 1..40),
            limit in 1usize..50,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryEventStore::new();
                let tenant = TenantId::new();
                let base = chrono::Utc::now() - ChronoDuration::hours(1);

                for (rank, offset) in &specs {
                    let draft = EventDraft::new(EventType::ContractUpdated, "prop")
                        .with_priority(Priority::from_rank(*rank).unwrap())
                        .with_data(serde_json::json!({}));
                    let event = BusinessEvent::from_draft(
                        draft,
                        EventType::ContractUpdated,
                        tenant,
                        base + ChronoDuration::seconds(*offset),
                    );
                    store.insert(tenant, &event).await.unwrap();
                }

                let request = ClaimRequest::new("prop", chrono::Utc::now(), Duration::from_secs(60), limit);
                let batch = store.claim_due(tenant, &request).await.unwrap();
                prop_assert_eq!(batch.len(), limit.min(specs.len()));
                for pair in batch.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    prop_assert!(a.priority >= b.priority);
                    if a.priority == b.priority {
                        prop_assert!(a.created_at <= b.created_at);
                    }
                }
                Ok(())
            })?;
        }
    }
}
