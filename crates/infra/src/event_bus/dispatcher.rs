//! Claim-based dispatcher.
//!
//! One tick claims a bounded batch of due events (priority desc, then oldest
//! first), fans them out to matching subscriptions with bounded concurrency and
//! writes each outcome back under the claim. Leases on the batch are renewed
//! while handlers run, so a handler may outlive the configured lease.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use rentaldesk_core::{Clock, TenantId};
use rentaldesk_events::{
    BusinessEvent, EventId, RetryDecision, RetryPolicy, Subscription, SubscriptionRegistry,
    plan_retry,
};

use crate::event_store::{
    ClaimRequest, EventRecordStore, EventUpdate, StoreError, lease_deadline,
};

/// Per-tick dispatch summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Another tick was already running; nothing was claimed.
    pub skipped: bool,
}

impl DispatchReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::ClaimLost | Outcome::StoreError => {}
        }
    }
}

/// What happened to one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Retried,
    Failed,
    /// Our lease was taken over before the outcome could be written.
    ClaimLost,
    /// The outcome could not be written; the lease will expire and the event
    /// becomes claimable again.
    StoreError,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub worker_id: String,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub lease_duration: Duration,
}

/// Resets the single-flight flag even if the tick future is dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Dispatcher {
    store: Arc<dyn EventRecordStore>,
    registry: Arc<SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
    permits: Arc<Semaphore>,
    in_flight: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventRecordStore>,
        registry: Arc<SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Self {
            store,
            registry,
            clock,
            settings,
            permits,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Run one tick for `tenant_id`. Overlapping calls return a skipped report.
    pub async fn dispatch_due(&self, tenant_id: TenantId) -> Result<DispatchReport, StoreError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(tenant_id = %tenant_id, "dispatch tick already running, skipping");
            return Ok(DispatchReport::skipped());
        }
        let _guard = FlightGuard(&self.in_flight);

        let request = ClaimRequest::new(
            self.settings.worker_id.as_str(),
            self.clock.now(),
            self.settings.lease_duration,
            self.settings.batch_size,
        );
        let events = self.store.claim_due(tenant_id, &request).await?;

        let mut report = DispatchReport {
            claimed: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        let outcomes: Vec<Outcome> = self
            .with_lease_renewal(
                tenant_id,
                &ids,
                stream::iter(events)
                    .map(|event| self.process(event))
                    .buffer_unordered(self.settings.max_in_flight.max(1))
                    .collect(),
            )
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            tenant_id = %tenant_id,
            claimed = report.claimed,
            processed = report.processed,
            retried = report.retried,
            failed = report.failed,
            "dispatch tick finished"
        );
        Ok(report)
    }

    /// Claim and dispatch a single event (the urgent publish path).
    ///
    /// Returns `None` when the event was not claimable (already leased, not
    /// due, or gone).
    pub async fn dispatch_one(
        &self,
        tenant_id: TenantId,
        id: EventId,
    ) -> Result<Option<Outcome>, StoreError> {
        let request = ClaimRequest::new(
            self.settings.worker_id.as_str(),
            self.clock.now(),
            self.settings.lease_duration,
            1,
        );
        match self.store.claim_one(tenant_id, id, &request).await? {
            Some(event) => Ok(Some(
                self.with_lease_renewal(tenant_id, &[id], self.process(event))
                    .await,
            )),
            None => {
                debug!(tenant_id = %tenant_id, event_id = %id, "event not claimable for immediate dispatch");
                Ok(None)
            }
        }
    }

    /// Drive `work` to completion, pushing the leases on `ids` forward every
    /// third of the lease duration. Events whose outcome is already written
    /// are no longer ours and are left alone by the store.
    async fn with_lease_renewal<F: Future>(
        &self,
        tenant_id: TenantId,
        ids: &[EventId],
        work: F,
    ) -> F::Output {
        let period = (self.settings.lease_duration / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut work = pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = heartbeat.tick() => self.renew_leases(tenant_id, ids).await,
            }
        }
    }

    async fn renew_leases(&self, tenant_id: TenantId, ids: &[EventId]) {
        let until = lease_deadline(self.clock.now(), self.settings.lease_duration);
        match self
            .store
            .extend_leases(tenant_id, ids, &self.settings.worker_id, until)
            .await
        {
            Ok(renewed) => debug!(tenant_id = %tenant_id, renewed, "leases renewed"),
            Err(err) => warn!(
                tenant_id = %tenant_id,
                worker_id = %self.settings.worker_id,
                error = %err,
                "lease renewal failed, events may be claimed by another worker"
            ),
        }
    }

    async fn process(&self, event: BusinessEvent) -> Outcome {
        let started = Instant::now();
        let subscriptions = self.registry.matching(&event);

        let results = join_all(subscriptions.iter().map(|s| self.invoke(s, &event))).await;
        let failures: Vec<(&Arc<Subscription>, String)> = subscriptions
            .iter()
            .zip(results)
            .filter_map(|(s, r)| r.err().map(|msg| (s, msg)))
            .collect();

        let now = self.clock.now();
        let (update, outcome) = if failures.is_empty() {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            (
                EventUpdate::MarkProcessed {
                    processed_at: now,
                    processing_time_ms: elapsed,
                },
                Outcome::Processed,
            )
        } else {
            let policies: Vec<RetryPolicy> = failures
                .iter()
                .map(|(s, _)| s.retry_policy().cloned().unwrap_or_default())
                .collect();

            match plan_retry(&policies, event.retry_count, event.max_retries, now) {
                RetryDecision::Reschedule {
                    retry_count,
                    delay,
                    scheduled_at,
                } => {
                    warn!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.id,
                        event_type = event.event_type.as_str(),
                        retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        failed_handlers = failures.len(),
                        "handler failed, retry scheduled"
                    );
                    (
                        EventUpdate::ScheduleRetry {
                            retry_count,
                            scheduled_at,
                        },
                        Outcome::Retried,
                    )
                }
                RetryDecision::Exhausted { retry_count } => {
                    let message = failures
                        .iter()
                        .map(|(s, msg)| format!("{}: {msg}", s.name()))
                        .collect::<Vec<_>>()
                        .join("; ");
                    error!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.id,
                        event_type = event.event_type.as_str(),
                        retry_count,
                        error = %message,
                        "retries exhausted, event failed"
                    );
                    (
                        EventUpdate::MarkFailed {
                            retry_count,
                            error: message,
                        },
                        Outcome::Failed,
                    )
                }
            }
        };

        match self
            .store
            .update(event.tenant_id, event.id, &self.settings.worker_id, &update)
            .await
        {
            Ok(true) => {
                if outcome == Outcome::Processed {
                    debug!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.id,
                        event_type = event.event_type.as_str(),
                        handlers = subscriptions.len(),
                        "event processed"
                    );
                }
                outcome
            }
            Ok(false) => {
                warn!(
                    tenant_id = %event.tenant_id,
                    event_id = %event.id,
                    worker_id = %self.settings.worker_id,
                    "claim lost before outcome was written"
                );
                Outcome::ClaimLost
            }
            Err(err) => {
                error!(
                    tenant_id = %event.tenant_id,
                    event_id = %event.id,
                    error = %err,
                    "failed to record dispatch outcome"
                );
                Outcome::StoreError
            }
        }
    }

    /// Run one handler in its own task under the subscription timeout.
    ///
    /// On timeout the task is aborted. A handler that blocks without yielding
    /// keeps running on its worker thread; the dispatcher no longer waits for it.
    async fn invoke(&self, subscription: &Arc<Subscription>, event: &BusinessEvent) -> Result<(), String> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| "dispatcher shut down".to_string())?;

        let handler = subscription.handler();
        let owned = event.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned).await });

        let result = match tokio::time::timeout(subscription.timeout(), &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(join_err)) => Err(format!("handler panicked: {join_err}")),
            Err(_) => {
                task.abort();
                Err(format!(
                    "handler timed out after {}ms",
                    subscription.timeout().as_millis()
                ))
            }
        };

        match &result {
            Ok(()) => subscription.record_success(self.clock.now()),
            Err(message) => {
                warn!(
                    tenant_id = %event.tenant_id,
                    event_id = %event.id,
                    event_type = event.event_type.as_str(),
                    subscription = subscription.name(),
                    error = %message,
                    "handler failed"
                );
                subscription.record_failure(message.clone());
            }
        }
        result
    }
}
