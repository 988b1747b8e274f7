//! Aggregate bus statistics: counts, success rate and daily throughput.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use rentaldesk_core::{Clock, TenantId};
use rentaldesk_events::{SubscriptionInfo, SubscriptionRegistry};

use crate::event_store::{EventRecordStore, StoreError};

/// Point-in-time view of the bus for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub total_events: u64,
    pub events_today: u64,
    pub pending_events: u64,
    pub failed_events: u64,
    pub processed_events: u64,
    /// Mean over the most recent processed events; 0 when nothing was processed yet.
    pub avg_processing_time_ms: f64,
    pub subscribers_count: usize,
    /// Distinct event types persisted for the tenant.
    pub event_types_count: u64,
    pub subscriptions: Vec<SubscriptionInfo>,
}

impl BusStats {
    /// Share of settled events that ended Failed.
    pub fn failure_rate(&self) -> f64 {
        let settled = self.failed_events + self.processed_events;
        if settled == 0 {
            0.0
        } else {
            self.failed_events as f64 / settled as f64
        }
    }
}

/// Read-only aggregation over the store and the registry.
pub struct StatsCollector {
    store: Arc<dyn EventRecordStore>,
    registry: Arc<SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    sample_size: usize,
}

impl StatsCollector {
    pub fn new(
        store: Arc<dyn EventRecordStore>,
        registry: Arc<SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
        sample_size: usize,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            sample_size,
        }
    }

    pub async fn collect(&self, tenant_id: TenantId) -> Result<BusStats, StoreError> {
        let today_start = start_of_day(self.clock.now());
        let counts = self
            .store
            .counts(tenant_id, today_start, self.sample_size)
            .await?;

        Ok(BusStats {
            total_events: counts.total,
            events_today: counts.today,
            pending_events: counts.pending,
            failed_events: counts.failed,
            processed_events: counts.processed,
            avg_processing_time_ms: counts.avg_processing_time_ms.unwrap_or(0.0),
            subscribers_count: self.registry.active_count(),
            event_types_count: counts.event_types,
            subscriptions: self.registry.list(),
        })
    }
}

/// Midnight UTC of the day containing `now`.
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
