//! Record store contract shared by the in-memory and Postgres adapters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rentaldesk_core::TenantId;
use rentaldesk_events::{BusinessEvent, EventId};

use super::query::{EventPage, EventQuery, Pagination};

/// A request to lease due events to one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Lease owner written into `claimed_by`.
    pub owner: String,
    pub now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    pub limit: usize,
}

impl ClaimRequest {
    pub fn new(
        owner: impl Into<String>,
        now: DateTime<Utc>,
        lease: std::time::Duration,
        limit: usize,
    ) -> Self {
        Self {
            owner: owner.into(),
            now,
            lease_until: lease_deadline(now, lease),
            limit,
        }
    }
}

/// `now + lease`, saturating at the latest representable instant.
pub fn lease_deadline(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Outcome written back by the lease owner once dispatch finished.
///
/// Every variant clears the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventUpdate {
    /// All matching handlers succeeded.
    MarkProcessed {
        processed_at: DateTime<Utc>,
        processing_time_ms: u64,
    },
    /// At least one handler failed and retries remain.
    ScheduleRetry {
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    },
    /// Retries exhausted.
    MarkFailed { retry_count: u32, error: String },
    /// Give the event back untouched (shutdown mid-dispatch).
    Release,
}

/// Aggregate counters for one tenant, computed by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub total: u64,
    pub today: u64,
    /// Unprocessed and without error (includes retry-pending and claimed).
    pub pending: u64,
    pub failed: u64,
    pub processed: u64,
    /// Mean over the most recent processed events, `None` when there are none.
    pub avg_processing_time_ms: Option<f64>,
    pub event_types: u64,
}

/// Record store operation error.
///
/// Infrastructure errors only; validation happens before the store is touched.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event already exists: {0}")]
    AlreadyExists(EventId),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("failed to decode stored event: {0}")]
    Decode(String),
}

/// Durable, tenant-scoped storage for business events.
///
/// ## Claims
///
/// `claim_due` and `claim_one` are atomic conditional updates: an event is
/// handed out only if it is unprocessed, not failed, due, and carries no live
/// lease. A dispatcher keeps its leases alive with `extend_leases` while
/// handlers run. Concurrent claimers (tasks or processes) never receive the same event
/// while a lease is live. Expired leases are reclaimable, which makes delivery
/// at-least-once.
///
/// ## Ownership
///
/// `update` applies only while `owner` still holds the claim, so a dispatcher
/// whose lease was taken over cannot overwrite the new owner's outcome.
#[async_trait]
pub trait EventRecordStore: Send + Sync {
    /// Persist a new event. The event must belong to `tenant_id`.
    async fn insert(&self, tenant_id: TenantId, event: &BusinessEvent) -> Result<(), StoreError>;

    async fn get(&self, tenant_id: TenantId, id: EventId) -> Result<Option<BusinessEvent>, StoreError>;

    /// Lease up to `request.limit` due events, priority desc then `created_at` asc.
    async fn claim_due(
        &self,
        tenant_id: TenantId,
        request: &ClaimRequest,
    ) -> Result<Vec<BusinessEvent>, StoreError>;

    /// Lease one specific event if it is due.
    async fn claim_one(
        &self,
        tenant_id: TenantId,
        id: EventId,
        request: &ClaimRequest,
    ) -> Result<Option<BusinessEvent>, StoreError>;

    /// Returns `false` when the claim was lost (or the event is unknown).
    async fn update(
        &self,
        tenant_id: TenantId,
        id: EventId,
        owner: &str,
        update: &EventUpdate,
    ) -> Result<bool, StoreError>;

    /// Push the lease of every event in `ids` still held by `owner` out to
    /// `until`. Returns how many leases were renewed.
    async fn extend_leases(
        &self,
        tenant_id: TenantId,
        ids: &[EventId],
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Clear `error` and re-arm up to `limit` failed events, oldest first.
    async fn rearm_failed(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventId>, StoreError>;

    /// Delete processed events created before `older_than`. Failed events are kept.
    async fn purge_processed(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn counts(
        &self,
        tenant_id: TenantId,
        today_start: DateTime<Utc>,
        sample: usize,
    ) -> Result<StoreCounts, StoreError>;

    async fn list(
        &self,
        tenant_id: TenantId,
        query: &EventQuery,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError>;
}

#[async_trait]
impl<S> EventRecordStore for Arc<S>
where
    S: EventRecordStore + ?Sized,
{
    async fn insert(&self, tenant_id: TenantId, event: &BusinessEvent) -> Result<(), StoreError> {
        (**self).insert(tenant_id, event).await
    }

    async fn get(&self, tenant_id: TenantId, id: EventId) -> Result<Option<BusinessEvent>, StoreError> {
        (**self).get(tenant_id, id).await
    }

    async fn claim_due(
        &self,
        tenant_id: TenantId,
        request: &ClaimRequest,
    ) -> Result<Vec<BusinessEvent>, StoreError> {
        (**self).claim_due(tenant_id, request).await
    }

    async fn claim_one(
        &self,
        tenant_id: TenantId,
        id: EventId,
        request: &ClaimRequest,
    ) -> Result<Option<BusinessEvent>, StoreError> {
        (**self).claim_one(tenant_id, id, request).await
    }

    async fn update(
        &self,
        tenant_id: TenantId,
        id: EventId,
        owner: &str,
        update: &EventUpdate,
    ) -> Result<bool, StoreError> {
        (**self).update(tenant_id, id, owner, update).await
    }

    async fn extend_leases(
        &self,
        tenant_id: TenantId,
        ids: &[EventId],
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).extend_leases(tenant_id, ids, owner, until).await
    }

    async fn rearm_failed(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventId>, StoreError> {
        (**self).rearm_failed(tenant_id, now, limit).await
    }

    async fn purge_processed(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).purge_processed(tenant_id, older_than).await
    }

    async fn counts(
        &self,
        tenant_id: TenantId,
        today_start: DateTime<Utc>,
        sample: usize,
    ) -> Result<StoreCounts, StoreError> {
        (**self).counts(tenant_id, today_start, sample).await
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        query: &EventQuery,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        (**self).list(tenant_id, query, pagination).await
    }
}

/// Dispatch order: priority descending, then creation time ascending.
///
/// The id breaks ties so the order is total for a fixed input set.
pub fn dispatch_order(a: &BusinessEvent, b: &BusinessEvent) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
