//! In-memory record store for tests and local development.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rentaldesk_core::TenantId;
use rentaldesk_events::{BusinessEvent, EventId};

use super::query::{EventPage, EventQuery, Pagination};
use super::r#trait::{
    ClaimRequest, EventRecordStore, EventUpdate, StoreCounts, StoreError, dispatch_order,
};

/// In-memory record store.
///
/// Intended for tests/dev. Claims are atomic because every mutation happens
/// under one write lock.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<EventId, BusinessEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<EventId, BusinessEvent>>, StoreError> {
        self.events
            .read()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EventId, BusinessEvent>>, StoreError> {
        self.events
            .write()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }
}

fn lease(event: &mut BusinessEvent, request: &ClaimRequest) {
    event.claimed_by = Some(request.owner.clone());
    event.lease_expires_at = Some(request.lease_until);
}

#[async_trait]
impl EventRecordStore for InMemoryEventStore {
    async fn insert(&self, tenant_id: TenantId, event: &BusinessEvent) -> Result<(), StoreError> {
        if event.tenant_id != tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "event tenant_id mismatch: expected {tenant_id}, got {}",
                event.tenant_id
            )));
        }

        match self.write()?.entry(event.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(event.id)),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, tenant_id: TenantId, id: EventId) -> Result<Option<BusinessEvent>, StoreError> {
        Ok(self
            .read()?
            .get(&id)
            .filter(|e| e.tenant_id == tenant_id)
            .cloned())
    }

    async fn claim_due(
        &self,
        tenant_id: TenantId,
        request: &ClaimRequest,
    ) -> Result<Vec<BusinessEvent>, StoreError> {
        let mut events = self.write()?;

        let mut due: Vec<&mut BusinessEvent> = events
            .values_mut()
            .filter(|e| e.tenant_id == tenant_id && e.is_due(request.now))
            .collect();
        due.sort_by(|a, b| dispatch_order(a, b));
        due.truncate(request.limit);

        Ok(due
            .into_iter()
            .map(|event| {
                lease(event, request);
                event.clone()
            })
            .collect())
    }

    async fn claim_one(
        &self,
        tenant_id: TenantId,
        id: EventId,
        request: &ClaimRequest,
    ) -> Result<Option<BusinessEvent>, StoreError> {
        let mut events = self.write()?;
        Ok(events
            .get_mut(&id)
            .filter(|e| e.tenant_id == tenant_id && e.is_due(request.now))
            .map(|event| {
                lease(event, request);
                event.clone()
            }))
    }

    async fn update(
        &self,
        tenant_id: TenantId,
        id: EventId,
        owner: &str,
        update: &EventUpdate,
    ) -> Result<bool, StoreError> {
        let mut events = self.write()?;
        let Some(event) = events.get_mut(&id) else {
            return Ok(false);
        };
        if event.tenant_id != tenant_id || event.processed || event.claimed_by.as_deref() != Some(owner) {
            return Ok(false);
        }

        match update {
            EventUpdate::MarkProcessed {
                processed_at,
                processing_time_ms,
            } => {
                event.processed = true;
                event.processed_at = Some(*processed_at);
                event.processing_time_ms = Some(*processing_time_ms);
                event.error = None;
            }
            EventUpdate::ScheduleRetry {
                retry_count,
                scheduled_at,
            } => {
                event.retry_count = (*retry_count).min(event.max_retries);
                event.scheduled_at = *scheduled_at;
                event.error = None;
            }
            EventUpdate::MarkFailed { retry_count, error } => {
                event.retry_count = (*retry_count).min(event.max_retries);
                event.error = Some(error.clone());
            }
            EventUpdate::Release => {}
        }
        event.claimed_by = None;
        event.lease_expires_at = None;
        Ok(true)
    }

    async fn extend_leases(
        &self,
        tenant_id: TenantId,
        ids: &[EventId],
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut events = self.write()?;
        let mut renewed = 0;
        for id in ids {
            if let Some(event) = events.get_mut(id).filter(|e| {
                e.tenant_id == tenant_id && !e.processed && e.claimed_by.as_deref() == Some(owner)
            }) {
                event.lease_expires_at = Some(until);
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn rearm_failed(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventId>, StoreError> {
        let mut events = self.write()?;

        let mut failed: Vec<&mut BusinessEvent> = events
            .values_mut()
            .filter(|e| e.tenant_id == tenant_id && e.is_failed())
            .collect();
        failed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        failed.truncate(limit);

        Ok(failed
            .into_iter()
            .map(|event| {
                event.error = None;
                event.scheduled_at = now;
                event.claimed_by = None;
                event.lease_expires_at = None;
                event.id
            })
            .collect())
    }

    async fn purge_processed(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut events = self.write()?;
        let before = events.len();
        events.retain(|_, e| !(e.tenant_id == tenant_id && e.processed && e.created_at < older_than));
        Ok((before - events.len()) as u64)
    }

    async fn counts(
        &self,
        tenant_id: TenantId,
        today_start: DateTime<Utc>,
        sample: usize,
    ) -> Result<StoreCounts, StoreError> {
        let events = self.read()?;
        let mut counts = StoreCounts::default();
        let mut types = std::collections::HashSet::new();
        let mut timings: Vec<(DateTime<Utc>, u64)> = Vec::new();

        for e in events.values().filter(|e| e.tenant_id == tenant_id) {
            counts.total += 1;
            if e.created_at >= today_start {
                counts.today += 1;
            }
            if e.processed {
                counts.processed += 1;
                if let (Some(at), Some(ms)) = (e.processed_at, e.processing_time_ms) {
                    timings.push((at, ms));
                }
            } else if e.error.is_some() {
                counts.failed += 1;
            } else {
                counts.pending += 1;
            }
            types.insert(e.event_type);
        }

        timings.sort_by(|a, b| b.0.cmp(&a.0));
        timings.truncate(sample);
        if !timings.is_empty() {
            let sum: u64 = timings.iter().map(|(_, ms)| ms).sum();
            counts.avg_processing_time_ms = Some(sum as f64 / timings.len() as f64);
        }
        counts.event_types = types.len() as u64;
        Ok(counts)
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        query: &EventQuery,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        let events = self.read()?;
        let mut matched: Vec<&BusinessEvent> = events
            .values()
            .filter(|e| e.tenant_id == tenant_id && query.matches(e))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = matched.len() as u64;
        let page: Vec<BusinessEvent> = matched
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);

        Ok(EventPage {
            events: page,
            total,
            pagination,
            has_more,
        })
    }
}
