//! Operator maintenance: re-arming failed events and retention cleanup.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

use rentaldesk_events::EventId;

use super::{BusError, EventBus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    /// Failed events made eligible again, oldest first.
    pub rearmed: Vec<EventId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub days_old: u32,
    pub deleted: u64,
}

impl EventBus {
    /// Clear `error` on up to `retry_batch_size` failed events and make them
    /// due now. They are picked up by the next dispatch tick.
    ///
    /// `retry_count` is kept: a re-armed event that fails again goes straight
    /// back to Failed.
    pub async fn retry_failed_events(&self) -> Result<RetryReport, BusError> {
        let tenant_id = self.current_tenant()?;
        let rearmed = self
            .store
            .rearm_failed(tenant_id, self.clock.now(), self.config.retry_batch_size)
            .await?;

        info!(tenant_id = %tenant_id, rearmed = rearmed.len(), "failed events re-armed");
        Ok(RetryReport { rearmed })
    }

    /// Delete processed events older than `days_old` days. Failed events are
    /// never deleted here.
    pub async fn cleanup_old_events(&self, days_old: u32) -> Result<CleanupReport, BusError> {
        let tenant_id = self.current_tenant()?;
        let cutoff = self.clock.now() - Duration::days(i64::from(days_old));
        let deleted = self.store.purge_processed(tenant_id, cutoff).await?;

        info!(tenant_id = %tenant_id, days_old, deleted, "old processed events purged");
        Ok(CleanupReport { days_old, deleted })
    }
}
