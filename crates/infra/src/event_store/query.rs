//! Event inspection queries.
//!
//! Read-only, tenant-scoped and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentaldesk_events::{BusinessEvent, EventType};

/// Pagination parameters for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of events to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Coarse, time-independent status used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Unprocessed without error.
    Pending,
    Processed,
    /// Unprocessed with error.
    Failed,
}

impl EventStatus {
    pub fn of(event: &BusinessEvent) -> Self {
        if event.processed {
            EventStatus::Processed
        } else if event.error.is_some() {
            EventStatus::Failed
        } else {
            EventStatus::Pending
        }
    }
}

/// Filter criteria for event queries. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub status: Option<EventStatus>,
    pub source: Option<String>,
    pub aggregate_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl EventQuery {
    pub fn matches(&self, event: &BusinessEvent) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type)
            && self.status.is_none_or(|s| s == EventStatus::of(event))
            && self.source.as_deref().is_none_or(|s| s == event.source)
            && self
                .aggregate_id
                .as_deref()
                .is_none_or(|id| event.aggregate_id.as_deref() == Some(id))
            && self.created_after.is_none_or(|t| event.created_at >= t)
            && self.created_before.is_none_or(|t| event.created_at <= t)
    }
}

/// Paginated query result, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<BusinessEvent>,
    /// Total number of events matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}
