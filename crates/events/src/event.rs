//! Business event record and the draft callers publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use rentaldesk_core::{TenantId, UserId, impl_uuid_newtype};

use crate::event_type::EventType;
use crate::priority::Priority;

/// Retries allowed when the publisher does not say otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound for the serialized `data` payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Unique event identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl_uuid_newtype!(EventId, "EventId");

/// Who/what caused an event. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Lifecycle position of an event, derived from its stored fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Waiting for its first (or a manually re-armed) dispatch.
    Pending,
    /// A handler failed; the next attempt is scheduled in the future.
    RetryPending,
    /// A dispatcher holds a live lease on the event.
    Claimed,
    /// Every matching handler succeeded. Terminal.
    Processed,
    /// Retries exhausted. Terminal until `retry_failed_events`.
    Failed,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::RetryPending => "retry_pending",
            EventState::Claimed => "claimed",
            EventState::Processed => "processed",
            EventState::Failed => "failed",
        }
    }
}

/// A persisted business event.
///
/// Notes:
/// - `processed = true` is terminal and never reverts.
/// - `error` is only set once retries are exhausted (the Failed state).
/// - `claimed_by`/`lease_expires_at` are the dispatcher's claim on the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: EventType,

    pub source: String,
    pub source_id: Option<String>,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,

    pub data: JsonValue,
    pub metadata: Option<EventMetadata>,

    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,

    /// Publish time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the event may be dispatched (again).
    pub scheduled_at: DateTime<Utc>,

    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub processing_time_ms: Option<u64>,

    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl BusinessEvent {
    /// Build the normalized record for a validated draft.
    ///
    /// Fills every default: id, priority, retry bookkeeping, `processed = false`.
    pub fn from_draft(
        draft: EventDraft,
        event_type: EventType,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: draft.id.unwrap_or_default(),
            tenant_id,
            event_type,
            source: draft.source.unwrap_or_default(),
            source_id: draft.source_id,
            aggregate_id: draft.aggregate_id,
            aggregate_type: draft.aggregate_type,
            data: draft.data.unwrap_or(JsonValue::Null),
            metadata: draft.metadata,
            priority: draft.priority.unwrap_or_default(),
            retry_count: 0,
            max_retries: draft.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: now,
            scheduled_at: draft.scheduled_at.unwrap_or(now),
            processed: false,
            processed_at: None,
            error: None,
            processing_time_ms: None,
            claimed_by: None,
            lease_expires_at: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        !self.processed && self.error.is_some()
    }

    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(until) if until > now)
    }

    /// Eligible for a claim: unprocessed, not failed, due and not leased.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.error.is_none() && self.scheduled_at <= now && !self.lease_active(now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> EventState {
        if self.processed {
            EventState::Processed
        } else if self.error.is_some() {
            EventState::Failed
        } else if self.lease_active(now) {
            EventState::Claimed
        } else if self.scheduled_at > now && self.retry_count > 0 {
            EventState::RetryPending
        } else {
            EventState::Pending
        }
    }
}

/// What a caller hands to `publish`.
///
/// The event type is kept as a raw string so that unknown kinds reach the
/// validator instead of failing at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    #[serde(default)]
    pub id: Option<EventId>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub aggregate_id: Option<String>,
    #[serde(default)]
    pub aggregate_type: Option<String>,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_aggregate(
        mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Delay the first dispatch until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(now: DateTime<Utc>) -> BusinessEvent {
        let draft = EventDraft::new(EventType::ContractSigned, "contracts")
            .with_data(serde_json::json!({"contract_id": "C-1"}));
        BusinessEvent::from_draft(draft, EventType::ContractSigned, TenantId::new(), now)
    }

    #[test]
    fn from_draft_populates_defaults() {
        let now = Utc::now();
        let e = event(now);

        assert_eq!(e.priority, Priority::Medium);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(e.created_at, now);
        assert_eq!(e.scheduled_at, now);
        assert!(!e.processed);
        assert!(e.error.is_none());
        assert_eq!(e.state(now), EventState::Pending);
        assert!(e.is_due(now));
    }

    #[test]
    fn explicit_id_is_kept() {
        let id = EventId::new();
        let draft = EventDraft::new("payment_received", "payments")
            .with_id(id)
            .with_data(serde_json::json!({}));
        let e = BusinessEvent::from_draft(draft, EventType::PaymentReceived, TenantId::new(), Utc::now());
        assert_eq!(e.id, id);
    }

    #[test]
    fn state_reflects_retry_lease_and_terminal_fields() {
        let now = Utc::now();
        let mut e = event(now);

        e.retry_count = 1;
        e.scheduled_at = now + Duration::seconds(4);
        assert_eq!(e.state(now), EventState::RetryPending);
        assert!(!e.is_due(now));
        assert!(e.is_due(now + Duration::seconds(4)));

        e.scheduled_at = now;
        e.claimed_by = Some("worker-a".into());
        e.lease_expires_at = Some(now + Duration::seconds(30));
        assert_eq!(e.state(now), EventState::Claimed);
        assert!(!e.is_due(now));
        // An expired lease no longer blocks a claim.
        assert!(e.is_due(now + Duration::seconds(31)));

        e.claimed_by = None;
        e.lease_expires_at = None;
        e.error = Some("boom".into());
        assert_eq!(e.state(now), EventState::Failed);
        assert!(e.is_failed());
        assert!(!e.is_due(now));

        e.error = None;
        e.processed = true;
        assert_eq!(e.state(now), EventState::Processed);
    }

    #[test]
    fn draft_deserializes_with_raw_type() {
        let draft: EventDraft = serde_json::from_value(serde_json::json!({
            "type": "not_a_real_type",
            "source": "ui",
            "data": {"a": 1}
        }))
        .unwrap();
        assert_eq!(draft.event_type, "not_a_real_type");
        assert!(draft.priority.is_none());
    }
}
