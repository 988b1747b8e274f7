//! Publish-time validation. Nothing is persisted for a draft that fails here.

use serde_json::Value as JsonValue;
use thiserror::Error;

use rentaldesk_core::TenantId;

use crate::event::{EventDraft, MAX_PAYLOAD_BYTES};
use crate::event_type::EventType;

/// Retry ceiling a publisher may request per event.
pub const DEFAULT_MAX_RETRIES_CEILING: u32 = 10;

/// A draft was rejected before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid event type")]
    InvalidEventType { value: String },

    #[error("Event source is required")]
    MissingSource,

    #[error("Event data is required")]
    MissingData,

    #[error("Event data exceeds maximum size ({size} bytes > {limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Tenant context is required")]
    MissingTenant,

    #[error("max_retries {requested} exceeds the allowed ceiling of {ceiling}")]
    InvalidMaxRetries { requested: u32, ceiling: u32 },
}

/// Output of a successful validation: the parsed type and resolved tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ValidatedDraft {
    pub event_type: EventType,
    pub tenant_id: TenantId,
}

/// Checks type, source, payload and tenant of a draft.
#[derive(Debug, Clone, Copy)]
pub struct EventValidator {
    max_payload_bytes: usize,
    max_retries_ceiling: u32,
}

impl Default for EventValidator {
    fn default() -> Self {
        Self {
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            max_retries_ceiling: DEFAULT_MAX_RETRIES_CEILING,
        }
    }
}

impl EventValidator {
    pub fn new(max_payload_bytes: usize, max_retries_ceiling: u32) -> Self {
        Self {
            max_payload_bytes,
            max_retries_ceiling,
        }
    }

    /// Validate `draft`; `context_tenant` is used when the draft carries no tenant.
    pub fn validate(
        &self,
        draft: &EventDraft,
        context_tenant: Option<TenantId>,
    ) -> Result<ValidatedDraft, ValidationError> {
        let event_type = draft
            .event_type
            .parse::<EventType>()
            .map_err(|_| ValidationError::InvalidEventType {
                value: draft.event_type.clone(),
            })?;

        if draft.source.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(ValidationError::MissingSource);
        }

        let data = match &draft.data {
            None | Some(JsonValue::Null) => return Err(ValidationError::MissingData),
            Some(data) => data,
        };

        let size = serialized_len(data);
        if size > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: self.max_payload_bytes,
            });
        }

        if let Some(requested) = draft.max_retries {
            if requested > self.max_retries_ceiling {
                return Err(ValidationError::InvalidMaxRetries {
                    requested,
                    ceiling: self.max_retries_ceiling,
                });
            }
        }

        let tenant_id = draft
            .tenant_id
            .or(context_tenant)
            .ok_or(ValidationError::MissingTenant)?;

        Ok(ValidatedDraft {
            event_type,
            tenant_id,
        })
    }
}

fn serialized_len(data: &JsonValue) -> usize {
    // Serializing a `Value` cannot fail (keys are always strings).
    serde_json::to_vec(data).map(|v| v.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> EventDraft {
        EventDraft::new(EventType::VehicleReturned, "fleet").with_data(json!({"vehicle_id": "V-7"}))
    }

    #[test]
    fn accepts_a_complete_draft() {
        let tenant = TenantId::new();
        let ok = EventValidator::default().validate(&valid(), Some(tenant)).unwrap();
        assert_eq!(ok.event_type, EventType::VehicleReturned);
        assert_eq!(ok.tenant_id, tenant);
    }

    #[test]
    fn draft_tenant_wins_over_context() {
        let own = TenantId::new();
        let ok = EventValidator::default()
            .validate(&valid().for_tenant(own), Some(TenantId::new()))
            .unwrap();
        assert_eq!(ok.tenant_id, own);
    }

    #[test]
    fn unknown_type_is_rejected_with_stable_message() {
        let draft = EventDraft::new("not_a_real_type", "ui").with_data(json!({}));
        let err = EventValidator::default()
            .validate(&draft, Some(TenantId::new()))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid event type");
    }

    #[test]
    fn missing_source_and_data_are_rejected() {
        let v = EventValidator::default();
        let tenant = Some(TenantId::new());

        let mut no_source = valid();
        no_source.source = None;
        assert_eq!(v.validate(&no_source, tenant), Err(ValidationError::MissingSource));

        let mut blank_source = valid();
        blank_source.source = Some("  ".into());
        assert_eq!(v.validate(&blank_source, tenant), Err(ValidationError::MissingSource));

        let mut no_data = valid();
        no_data.data = None;
        assert_eq!(v.validate(&no_data, tenant), Err(ValidationError::MissingData));

        let null_data = valid().with_data(JsonValue::Null);
        assert_eq!(v.validate(&null_data, tenant), Err(ValidationError::MissingData));
    }

    #[test]
    fn payload_limit_is_inclusive() {
        let v = EventValidator::default();
        let tenant = Some(TenantId::new());
        // `"` + body + `"` serializes to body.len() + 2 bytes.
        let at_limit = valid().with_data(json!("x".repeat(MAX_PAYLOAD_BYTES - 2)));
        assert!(v.validate(&at_limit, tenant).is_ok());

        let over = valid().with_data(json!("x".repeat(MAX_PAYLOAD_BYTES - 1)));
        assert_eq!(
            v.validate(&over, tenant),
            Err(ValidationError::PayloadTooLarge {
                size: MAX_PAYLOAD_BYTES + 1,
                limit: MAX_PAYLOAD_BYTES
            })
        );
    }

    #[test]
    fn tenant_is_required() {
        assert_eq!(
            EventValidator::default().validate(&valid(), None),
            Err(ValidationError::MissingTenant)
        );
    }

    #[test]
    fn max_retries_ceiling_is_enforced() {
        let v = EventValidator::new(MAX_PAYLOAD_BYTES, 5);
        let err = v
            .validate(&valid().with_max_retries(6), Some(TenantId::new()))
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidMaxRetries { requested: 6, ceiling: 5 });
    }
}
