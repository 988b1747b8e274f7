//! Validate, normalize and persist business events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use rentaldesk_core::Clock;
use rentaldesk_events::{
    BusinessEvent, EventDraft, EventId, EventValidator, SubscriptionRegistry, TenantContext,
    ValidationError,
};

use super::dispatcher::Dispatcher;
use crate::event_store::{EventRecordStore, StoreError};

#[derive(Debug, Error)]
pub enum PublishError {
    /// Nothing was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store rejected the write; no Pending event is visible.
    #[error("failed to persist event: {0}")]
    Persistence(#[from] StoreError),
}

/// Successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub event_id: EventId,
    /// Active subscriptions matching at publish time. Observability only.
    pub subscribers_notified: usize,
    /// An immediate dispatch attempt was started.
    pub dispatched_immediately: bool,
}

/// Flat publish outcome for callers that do not branch on the error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub event_id: Option<EventId>,
    pub subscribers_notified: usize,
    pub error: Option<String>,
}

impl From<Result<PublishReceipt, PublishError>> for PublishResult {
    fn from(result: Result<PublishReceipt, PublishError>) -> Self {
        match result {
            Ok(receipt) => Self {
                success: true,
                event_id: Some(receipt.event_id),
                subscribers_notified: receipt.subscribers_notified,
                error: None,
            },
            Err(err) => Self {
                success: false,
                event_id: None,
                subscribers_notified: 0,
                error: Some(err.to_string()),
            },
        }
    }
}

pub struct Publisher {
    store: Arc<dyn EventRecordStore>,
    registry: Arc<SubscriptionRegistry>,
    validator: EventValidator,
    tenant: Arc<dyn TenantContext>,
    clock: Arc<dyn Clock>,
    immediate: Option<Arc<Dispatcher>>,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn EventRecordStore>,
        registry: Arc<SubscriptionRegistry>,
        validator: EventValidator,
        tenant: Arc<dyn TenantContext>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            tenant,
            clock,
            immediate: None,
        }
    }

    /// Dispatch high/critical events right after they are stored.
    pub fn with_immediate_dispatch(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.immediate = Some(dispatcher);
        self
    }

    pub async fn publish(&self, draft: EventDraft) -> PublishResult {
        self.try_publish(draft).await.into()
    }

    pub async fn try_publish(&self, draft: EventDraft) -> Result<PublishReceipt, PublishError> {
        let validated = match self.validator.validate(&draft, self.tenant.current_tenant()) {
            Ok(validated) => validated,
            Err(err) => {
                warn!(event_type = %draft.event_type, error = %err, "event rejected");
                return Err(err.into());
            }
        };

        let event = BusinessEvent::from_draft(
            draft,
            validated.event_type,
            validated.tenant_id,
            self.clock.now(),
        );
        self.store.insert(validated.tenant_id, &event).await?;

        let subscribers_notified = self.registry.count_matching(&event);
        let dispatched_immediately = self.spawn_immediate(&event);

        info!(
            tenant_id = %event.tenant_id,
            event_id = %event.id,
            event_type = event.event_type.as_str(),
            priority = event.priority.as_str(),
            subscribers = subscribers_notified,
            immediate = dispatched_immediately,
            "event published"
        );

        Ok(PublishReceipt {
            event_id: event.id,
            subscribers_notified,
            dispatched_immediately,
        })
    }

    /// The event is claimed before any handler runs, so a concurrent poll
    /// tick skips it. Publish does not wait for the handlers.
    fn spawn_immediate(&self, event: &BusinessEvent) -> bool {
        let Some(dispatcher) = self.immediate.as_ref() else {
            return false;
        };
        if !event.priority.is_urgent() || event.scheduled_at > event.created_at {
            return false;
        }

        let dispatcher = Arc::clone(dispatcher);
        let (tenant_id, event_id) = (event.tenant_id, event.id);
        tokio::spawn(async move {
            if let Err(err) = dispatcher.dispatch_one(tenant_id, event_id).await {
                warn!(
                    tenant_id = %tenant_id,
                    event_id = %event_id,
                    error = %err,
                    "immediate dispatch failed, poller will pick the event up"
                );
            }
        });
        true
    }
}
