//! Business event bus: data model and in-process mechanics.
//!
//! This crate has no storage or runtime assumptions. It defines what a business
//! event is, how one is validated, how retries are scheduled and how handlers
//! are registered. Persistence and dispatch live in `rentaldesk-infra`.

pub mod event;
pub mod event_type;
pub mod handler;
pub mod priority;
pub mod retry;
pub mod subscription;
pub mod tenant;
pub mod validation;

pub use event::{
    BusinessEvent, DEFAULT_MAX_RETRIES, EventDraft, EventId, EventMetadata, EventState,
    MAX_PAYLOAD_BYTES,
};
pub use event_type::{EventCategory, EventType, UnknownEventType};
pub use handler::{EventFilter, EventHandler, HandlerError, handler_fn};
pub use priority::Priority;
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy, plan_retry};
pub use subscription::{
    DEFAULT_HANDLER_TIMEOUT, SubscribeError, Subscription, SubscriptionId, SubscriptionInfo,
    SubscriptionRegistry, SubscriptionSpec,
};
pub use tenant::{FixedTenant, TenantContext};
pub use validation::{EventValidator, ValidatedDraft, ValidationError};
