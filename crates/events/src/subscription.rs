//! In-memory subscription registry.
//!
//! Subscriptions live as long as the hosting process. Only persisted events
//! survive a restart; every subscriber must register again on startup.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rentaldesk_core::impl_uuid_newtype;

use crate::event::BusinessEvent;
use crate::event_type::EventType;
use crate::handler::{EventFilter, EventHandler};
use crate::retry::RetryPolicy;

/// Handler timeout when a subscription does not set one.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Unique subscription identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl_uuid_newtype!(SubscriptionId, "SubscriptionId");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("subscription '{0}' declares no event types")]
    NoEventTypes(String),
    #[error("subscription '{0}' has no handler")]
    MissingHandler(String),
    #[error("subscription '{0}' has a zero timeout")]
    ZeroTimeout(String),
}

/// Declarative description of a subscription, handed to `subscribe`.
pub struct SubscriptionSpec {
    name: String,
    event_types: BTreeSet<EventType>,
    filter: Option<EventFilter>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    handler: Option<Arc<dyn EventHandler>>,
}

impl SubscriptionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_types: BTreeSet::new(),
            filter: None,
            timeout: None,
            retry_policy: None,
            handler: None,
        }
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_types.insert(event_type);
        self
    }

    pub fn event_types(mut self, event_types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(event_types);
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&BusinessEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

/// A registered subscription with its delivery counters.
pub struct Subscription {
    id: SubscriptionId,
    name: String,
    event_types: BTreeSet<EventType>,
    filter: Option<EventFilter>,
    timeout: Duration,
    retry_policy: Option<RetryPolicy>,
    handler: Arc<dyn EventHandler>,
    created_at: DateTime<Utc>,

    is_active: AtomicBool,
    processed_count: AtomicU64,
    error_count: AtomicU64,
    last_processed: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .field("timeout", &self.timeout)
            .field("is_active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Routing rule: type registered AND (no filter OR filter accepts).
    ///
    /// A filter that panics counts as "no match".
    pub fn matches(&self, event: &BusinessEvent) -> bool {
        if !self.is_active() || !self.event_types.contains(&event.event_type) {
            return false;
        }
        let Some(accept) = self.filter.as_ref() else {
            return true;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| accept(event))) {
            Ok(accepted) => accepted,
            Err(_) => {
                warn!(
                    subscription = %self.name,
                    event_id = %event.id,
                    event_type = event.event_type.as_str(),
                    "subscription filter panicked, event not delivered"
                );
                false
            }
        }
    }

    pub fn record_success(&self, at: DateTime<Utc>) {
        self.processed_count.fetch_add(1, Ordering::Relaxed);
        *self.last_processed.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            name: self.name.clone(),
            event_types: self.event_types.iter().copied().collect(),
            has_filter: self.filter.is_some(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            is_active: self.is_active(),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_processed: *self.last_processed.lock().unwrap_or_else(PoisonError::into_inner),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            created_at: self.created_at,
        }
    }
}

/// Point-in-time view of a subscription (for stats and operators).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub name: String,
    pub event_types: Vec<EventType>,
    pub has_filter: bool,
    pub timeout_ms: u64,
    pub is_active: bool,
    pub processed_count: u64,
    pub error_count: u64,
    pub last_processed: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Concurrency-safe table of active subscriptions.
///
/// Dispatch reads (`matching`) and subscribe/unsubscribe writes may happen from
/// different tasks. Matching returns `Arc`s, so an in-flight invocation keeps
/// its subscription alive after `unsubscribe`.
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    default_timeout: Duration,
}

impl core::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active", &self.active_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_TIMEOUT)
    }
}

impl SubscriptionRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn subscribe(
        &self,
        spec: SubscriptionSpec,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionId, SubscribeError> {
        if spec.event_types.is_empty() {
            return Err(SubscribeError::NoEventTypes(spec.name));
        }
        let Some(handler) = spec.handler else {
            return Err(SubscribeError::MissingHandler(spec.name));
        };
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return Err(SubscribeError::ZeroTimeout(spec.name));
        }

        let subscription = Arc::new(Subscription {
            id: SubscriptionId::new(),
            name: spec.name,
            event_types: spec.event_types,
            filter: spec.filter,
            timeout,
            retry_policy: spec.retry_policy,
            handler,
            created_at: now,
            is_active: AtomicBool::new(true),
            processed_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_processed: Mutex::new(None),
            last_error: Mutex::new(None),
        });

        let id = subscription.id;
        info!(
            subscription_id = %id,
            subscription = %subscription.name,
            event_types = ?subscription.event_types,
            "subscription registered"
        );

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscription);
        Ok(id)
    }

    /// Deactivate and remove. Returns `false` for unknown ids.
    ///
    /// Takes effect for every dispatch cycle that starts after the call; an
    /// invocation already running is not interrupted.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match removed {
            Some(subscription) => {
                subscription.is_active.store(false, Ordering::Release);
                info!(subscription_id = %id, subscription = %subscription.name, "subscription removed");
                true
            }
            None => {
                debug!(subscription_id = %id, "unsubscribe for unknown subscription");
                false
            }
        }
    }

    /// Active subscriptions that should receive `event`, oldest registration first.
    pub fn matching(&self, event: &BusinessEvent) -> Vec<Arc<Subscription>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<_> = entries
            .values()
            .filter(|s| s.matches(event))
            .cloned()
            .collect();
        matched.sort_by_key(|s| (s.created_at, *s.id.as_uuid()));
        matched
    }

    pub fn count_matching(&self, event: &BusinessEvent) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.matches(event))
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|s| s.info())
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.info())
            .collect();
        all.sort_by_key(|s| s.created_at);
        all
    }
}
