//! The business event bus.
//!
//! `EventBus` owns one store client, the subscription registry, a clock, a
//! tenant context and its own dispatcher loop. Nothing runs until `start()`.

pub mod config;
pub mod dispatcher;
pub mod maintenance;
pub mod publisher;
pub mod stats;

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rentaldesk_core::{Clock, SystemClock, TenantId};
use rentaldesk_events::{
    BusinessEvent, EventDraft, EventId, EventValidator, MAX_PAYLOAD_BYTES, SubscribeError,
    SubscriptionId, SubscriptionRegistry, SubscriptionSpec, TenantContext,
};

use crate::event_store::{EventPage, EventQuery, EventRecordStore, Pagination, StoreError};

pub use config::{BusConfig, ConfigError};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherSettings, Outcome};
pub use maintenance::{CleanupReport, RetryReport};
pub use publisher::{PublishError, PublishReceipt, PublishResult, Publisher};
pub use stats::{BusStats, StatsCollector};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is already running")]
    AlreadyRunning,

    #[error("no tenant in the current context")]
    MissingTenant,

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct Worker {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct EventBus {
    store: Arc<dyn EventRecordStore>,
    registry: Arc<SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    tenant: Arc<dyn TenantContext>,
    config: BusConfig,
    dispatcher: Arc<Dispatcher>,
    publisher: Publisher,
    stats: StatsCollector,
    worker: Mutex<Option<Worker>>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

pub struct EventBusBuilder {
    store: Arc<dyn EventRecordStore>,
    tenant: Arc<dyn TenantContext>,
    clock: Arc<dyn Clock>,
    config: BusConfig,
}

impl EventBusBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<EventBus, BusError> {
        let Self {
            store,
            tenant,
            clock,
            config,
        } = self;
        config.validate()?;

        let registry = Arc::new(SubscriptionRegistry::new(config.default_handler_timeout));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clock),
            DispatcherSettings {
                worker_id: config.worker_id.clone(),
                batch_size: config.batch_size,
                max_in_flight: config.max_in_flight,
                lease_duration: config.lease_duration,
            },
        ));
        let publisher = Publisher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            EventValidator::new(MAX_PAYLOAD_BYTES, config.max_retries_ceiling),
            Arc::clone(&tenant),
            Arc::clone(&clock),
        )
        .with_immediate_dispatch(Arc::clone(&dispatcher));
        let stats = StatsCollector::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.stats_sample_size,
        );

        Ok(EventBus {
            store,
            registry,
            clock,
            tenant,
            config,
            dispatcher,
            publisher,
            stats,
            worker: Mutex::new(None),
        })
    }
}

impl EventBus {
    pub fn builder(
        store: Arc<dyn EventRecordStore>,
        tenant: Arc<dyn TenantContext>,
    ) -> EventBusBuilder {
        EventBusBuilder {
            store,
            tenant,
            clock: Arc::new(SystemClock),
            config: BusConfig::default(),
        }
    }

    /// A bus with default configuration and the system clock.
    pub fn new(store: Arc<dyn EventRecordStore>, tenant: Arc<dyn TenantContext>) -> Result<Self, BusError> {
        Self::builder(store, tenant).build()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    fn current_tenant(&self) -> Result<TenantId, BusError> {
        self.tenant.current_tenant().ok_or(BusError::MissingTenant)
    }

    pub async fn publish(&self, draft: EventDraft) -> PublishResult {
        self.publisher.publish(draft).await
    }

    pub async fn try_publish(&self, draft: EventDraft) -> Result<PublishReceipt, PublishError> {
        self.publisher.try_publish(draft).await
    }

    pub fn subscribe(&self, spec: SubscriptionSpec) -> Result<SubscriptionId, BusError> {
        Ok(self.registry.subscribe(spec, self.clock.now())?)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Run one dispatch tick for the current tenant.
    pub async fn dispatch_once(&self) -> Result<DispatchReport, BusError> {
        let tenant_id = self.current_tenant()?;
        Ok(self.dispatcher.dispatch_due(tenant_id).await?)
    }

    pub async fn get_stats(&self) -> Result<BusStats, BusError> {
        let tenant_id = self.current_tenant()?;
        Ok(self.stats.collect(tenant_id).await?)
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<BusinessEvent>, BusError> {
        let tenant_id = self.current_tenant()?;
        Ok(self.store.get(tenant_id, id).await?)
    }

    pub async fn list_events(
        &self,
        query: &EventQuery,
        pagination: Pagination,
    ) -> Result<EventPage, BusError> {
        let tenant_id = self.current_tenant()?;
        Ok(self.store.list(tenant_id, query, pagination).await?)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.task.is_finished())
    }

    /// Spawn the periodic dispatcher loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        let tenant_id = self.current_tenant()?;
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.task.is_finished()) {
            return Err(BusError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.dispatcher),
            tenant_id,
            self.config.poll_interval,
            token.clone(),
        ));
        *worker = Some(Worker { token, task });

        info!(
            tenant_id = %tenant_id,
            worker_id = %self.config.worker_id,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "event bus started"
        );
        Ok(())
    }

    /// Stop the loop and wait for the tick in progress to finish.
    ///
    /// Immediate dispatches already spawned by `publish` are not awaited.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Worker { token, task }) = worker else {
            return;
        };

        token.cancel();
        if let Err(err) = task.await {
            error!(error = %err, "dispatcher loop ended abnormally");
        }
        info!(worker_id = %self.config.worker_id, "event bus stopped");
    }
}

async fn run_loop(
    dispatcher: Arc<Dispatcher>,
    tenant_id: TenantId,
    period: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = dispatcher.dispatch_due(tenant_id).await {
                    warn!(tenant_id = %tenant_id, error = %err, "dispatch tick failed");
                }
            }
        }
    }
}
