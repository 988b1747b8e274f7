//! Bus configuration loading and representation.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use rentaldesk_events::DEFAULT_HANDLER_TIMEOUT;
use rentaldesk_events::validation::DEFAULT_MAX_RETRIES_CEILING;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Runtime knobs of one bus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Dispatcher tick period.
    pub poll_interval: Duration,
    /// Events claimed per tick.
    pub batch_size: usize,
    /// Cap on concurrently running handler invocations.
    pub max_in_flight: usize,
    pub default_handler_timeout: Duration,
    /// How long a claim stays exclusive before another dispatcher may take over.
    pub lease_duration: Duration,
    /// Failed events re-armed per `retry_failed_events` call.
    pub retry_batch_size: usize,
    /// Processed events averaged for `avg_processing_time_ms`.
    pub stats_sample_size: usize,
    pub max_retries_ceiling: u32,
    /// Lease owner name; unique per process.
    pub worker_id: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_in_flight: 16,
            default_handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            lease_duration: Duration::from_secs(300),
            retry_batch_size: 100,
            stats_sample_size: 100,
            max_retries_ceiling: DEFAULT_MAX_RETRIES_CEILING,
            worker_id: default_worker_id(),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", Uuid::now_v7().simple())
}

impl BusConfig {
    /// Read `EVENT_BUS_*` variables on top of the defaults.
    ///
    /// | Variable | Unit |
    /// |----------|------|
    /// | `EVENT_BUS_POLL_INTERVAL_MS` | ms |
    /// | `EVENT_BUS_BATCH_SIZE` | events |
    /// | `EVENT_BUS_MAX_IN_FLIGHT` | invocations |
    /// | `EVENT_BUS_HANDLER_TIMEOUT_MS` | ms |
    /// | `EVENT_BUS_LEASE_SECS` | s |
    /// | `EVENT_BUS_RETRY_BATCH_SIZE` | events |
    /// | `EVENT_BUS_STATS_SAMPLE_SIZE` | events |
    /// | `EVENT_BUS_MAX_RETRIES_CEILING` | retries |
    /// | `EVENT_BUS_WORKER_ID` | name |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, "EVENT_BUS_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "EVENT_BUS_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(n) = parse(&lookup, "EVENT_BUS_MAX_IN_FLIGHT")? {
            config.max_in_flight = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "EVENT_BUS_HANDLER_TIMEOUT_MS")? {
            config.default_handler_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "EVENT_BUS_LEASE_SECS")? {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "EVENT_BUS_RETRY_BATCH_SIZE")? {
            config.retry_batch_size = n;
        }
        if let Some(n) = parse(&lookup, "EVENT_BUS_STATS_SAMPLE_SIZE")? {
            config.stats_sample_size = n;
        }
        if let Some(n) = parse(&lookup, "EVENT_BUS_MAX_RETRIES_CEILING")? {
            config.max_retries_ceiling = n;
        }
        if let Some(id) = lookup("EVENT_BUS_WORKER_ID").filter(|s| !s.trim().is_empty()) {
            config.worker_id = id.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("EVENT_BUS_POLL_INTERVAL_MS", self.poll_interval.is_zero()),
            ("EVENT_BUS_BATCH_SIZE", self.batch_size == 0),
            ("EVENT_BUS_MAX_IN_FLIGHT", self.max_in_flight == 0),
            ("EVENT_BUS_HANDLER_TIMEOUT_MS", self.default_handler_timeout.is_zero()),
            ("EVENT_BUS_LEASE_SECS", self.lease_duration.is_zero()),
            ("EVENT_BUS_RETRY_BATCH_SIZE", self.retry_batch_size == 0),
            ("EVENT_BUS_STATS_SAMPLE_SIZE", self.stats_sample_size == 0),
        ];
        if let Some((key, _)) = positive.into_iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid {
                key,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}
