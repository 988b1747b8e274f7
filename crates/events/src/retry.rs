//! Retry scheduling: backoff math and the decision taken after a failed dispatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time: `base`
    Fixed,
    /// `base * multiplier^retry_count`
    #[default]
    Exponential,
    /// `base * (retry_count + 1)`
    Linear,
}

/// Retry policy for an event or a subscription override.
///
/// The default reproduces the bus schedule: 1s, 4s, 16s, 64s...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Lowers the event's own `max_retries` when set.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 4,
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
            max_retries: None,
        }
    }
}

/// What to do with an event after at least one handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-arm for another attempt.
    Reschedule {
        retry_count: u32,
        delay: Duration,
        scheduled_at: DateTime<Utc>,
    },
    /// No attempts left: the event becomes Failed.
    Exhausted { retry_count: u32 },
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, multiplier: u32, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Delay before the attempt that follows `retry_count` failures (0-indexed).
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = self.multiplier.checked_pow(retry_count).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_count.saturating_add(1)),
        };
        delay.min(self.max_delay)
    }

    /// Effective retry ceiling for an event that allows `event_max_retries`.
    pub fn ceiling(&self, event_max_retries: u32) -> u32 {
        self.max_retries
            .map_or(event_max_retries, |own| own.min(event_max_retries))
    }

    /// Decide the outcome of a failed attempt.
    pub fn plan(&self, retry_count: u32, event_max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if retry_count >= self.ceiling(event_max_retries) {
            return RetryDecision::Exhausted { retry_count };
        }

        let delay = self.delay_for_retry(retry_count);
        RetryDecision::Reschedule {
            retry_count: retry_count + 1,
            delay,
            scheduled_at: after(now, delay),
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Combine the policies of every subscription that failed for one event.
///
/// The lowest ceiling wins and, among reschedules, the longest delay wins.
/// With no policies the default schedule applies.
pub fn plan_retry<'a>(
    policies: impl IntoIterator<Item = &'a RetryPolicy>,
    retry_count: u32,
    event_max_retries: u32,
    now: DateTime<Utc>,
) -> RetryDecision {
    let mut decision: Option<RetryDecision> = None;

    for policy in policies {
        let next = policy.plan(retry_count, event_max_retries, now);
        decision = Some(match (decision, next) {
            (Some(exhausted @ RetryDecision::Exhausted { .. }), _) => exhausted,
            (_, exhausted @ RetryDecision::Exhausted { .. }) => exhausted,
            (
                Some(current @ RetryDecision::Reschedule { delay: held, .. }),
                candidate @ RetryDecision::Reschedule { delay, .. },
            ) => {
                if delay > held { candidate } else { current }
            }
            (None, candidate) => candidate,
        });
    }

    decision.unwrap_or_else(|| RetryPolicy::default().plan(retry_count, event_max_retries, now))
}
