//! Failure tracking and exponential backoff for a single realm.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Health of a realm as seen by the scheduler's fetch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealmHealth {
    /// No fetch has completed yet.
    Unknown,
    /// The last fetch succeeded.
    Healthy,
    /// Failing, but below the unhealthy threshold.
    Degraded,
    /// Failed at least `unhealthy_threshold` times in a row.
    Unhealthy,
}

/// Exponential retry schedule used after failed fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub retry_base: Duration,
    /// Upper bound for any failure delay.
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    pub fn new(retry_base: Duration, max_backoff: Duration) -> Self {
        Self {
            retry_base,
            max_backoff: max_backoff.max(retry_base),
        }
    }

    /// Delay before retrying after `consecutive_failures` failures in a row.
    ///
    /// `retry_base * 2^(failures - 1)`, capped at `max_backoff`. Zero
    /// failures means no backoff applies.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32
            .checked_shl(consecutive_failures - 1)
            .unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(3600))
    }
}

/// Tracks consecutive fetch results for a single realm.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: RealmHealth,
    consecutive_failures: u32,
    /// Failures in a row before the realm counts as unhealthy.
    unhealthy_threshold: u32,
    policy: BackoffPolicy,
    /// Delay chosen by the most recent `record_*` call.
    last_delay: Duration,
}

impl HealthTracker {
    pub fn new(policy: BackoffPolicy, unhealthy_threshold: u32) -> Self {
        Self {
            status: RealmHealth::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            policy,
            last_delay: Duration::ZERO,
        }
    }

    /// Record a successful fetch. Returns the delay until the next one,
    /// which is always the realm's nominal `interval`.
    pub fn record_success(&mut self, interval: Duration) -> Duration {
        if self.status != RealmHealth::Healthy && self.consecutive_failures > 0 {
            debug!(
                failures = self.consecutive_failures,
                "realm recovered to healthy"
            );
        }
        self.consecutive_failures = 0;
        self.status = RealmHealth::Healthy;
        self.last_delay = interval;
        interval
    }

    /// Record a failed fetch. Returns the backoff delay until the retry.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.unhealthy_threshold {
            if self.status != RealmHealth::Unhealthy {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "realm marked unhealthy"
                );
            }
            self.status = RealmHealth::Unhealthy;
        } else {
            self.status = RealmHealth::Degraded;
        }

        self.last_delay = self.policy.delay(self.consecutive_failures);
        self.last_delay
    }

    pub fn status(&self) -> RealmHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }
}
