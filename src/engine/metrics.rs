//! # Metrics Snapshot
//!
//! Read-only view of every tier's components, collected on demand.
//!
//! ```text
//!     snapshot()
//!     ├─ "enterprise"
//!     │  ├─ pool ........... active, idle, waiting, max
//!     │  ├─ workers ........ active, queued, max
//!     │  ├─ breaker ........ state, failureCount
//!     │  └─ rateLimiter .... consumed, quota
//!     ├─ "free"
//!     └─ "pro"
//! ```
//!
//! Collection only loads atomics, except for the limiter's `consumed` sum,
//! which walks the key table one shard at a time under that shard's read
//! lock. Admission of already-tracked keys is unaffected; the first request
//! of a new key waits until the walk leaves its shard, so the cost grows
//! with the number of tracked keys (capped by `max_tracked_keys`). Counters of
//! different components are sampled one after another and may be
//! slightly out of step with each other.

use super::breaker::{BreakerState, BreakerStats};
use super::limiter::LimiterStats;
use super::pool::PoolStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Resource pool section of [`TierMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    /// Connections in use.
    pub active: usize,
    /// Free connections.
    pub idle: usize,
    /// Callers waiting for a connection.
    pub waiting: usize,
    /// Capacity.
    pub max: usize,
}

/// Worker dispatcher section of [`TierMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    /// Task bodies running.
    pub active: usize,
    /// Callers waiting for a worker.
    pub queued: usize,
    /// Capacity.
    pub max: usize,
}

/// Circuit breaker section of [`TierMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerMetrics {
    /// Current state.
    pub state: BreakerState,
    /// Failures in the rolling window.
    pub failure_count: usize,
    /// Transitions into OPEN since startup.
    pub times_opened: u64,
}

/// Rate limiter section of [`TierMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterMetrics {
    /// Points consumed in live windows, summed over admission keys.
    pub consumed: u64,
    /// Points per window and key; `None` for unlimited tiers.
    pub quota: Option<u64>,
}

/// Metrics of one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMetrics {
    /// Resource pool.
    pub pool: PoolMetrics,
    /// Worker dispatcher.
    pub workers: WorkerMetrics,
    /// Circuit breaker.
    pub breaker: BreakerMetrics,
    /// Rate limiter.
    pub rate_limiter: RateLimiterMetrics,
}

impl TierMetrics {
    pub(crate) fn from_stats(
        pool: &PoolStats,
        workers: &PoolStats,
        breaker: &BreakerStats,
        limiter: &LimiterStats,
    ) -> Self {
        Self {
            pool: PoolMetrics {
                active: pool.active,
                idle: pool.idle(),
                waiting: pool.waiting,
                max: pool.max,
            },
            workers: WorkerMetrics {
                active: workers.active,
                queued: workers.waiting,
                max: workers.max,
            },
            breaker: BreakerMetrics {
                state: breaker.state,
                failure_count: breaker.failure_count,
                times_opened: breaker.times_opened,
            },
            rate_limiter: RateLimiterMetrics {
                consumed: limiter.consumed,
                quota: limiter.quota,
            },
        }
    }

    /// Whether callers are parked on either pool.
    pub fn is_under_pressure(&self) -> bool {
        self.pool.waiting > 0 || self.workers.queued > 0
    }

    /// Overall health of the tier.
    ///
    /// `Critical` while the breaker is OPEN, `Degraded` while a trial is in
    /// flight or callers are queueing, `Healthy` otherwise.
    pub fn health_status(&self) -> HealthStatus {
        match self.breaker.state {
            BreakerState::Open => HealthStatus::Critical,
            BreakerState::HalfOpen => HealthStatus::Degraded,
            BreakerState::Closed if self.is_under_pressure() => HealthStatus::Degraded,
            BreakerState::Closed => HealthStatus::Healthy,
        }
    }

    /// Human-readable report.
    ///
    /// ```text
    /// ├─ Pool: 2/2 active, 0 idle, 3 waiting
    /// ├─ Workers: 2/2 active, 1 queued
    /// ├─ Breaker: OPEN (10 failures, opened 1x)
    /// ├─ Rate Limiter: 57/100 consumed
    /// └─ Health: Critical
    /// ```
    pub fn summary(&self) -> String {
        let quota = self
            .rate_limiter
            .quota
            .map_or_else(|| "unlimited".to_string(), |q| q.to_string());
        format!(
            "├─ Pool: {}/{} active, {} idle, {} waiting\n\
             ├─ Workers: {}/{} active, {} queued\n\
             ├─ Breaker: {} ({} failures, opened {}x)\n\
             ├─ Rate Limiter: {}/{} consumed\n\
             └─ Health: {:?}",
            self.pool.active,
            self.pool.max,
            self.pool.idle,
            self.pool.waiting,
            self.workers.active,
            self.workers.max,
            self.workers.queued,
            self.breaker.state,
            self.breaker.failure_count,
            self.breaker.times_opened,
            self.rate_limiter.consumed,
            quota,
            self.health_status(),
        )
    }
}

impl fmt::Display for TierMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Metrics of every tier, keyed by tier name.
///
/// Building one reads each rate-limited tier's key table; see the module
/// docs for what that costs concurrent admissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    tiers: BTreeMap<String, TierMetrics>,
}

impl MetricsSnapshot {
    pub(crate) fn new(tiers: BTreeMap<String, TierMetrics>) -> Self {
        Self { tiers }
    }

    /// Metrics of one tier.
    pub fn tier(&self, name: &str) -> Option<&TierMetrics> {
        self.tiers.get(name)
    }

    /// Tiers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TierMetrics)> {
        self.tiers.iter().map(|(name, metrics)| (name.as_str(), metrics))
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Whether the snapshot holds no tiers.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// The worst health across tiers.
    pub fn health_status(&self) -> HealthStatus {
        self.tiers
            .values()
            .map(TierMetrics::health_status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// JSON object keyed by tier name, as served by a metrics endpoint.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Pretty-printed [`to_json`](Self::to_json).
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report of every tier.
    pub fn summary(&self) -> String {
        let mut out = String::from("Bulkhead Metrics:");
        for (name, metrics) in &self.tiers {
            out.push_str("\n[");
            out.push_str(name);
            out.push_str("]\n");
            out.push_str(&metrics.summary());
        }
        out
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Three-level health indicator.
///
/// ```text
///     Healthy ──────► breaker closed, nobody queueing
///        │
///     Degraded ─────► trial in flight or callers queueing
///        │
///     Critical ─────► breaker open, requests failing fast
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Functional but under pressure or recovering.
    Degraded,
    /// Failing fast.
    Critical,
}

impl HealthStatus {
    /// Whether the status indicates any problem.
    pub fn is_problematic(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Short operator hint.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Watch the tier; consider raising pool capacity",
            Self::Critical => "Check the tier's downstream; requests are being rejected",
        }
    }
}
