//! # Engine Configuration
//!
//! Configuration structures for every per-tier component. Think of this as
//! the settings panel of the bulkhead: one [`TierConfig`] per compartment,
//! collected in an [`EngineConfig`].
//!
//! ```text
//!     EngineConfig
//!     └─ tiers
//!        ├─ "free"        TierConfig
//!        │  ├─ pool_capacity ........ downstream connection budget
//!        │  ├─ worker_capacity ...... compute concurrency budget
//!        │  ├─ rate_limit ........... Quota { points, window_ms } | Unlimited
//!        │  └─ breaker .............. timeout, error %, reset, window
//!        ├─ "pro"         TierConfig
//!        └─ "enterprise"  TierConfig
//! ```
//!
//! Configurations can be built in code (presets plus `with_*` helpers) or
//! parsed from TOML:
//!
//! ```toml
//! [tiers.free]
//! pool_capacity = 2
//! worker_capacity = 2
//! rate_limit = { quota = { points = 100, window_ms = 60000 } }
//! breaker = { timeout_ms = 3000, error_threshold_percentage = 50, reset_timeout_ms = 10000 }
//!
//! [tiers.enterprise]
//! pool_capacity = 10
//! worker_capacity = 10
//! rate_limit = "unlimited"
//! ```

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Largest quota a fixed window can count.
///
/// The window start and the consumed points share one `AtomicU64`; the
/// low 24 bits hold the count.
pub const MAX_QUOTA_POINTS: u64 = (1 << 24) - 1;

/// Largest pool or worker capacity a tier may configure.
///
/// Both budgets are backed by a `tokio::sync::Semaphore`, which cannot
/// hold more permits than this.
pub const MAX_CAPACITY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Default bound on distinct admission keys tracked per tier.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Memory ordering strategy for the rate limiter's atomic counters.
///
/// ```text
///     Relaxed ──────► Fast but minimal guarantees
///        │
///     AcquireRelease ► Balanced (default)
///        │
///     Sequential ───► Slow but strongest guarantees
/// ```
///
/// Quota enforcement is exact under every ordering because each decision
/// is a single compare-and-swap; the ordering only affects how soon other
/// threads observe counters for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOrdering {
    /// Fastest, minimal cross-thread visibility guarantees.
    Relaxed,
    /// Acquire on loads, release on stores (default).
    #[default]
    AcquireRelease,
    /// Sequential consistency.
    Sequential,
}

impl MemoryOrdering {
    #[inline(always)]
    pub(crate) fn load(&self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::AcquireRelease => Ordering::Acquire,
            Self::Sequential => Ordering::SeqCst,
        }
    }

    #[inline(always)]
    pub(crate) fn rmw(&self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::AcquireRelease => Ordering::AcqRel,
            Self::Sequential => Ordering::SeqCst,
        }
    }

    #[inline(always)]
    pub(crate) fn cas_failure(&self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::AcquireRelease => Ordering::Acquire,
            Self::Sequential => Ordering::SeqCst,
        }
    }
}

/// Fixed-window quota: `points` per `window_ms`, per admission key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Points admitted per window and key.
    pub points: u64,

    /// Window length in milliseconds.
    pub window_ms: u64,

    /// Bound on distinct keys tracked at once for the tier.
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,

    /// Ordering used by the window counters.
    #[serde(default)]
    pub ordering: MemoryOrdering,
}

fn default_max_tracked_keys() -> usize {
    DEFAULT_MAX_TRACKED_KEYS
}

impl QuotaConfig {
    /// Creates a quota of `points` per `window_ms`.
    pub fn new(points: u64, window_ms: u64) -> Self {
        Self {
            points,
            window_ms,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            ordering: MemoryOrdering::default(),
        }
    }

    /// `points` per second.
    pub fn per_second(points: u64) -> Self {
        Self::new(points, 1_000)
    }

    /// `points` per minute.
    pub fn per_minute(points: u64) -> Self {
        Self::new(points, 60_000)
    }

    /// Sets the tracked-key bound.
    pub fn with_max_tracked_keys(mut self, keys: usize) -> Self {
        self.max_tracked_keys = keys;
        self
    }

    /// Sets the memory ordering.
    pub fn with_ordering(mut self, ordering: MemoryOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Checks the quota for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.points == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.points",
                "must be greater than zero (use `unlimited` to disable limiting)",
            ));
        }
        if self.points > MAX_QUOTA_POINTS {
            return Err(ConfigError::invalid(
                "rate_limit.points",
                "exceeds the maximum of 16777215",
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.window_ms",
                "must be greater than zero",
            ));
        }
        if self.max_tracked_keys == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.max_tracked_keys",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Admission policy of a tier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimit {
    /// Every request is admitted and no counter is kept.
    #[default]
    Unlimited,
    /// Fixed-window quota per admission key.
    Quota(QuotaConfig),
}

impl RateLimit {
    /// The quota, if the tier is limited.
    pub fn quota(&self) -> Option<&QuotaConfig> {
        match self {
            Self::Unlimited => None,
            Self::Quota(quota) => Some(quota),
        }
    }

    /// Checks the policy for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Unlimited => Ok(()),
            Self::Quota(quota) => quota.validate(),
        }
    }
}

/// Circuit breaker thresholds.
///
/// The failure ratio is evaluated over the last `window_size` attempts and
/// only once at least `minimum_requests` attempts are in the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Upper bound on one attempt (acquire + task body), in milliseconds.
    pub timeout_ms: u64,

    /// Failure percentage (1..=100) at which the breaker opens.
    pub error_threshold_percentage: u8,

    /// Time spent OPEN before a trial is allowed, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Number of recent attempts the failure ratio is computed over.
    pub window_size: usize,

    /// Minimum attempts in the window before the ratio is evaluated.
    pub minimum_requests: usize,
}

impl Default for BreakerConfig {
    /// 3s timeout, 50% threshold, 10s reset, last 20 attempts, 10 minimum.
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            error_threshold_percentage: 50,
            reset_timeout_ms: 10_000,
            window_size: 20,
            minimum_requests: 10,
        }
    }
}

impl BreakerConfig {
    /// Creates a breaker configuration with the default window.
    pub fn new(timeout_ms: u64, error_threshold_percentage: u8, reset_timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            error_threshold_percentage,
            reset_timeout_ms,
            ..Self::default()
        }
    }

    /// Sets the rolling window size and minimum volume.
    pub fn with_window(mut self, window_size: usize, minimum_requests: usize) -> Self {
        self.window_size = window_size;
        self.minimum_requests = minimum_requests;
        self
    }

    /// Attempt timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reset timeout as a `Duration`.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Checks the thresholds for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("breaker.timeout_ms", "must be greater than zero"));
        }
        if !(1..=100).contains(&self.error_threshold_percentage) {
            return Err(ConfigError::invalid(
                "breaker.error_threshold_percentage",
                "must be between 1 and 100",
            ));
        }
        if self.window_size == 0 {
            return Err(ConfigError::invalid("breaker.window_size", "must be greater than zero"));
        }
        if self.minimum_requests == 0 || self.minimum_requests > self.window_size {
            return Err(ConfigError::invalid(
                "breaker.minimum_requests",
                "must be between 1 and window_size",
            ));
        }
        Ok(())
    }
}

/// Everything one tier owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Resource pool capacity (downstream connections).
    pub pool_capacity: usize,

    /// Worker dispatcher capacity (concurrent task bodies).
    pub worker_capacity: usize,

    /// How long `acquire` may wait; defaults to the breaker timeout.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// Admission policy.
    #[serde(default)]
    pub rate_limit: RateLimit,

    /// Breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self::free()
    }
}

impl TierConfig {
    /// Creates a tier with the given capacities, no rate limit and default breaker.
    pub fn new(pool_capacity: usize, worker_capacity: usize) -> Self {
        Self {
            pool_capacity,
            worker_capacity,
            acquire_timeout_ms: None,
            rate_limit: RateLimit::Unlimited,
            breaker: BreakerConfig::default(),
        }
    }

    /// Small budgets and a per-minute quota.
    pub fn free() -> Self {
        Self::new(2, 2)
            .with_rate_limit(RateLimit::Quota(QuotaConfig::per_minute(100)))
            .with_breaker(BreakerConfig::new(3_000, 50, 10_000))
    }

    /// Medium budgets and a larger quota.
    pub fn pro() -> Self {
        Self::new(5, 5)
            .with_rate_limit(RateLimit::Quota(QuotaConfig::per_minute(1_000)))
            .with_breaker(BreakerConfig::new(5_000, 50, 10_000))
    }

    /// Large budgets, unlimited admission.
    pub fn enterprise() -> Self {
        Self::new(10, 10)
            .with_rate_limit(RateLimit::Unlimited)
            .with_breaker(BreakerConfig::new(10_000, 50, 5_000))
    }

    /// Sets the admission policy.
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the breaker thresholds.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets an explicit acquire timeout.
    pub fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    /// Effective acquire timeout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms.unwrap_or(self.breaker.timeout_ms))
    }

    /// Checks every field of the tier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::invalid("pool_capacity", "must be greater than zero"));
        }
        if self.worker_capacity == 0 {
            return Err(ConfigError::invalid("worker_capacity", "must be greater than zero"));
        }
        if self.pool_capacity > MAX_CAPACITY {
            return Err(ConfigError::invalid("pool_capacity", "exceeds the semaphore permit limit"));
        }
        if self.worker_capacity > MAX_CAPACITY {
            return Err(ConfigError::invalid("worker_capacity", "exceeds the semaphore permit limit"));
        }
        if self.acquire_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "acquire_timeout_ms",
                "must be greater than zero",
            ));
        }
        self.rate_limit.validate()?;
        self.breaker.validate()
    }
}

/// The full tier table consumed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tier name to configuration.
    pub tiers: BTreeMap<String, TierConfig>,
}

impl Default for EngineConfig {
    /// The `free`, `pro` and `enterprise` presets.
    fn default() -> Self {
        Self::empty()
            .with_tier("free", TierConfig::free())
            .with_tier("pro", TierConfig::pro())
            .with_tier("enterprise", TierConfig::enterprise())
    }
}

impl EngineConfig {
    /// A configuration with no tiers (invalid until one is added).
    pub fn empty() -> Self {
        Self {
            tiers: BTreeMap::new(),
        }
    }

    /// Adds or replaces a tier.
    pub fn with_tier(mut self, name: impl Into<String>, config: TierConfig) -> Self {
        self.tiers.insert(name.into(), config);
        self
    }

    /// Parses a TOML document with one `[tiers.<name>]` table per tier and validates it.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the tier set and every tier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        for (name, tier) in &self.tiers {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyTierName);
            }
            tier.validate().map_err(|err| err.in_tier(name))?;
        }
        Ok(())
    }
}
