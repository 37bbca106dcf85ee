//! # Bulkhead - Per-Tier Request Isolation
//!
//! A multi-tenant isolation engine: every tenant tier gets its own rate
//! limiter, bounded pools and circuit breaker, so exhaustion or downstream
//! failure in one tier cannot slow down or fail requests of another.
//!
//! ## What is a Bulkhead?
//!
//! A ship's hull is split into watertight compartments. A breach floods
//! one compartment, not the ship. Here the compartments are tiers:
//!
//! ```text
//!     ┌──────────── free ────────────┬──────────── pro ─────────────┬───────── enterprise ─────────┐
//!     │ limiter   100/min per key    │ limiter   1000/min per key   │ limiter   unlimited          │
//!     │ workers   [■][■]             │ workers   [■][□][□][□][□]    │ workers   [■][■][□]...[□]    │
//!     │ pool      [■][■]             │ pool      [■][□][□][□][□]    │ pool      [■][□][□]...[□]    │
//!     │ breaker   OPEN               │ breaker   CLOSED             │ breaker   CLOSED             │
//!     └──────────────────────────────┴──────────────────────────────┴──────────────────────────────┘
//!          flooded: fails fast            unaffected                      unaffected
//! ```
//!
//! ## Features
//!
//! - **Admission control** - lock-free fixed-window quota per admission key
//! - **Bounded concurrency** - separate worker and connection budgets per tier
//! - **Failure isolation** - three-state circuit breaker with a single half-open trial
//! - **Classified errors** - every rejection maps to a distinct transport status
//! - **Live metrics** - non-blocking snapshot of every tier, serializable to JSON
//!
//! ## Quick Start
//!
//! ```rust
//! use bulkhead::{operation, BoxError, EngineConfig, Dispatcher, Task};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::from_config(&EngineConfig::default())?;
//!
//! let query = operation(|| async { Ok::<_, BoxError>(vec!["row-1", "row-2"]) });
//! match dispatcher.submit("free", Task::execute(query), "10.0.0.1").await {
//!     Ok(rows) => println!("{} rows", rows.len()),
//!     Err(err) => println!("{} -> {}", err, err.status_code()),
//! }
//!
//! println!("{}", dispatcher.snapshot().to_json()?);
//! # Ok(())
//! # }
//! ```
//!
//! ### Configuration from TOML
//!
//! ```rust
//! use bulkhead::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     [tiers.free]
//!     pool_capacity = 2
//!     worker_capacity = 2
//!     rate_limit = { quota = { points = 100, window_ms = 60000 } }
//!     breaker = { timeout_ms = 3000, error_threshold_percentage = 50, reset_timeout_ms = 10000 }
//!
//!     [tiers.enterprise]
//!     pool_capacity = 10
//!     worker_capacity = 10
//!     rate_limit = "unlimited"
//! "#).unwrap();
//!
//! assert_eq!(config.tiers.len(), 2);
//! ```
//!
//! ## Error Mapping
//!
//! | Error | Status |
//! |-------|--------|
//! | `InvalidTier` | 400 |
//! | `RateLimitExceeded` | 429 |
//! | `CircuitOpen`, `ResourceExhausted` | 503 |
//! | `Timeout`, `Downstream`, `FaultInjected` | 500 |
//!
//! ## Thread Safety
//!
//! All components are `Send + Sync`. No lock is shared between tiers; the
//! registry is read-only after construction.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

// Internal module
mod engine;

// Public re-exports
pub use engine::{
    cpu_relax, operation, Admission, Attempt, BoundedPool, BoxError, BreakerConfig, BreakerError,
    BreakerMetrics, BreakerState, BreakerStats, CircuitBreaker, ConfigError, DispatchError,
    Dispatcher, EngineConfig, ErrorKind, FnOperation, HealthStatus, LimiterStats, MemoryOrdering,
    MetricsSnapshot, Operation, Permit, PoolError, PoolKind, PoolMetrics, PoolStats, QuotaConfig,
    RateLimit, RateLimiter, RateLimiterMetrics, Rejected, ResourcePool, Task, Tier, TierConfig,
    TierMetrics, TierRegistry, WorkerDispatcher, WorkerMetrics, DEFAULT_MAX_TRACKED_KEYS,
    MAX_CAPACITY, MAX_QUOTA_POINTS,
};

/// A registry wrapped in `Arc`, shared by dispatchers and janitors.
pub type SharedRegistry = std::sync::Arc<TierRegistry>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
///
/// ```rust
/// use bulkhead::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for submitting work and reading metrics.
    //!
    //! # Example
    //! ```rust
    //! use bulkhead::prelude::*;
    //!
    //! let config = EngineConfig::default().with_tier("internal", TierConfig::new(4, 4));
    //! let status = HealthStatus::Healthy;
    //! # let _ = (config, status);
    //! ```

    pub use crate::{
        operation, BoxError, BreakerState, DispatchError, Dispatcher, EngineBuilder,
        EngineConfig, ErrorKind, HealthStatus, MetricsSnapshot, Operation, RateLimit,
        SharedRegistry, Task, TierConfig,
    };
}

/// Builder for a [`Dispatcher`] over a validated set of tiers.
///
/// Starts empty; add tiers one by one or start from a whole configuration.
///
/// ```rust
/// use bulkhead::{EngineBuilder, RateLimit, QuotaConfig, TierConfig};
///
/// let dispatcher = EngineBuilder::new()
///     .tier("free", TierConfig::free())
///     .tier(
///         "batch",
///         TierConfig::new(1, 4).with_rate_limit(RateLimit::Quota(QuotaConfig::per_second(5))),
///     )
///     .build()
///     .unwrap();
///
/// assert_eq!(dispatcher.registry().len(), 2);
///
/// // An engine without tiers is rejected.
/// assert!(EngineBuilder::new().build().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Creates a builder with no tiers.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::empty(),
        }
    }

    /// Adds or replaces a tier.
    pub fn tier(mut self, name: impl Into<String>, config: TierConfig) -> Self {
        self.config = self.config.with_tier(name, config);
        self
    }

    /// Replaces every tier with those of `config`.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the tiers and builds the registry and dispatcher.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        Dispatcher::from_config(&self.config)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
