//! # Engine Module
//!
//! Internal implementation of the bulkhead. Each submodule owns one
//! concern; `lib.rs` re-exports the public surface.
//!
//! ## Module Structure
//!
//! ```text
//!     engine/
//!     ├── mod.rs          (module organization)
//!     ├── config.rs       (tier configuration, presets, TOML)
//!     ├── window.rs       (lock-free fixed-window counter)
//!     ├── limiter.rs      (per-tier keyed rate limiter)
//!     ├── pool.rs         (bounded pools and permits)
//!     ├── breaker.rs      (circuit breaker state machine)
//!     ├── task.rs         (operations and tasks)
//!     ├── registry.rs     (tier table)
//!     ├── dispatcher.rs   (submit path)
//!     ├── metrics.rs      (snapshot and health)
//!     ├── error.rs        (error taxonomy)
//!     └── utils.rs        (clock, cache alignment, backoff)
//! ```
//!
//! ## Submit Flow
//!
//! ```text
//!     Dispatcher::submit
//!          │
//!          ▼
//!     ┌──────────────┐
//!     │ TierRegistry │ ◄── lookup, no lock
//!     └──────┬───────┘
//!            ▼
//!     ┌──────────────┐
//!     │ RateLimiter  │ ◄── FixedWindow per admission key
//!     └──────┬───────┘
//!            ▼
//!     ┌──────────────┐
//!     │CircuitBreaker│ ◄── attempt + timeout
//!     └──────┬───────┘
//!            ▼
//!     ┌──────────────┐
//!     │ BoundedPool  │ ◄── workers, then resources
//!     └──────┬───────┘
//!            ▼
//!        task body
//! ```

mod breaker;
mod config;
mod dispatcher;
mod error;
mod limiter;
mod metrics;
mod pool;
mod registry;
mod task;
mod utils;
mod window;

pub use breaker::{Attempt, BreakerError, BreakerState, BreakerStats, CircuitBreaker, Rejected};
pub use config::{
    BreakerConfig, EngineConfig, MemoryOrdering, QuotaConfig, RateLimit, TierConfig,
    DEFAULT_MAX_TRACKED_KEYS, MAX_CAPACITY, MAX_QUOTA_POINTS,
};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DispatchError, ErrorKind};
pub use limiter::{LimiterStats, RateLimiter};
pub use metrics::{
    BreakerMetrics, HealthStatus, MetricsSnapshot, PoolMetrics, RateLimiterMetrics, TierMetrics,
    WorkerMetrics,
};
pub use pool::{
    BoundedPool, Permit, PoolError, PoolKind, PoolStats, ResourcePool, WorkerDispatcher,
};
pub use registry::{Tier, TierRegistry};
pub use task::{operation, BoxError, FnOperation, Operation, Task};
pub use utils::cpu_relax;
pub use window::Admission;
