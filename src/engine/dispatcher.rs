//! # Dispatcher
//!
//! The composition root. Runs a task through its tier's components and
//! classifies every rejection.
//!
//! ```text
//!     submit(tier, task, key)
//!       │
//!       ├─ 1. registry lookup ────────────── unknown ──► InvalidTier
//!       ├─ 2. limiter.consume(key) ───────── denied ───► RateLimitExceeded
//!       ├─ 3. breaker.attempt() ──────────── rejected ─► CircuitOpen
//!       │      ┌─────────── bounded by breaker timeout ───────────┐
//!       ├─ 4.  │ workers.acquire ─► resources.acquire             │ ► ResourceExhausted
//!       ├─ 5.  │ task body (or injected fault)                    │ ► Downstream / FaultInjected
//!       ├─ 6.  │ release both permits                             │
//!       │      └──────────────────────────────────────────────────┘ ► Timeout
//!       ├─ 7. outcome reported to the breaker
//!       └─ 8. result or classified error
//! ```
//!
//! Steps 1 and 2 never touch the breaker or the pools. Every failure after
//! step 3 counts against the breaker.
//!
//! When the breaker timeout fires while the attempt is still waiting in
//! step 4, the caller gets `ResourceExhausted` for the pool it was waiting
//! on, not `Timeout`: the attempt never reached the downstream.

use super::breaker::BreakerError;
use super::config::EngineConfig;
use super::error::{ConfigError, DispatchError};
use super::metrics::MetricsSnapshot;
use super::pool::{PoolError, PoolKind};
use super::registry::{Tier, TierRegistry};
use super::task::{Operation, Task};
use super::window::Admission;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for task submission; cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<TierRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher over an existing registry.
    pub fn new(registry: Arc<TierRegistry>) -> Self {
        Self { registry }
    }

    /// Builds the registry from `config` and a dispatcher over it.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(Arc::new(TierRegistry::from_config(config)?)))
    }

    /// The registry this dispatcher runs against.
    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    /// Runs `task` in `tier`, charging one admission point to `admission_key`.
    ///
    /// Suspends only the caller, and only while waiting for pool slots or
    /// the task body. Dropping the returned future cancels the attempt and
    /// releases any permit already held.
    pub async fn submit<O>(
        &self,
        tier: &str,
        task: Task<O>,
        admission_key: &str,
    ) -> Result<O::Output, DispatchError>
    where
        O: Operation,
    {
        let Some(tier) = self.registry.get(tier) else {
            debug!(tier, "rejected unknown tier");
            return Err(DispatchError::InvalidTier {
                tier: tier.to_string(),
            });
        };

        if let Admission::Denied { retry_after } = tier.limiter().try_consume(admission_key) {
            return Err(DispatchError::RateLimitExceeded {
                tier: tier.name().to_string(),
                retry_after,
            });
        }

        let phase = Phase::default();
        let outcome = tier.breaker().call(run(tier, task, &phase)).await;

        outcome.map_err(|err| match err {
            BreakerError::Open => DispatchError::CircuitOpen {
                tier: tier.name().to_string(),
            },
            BreakerError::Timeout(after) => match phase.waiting_on() {
                Some(pool) => {
                    debug!(tier = tier.name(), %pool, ?after, "attempt timed out while acquiring");
                    DispatchError::ResourceExhausted {
                        tier: tier.name().to_string(),
                        pool,
                    }
                }
                None => {
                    debug!(tier = tier.name(), ?after, "attempt timed out");
                    DispatchError::Timeout {
                        tier: tier.name().to_string(),
                        after,
                    }
                }
            },
            BreakerError::Inner(err) => err,
        })
    }

    /// Metrics of every tier.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    /// Closes every tier's pools. Running tasks finish; new attempts fail
    /// with [`DispatchError::ResourceExhausted`].
    pub fn shutdown(&self) {
        for tier in self.registry.iter() {
            tier.workers().close();
            tier.resources().close();
        }
        info!("dispatcher shut down");
    }
}

/// The pool an attempt is waiting on, if any.
#[derive(Debug, Default)]
struct Phase(AtomicU8);

impl Phase {
    const RUNNING: u8 = 0;
    const WORKER: u8 = 1;
    const RESOURCE: u8 = 2;

    fn enter(&self, pool: Option<PoolKind>) {
        let phase = match pool {
            None => Self::RUNNING,
            Some(PoolKind::Worker) => Self::WORKER,
            Some(PoolKind::Resource) => Self::RESOURCE,
        };
        self.0.store(phase, Ordering::Relaxed);
    }

    fn waiting_on(&self) -> Option<PoolKind> {
        match self.0.load(Ordering::Relaxed) {
            Self::WORKER => Some(PoolKind::Worker),
            Self::RESOURCE => Some(PoolKind::Resource),
            _ => None,
        }
    }
}

/// Steps 4 to 6: acquire both budgets, run the body, release.
async fn run<O>(tier: &Tier, task: Task<O>, phase: &Phase) -> Result<O::Output, DispatchError>
where
    O: Operation,
{
    let timeout = tier.config().acquire_timeout();
    let exhausted = move |pool: PoolKind| {
        move |err: PoolError| {
            debug!(tier = tier.name(), %pool, %err, "acquire failed");
            DispatchError::ResourceExhausted {
                tier: tier.name().to_string(),
                pool,
            }
        }
    };

    phase.enter(Some(tier.workers().kind()));
    let worker = tier
        .workers()
        .acquire(timeout)
        .await
        .map_err(exhausted(tier.workers().kind()))?;
    phase.enter(Some(tier.resources().kind()));
    let connection = tier
        .resources()
        .acquire(timeout)
        .await
        .map_err(exhausted(tier.resources().kind()))?;
    phase.enter(None);

    let result = match task {
        Task::Execute(operation) => {
            operation
                .execute()
                .await
                .map_err(|source| DispatchError::Downstream {
                    tier: tier.name().to_string(),
                    source,
                })
        }
        Task::InjectFault => Err(DispatchError::FaultInjected {
            tier: tier.name().to_string(),
        }),
    };

    connection.release();
    worker.release();
    result
}
