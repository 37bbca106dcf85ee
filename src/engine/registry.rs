//! # Tier Registry
//!
//! The table of isolation compartments. Built once from an
//! [`EngineConfig`] and never changed structurally afterwards, so lookups
//! take no lock.
//!
//! ```text
//!     TierRegistry
//!     ├─ "free" ──────► Tier { limiter, resources, workers, breaker }
//!     ├─ "pro" ───────► Tier { limiter, resources, workers, breaker }
//!     └─ "enterprise" ► Tier { limiter, resources, workers, breaker }
//! ```
//!
//! Every tier owns its own instance of every component; nothing is shared
//! between tiers.

use super::breaker::CircuitBreaker;
use super::config::{EngineConfig, TierConfig};
use super::error::ConfigError;
use super::limiter::{spawn_janitor, RateLimiter};
use super::metrics::{MetricsSnapshot, TierMetrics};
use super::pool::{BoundedPool, PoolKind, ResourcePool, WorkerDispatcher};
use std::collections::{BTreeMap, HashMap};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::info;

/// One isolation compartment.
#[derive(Debug)]
pub struct Tier {
    name: Arc<str>,
    config: TierConfig,
    limiter: RateLimiter,
    resources: ResourcePool,
    workers: WorkerDispatcher,
    breaker: CircuitBreaker,
}

impl Tier {
    /// Builds every component of a tier from its configuration.
    pub fn new(name: impl Into<Arc<str>>, config: TierConfig) -> Self {
        let name = name.into();
        Self {
            limiter: RateLimiter::new(name.clone(), &config.rate_limit),
            resources: BoundedPool::new(PoolKind::Resource, name.clone(), config.pool_capacity),
            workers: BoundedPool::new(PoolKind::Worker, name.clone(), config.worker_capacity),
            breaker: CircuitBreaker::new(name.clone(), config.breaker.clone()),
            name,
            config,
        }
    }

    /// Tier identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration the tier was built from.
    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Admission control.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Downstream connection budget.
    pub fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    /// Task-body concurrency budget.
    pub fn workers(&self) -> &WorkerDispatcher {
        &self.workers
    }

    /// Failure isolation.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current metrics of this tier.
    pub fn metrics(&self) -> TierMetrics {
        TierMetrics::from_stats(
            &self.resources.stats(),
            &self.workers.stats(),
            &self.breaker.stats(),
            &self.limiter.stats(),
        )
    }
}

/// Process-wide tier table.
#[derive(Debug)]
pub struct TierRegistry {
    tiers: HashMap<Arc<str>, Tier, ahash::RandomState>,
}

impl TierRegistry {
    /// Validates `config` and builds one [`Tier`] per entry.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut tiers = HashMap::with_capacity_and_hasher(config.tiers.len(), ahash::RandomState::new());
        for (name, tier_config) in &config.tiers {
            let name: Arc<str> = Arc::from(name.as_str());
            tiers.insert(name.clone(), Tier::new(name, tier_config.clone()));
        }

        info!(tiers = ?config.tiers.keys().collect::<Vec<_>>(), "tier registry built");
        Ok(Self { tiers })
    }

    /// Looks a tier up by identifier.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.get(name)
    }

    /// Whether `name` is a configured tier.
    pub fn contains(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    /// All tiers, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }

    /// Tier identifiers, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tiers.keys().map(|name| &**name).collect();
        names.sort_unstable();
        names
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Whether the registry holds no tiers.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Metrics of every tier.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tiers: BTreeMap<String, TierMetrics> = self
            .tiers
            .iter()
            .map(|(name, tier)| (name.to_string(), tier.metrics()))
            .collect();
        MetricsSnapshot::new(tiers)
    }

    /// Purges expired admission keys of every tier. Returns the total removed.
    pub fn purge_expired(&self) -> usize {
        self.iter().map(|tier| tier.limiter.purge_expired()).sum()
    }

    /// Starts a stoppable thread running [`purge_expired`](Self::purge_expired)
    /// every `interval`.
    pub fn start_janitor(
        self: Arc<Self>,
        interval: Duration,
    ) -> std::io::Result<(thread::JoinHandle<()>, mpsc::Sender<()>)> {
        spawn_janitor("bulkhead-janitor".to_string(), interval, move || {
            self.purge_expired();
        })
    }
}
