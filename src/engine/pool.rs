//! # Bounded Pools
//!
//! A counting semaphore with observability. Each tier owns two of them:
//!
//! ```text
//!     ┌──────────── tier "free" ────────────┐
//!     │                                     │
//!     │  WorkerDispatcher   max = 2         │   compute budget
//!     │  [■][■]  waiting: 3                 │
//!     │                                     │
//!     │  ResourcePool       max = 2         │   downstream connections
//!     │  [■][□]  waiting: 0                 │
//!     │                                     │
//!     └─────────────────────────────────────┘
//! ```
//!
//! ## Permit Lifecycle
//!
//! ```text
//!     acquire(timeout) ──► Permit ──► release() / drop
//!          │                              │
//!          │ active += 1                  │ active -= 1
//!          ▼                              ▼
//!     TimedOut / Closed            slot handed to next waiter
//! ```
//!
//! A [`Permit`] releases its slot exactly once, either through
//! [`Permit::release`] or when it is dropped, so failure and cancellation
//! paths cannot leak capacity. A waiter whose future is dropped stops
//! counting as waiting.

use super::utils::{duration_ns, CacheAligned};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Which budget a pool guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Downstream connection budget.
    Resource,
    /// Task-body concurrency budget.
    Worker,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource => f.write_str("resource pool"),
            Self::Worker => f.write_str("worker dispatcher"),
        }
    }
}

/// Why [`BoundedPool::acquire`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No slot became free in time.
    #[error("no slot became available within {0:?}")]
    TimedOut(Duration),
    /// The pool was closed.
    #[error("pool is closed")]
    Closed,
}

/// Bounded concurrency guard for one tier.
pub struct BoundedPool {
    kind: PoolKind,
    tier: Arc<str>,
    max: usize,
    semaphore: Semaphore,

    active: CacheAligned<AtomicUsize>,
    waiting: CacheAligned<AtomicUsize>,

    total_acquired: AtomicU64,
    total_timeouts: AtomicU64,
    peak_active: AtomicUsize,
    max_wait_ns: AtomicU64,
}

/// Downstream connection budget of a tier.
pub type ResourcePool = BoundedPool;

/// Task-body concurrency budget of a tier.
pub type WorkerDispatcher = BoundedPool;

/// Point-in-time statistics of a [`BoundedPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Which budget the pool guards.
    pub kind: PoolKind,
    /// Configured capacity.
    pub max: usize,
    /// Slots currently held.
    pub active: usize,
    /// Callers parked in `acquire`.
    pub waiting: usize,
    /// Successful acquisitions since startup.
    pub total_acquired: u64,
    /// Acquisitions that timed out since startup.
    pub total_timeouts: u64,
    /// Highest `active` observed.
    pub peak_active: usize,
    /// Longest successful wait observed.
    pub max_wait: Duration,
}

impl PoolStats {
    /// Free slots.
    pub fn idle(&self) -> usize {
        self.max.saturating_sub(self.active)
    }

    /// Fraction of capacity in use (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.active as f64 / self.max as f64
    }

    /// Whether every slot is taken.
    pub fn is_saturated(&self) -> bool {
        self.active >= self.max
    }
}

impl BoundedPool {
    /// Creates a pool with `max` slots.
    pub fn new(kind: PoolKind, tier: impl Into<Arc<str>>, max: usize) -> Self {
        Self {
            kind,
            tier: tier.into(),
            max,
            semaphore: Semaphore::new(max),
            active: CacheAligned::new(AtomicUsize::new(0)),
            waiting: CacheAligned::new(AtomicUsize::new(0)),
            total_acquired: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            peak_active: AtomicUsize::new(0),
            max_wait_ns: AtomicU64::new(0),
        }
    }

    /// Which budget this pool guards.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Configured capacity.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.active.value.load(Ordering::Acquire)
    }

    /// Callers currently parked in [`acquire`](Self::acquire).
    pub fn waiting(&self) -> usize {
        self.waiting.value.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for a free slot.
    ///
    /// Only the calling task is suspended. Dropping the returned future
    /// cancels the wait.
    pub async fn acquire(&self, timeout: Duration) -> Result<Permit<'_>, PoolError> {
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => self.wait(timeout).await?,
        };
        Ok(self.admit(permit))
    }

    async fn wait(&self, timeout: Duration) -> Result<SemaphorePermit<'_>, PoolError> {
        let started = Instant::now();
        let _waiting = WaitingGuard::enter(&self.waiting.value);

        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                let waited = duration_ns(started.elapsed());
                self.max_wait_ns.fetch_max(waited, Ordering::Relaxed);
                Ok(permit)
            }
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(tier = %self.tier, pool = %self.kind, ?timeout, "acquire timed out");
                Err(PoolError::TimedOut(timeout))
            }
        }
    }

    fn admit<'a>(&'a self, permit: SemaphorePermit<'a>) -> Permit<'a> {
        let active = self.active.value.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(active, Ordering::Relaxed);
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        Permit {
            pool: self,
            _slot: permit,
        }
    }

    /// Closes the pool: parked and future callers get [`PoolError::Closed`].
    ///
    /// Permits already handed out stay valid until released.
    pub fn close(&self) {
        if !self.semaphore.is_closed() {
            self.semaphore.close();
            info!(tier = %self.tier, pool = %self.kind, "pool closed");
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Statistics snapshot; reads atomics only.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            kind: self.kind,
            max: self.max,
            active: self.active(),
            waiting: self.waiting(),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            max_wait: Duration::from_nanos(self.max_wait_ns.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("kind", &self.kind)
            .field("tier", &self.tier)
            .field("max", &self.max)
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// A held slot of a [`BoundedPool`].
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit<'a> {
    pool: &'a BoundedPool,
    _slot: SemaphorePermit<'a>,
}

impl Permit<'_> {
    /// Returns the slot to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Which pool the slot belongs to.
    pub fn kind(&self) -> PoolKind {
        self.pool.kind
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        // Runs before `_slot` is dropped, so `active` falls before the
        // semaphore lets the next waiter in.
        self.pool.active.value.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").field("kind", &self.pool.kind).finish()
    }
}

/// Counts a caller as waiting for as long as it is alive.
struct WaitingGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaitingGuard<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::AcqRel);
        Self { waiting }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}
