//! # Circuit Breaker
//!
//! Failure isolation for one tier. Once the tier's failure ratio crosses
//! the configured threshold the breaker fails fast, so a broken downstream
//! stops consuming the tier's pools.
//!
//! ## State Machine
//!
//! ```text
//!                 failure % ≥ threshold
//!                 (≥ minimum_requests)
//!     ┌────────┐ ─────────────────────► ┌────────┐
//!     │ CLOSED │                        │  OPEN  │ ◄─┐
//!     └────────┘ ◄──────┐               └────────┘   │
//!                       │                    │       │ trial fails
//!          trial        │   reset_timeout    │       │ (or is abandoned)
//!          succeeds     │   elapsed, first   ▼       │
//!                       │   caller wins  ┌───────────┴┐
//!                       └─────────────── │ HALF_OPEN  │
//!                                        └────────────┘
//!                                     one trial in flight,
//!                                     everyone else rejected
//! ```
//!
//! ## Rolling Window
//!
//! Outcomes are kept for the last `window_size` attempts. The ratio
//! `failures / attempts` is only evaluated once `minimum_requests`
//! attempts are in the window. The window is cleared on every transition,
//! so a freshly closed breaker starts from a clean slate.
//!
//! ## Concurrency
//!
//! The state lives in an `AtomicU8` and is read without locking on every
//! attempt. Recording an outcome takes a per-breaker `parking_lot` mutex
//! over the window; no lock is shared between tiers.

use super::config::BreakerConfig;
use super::utils::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Current state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum BreakerState {
    /// Attempts run and their outcomes are recorded.
    Closed = 0,
    /// Attempts are rejected until the reset timeout elapses.
    Open = 1,
    /// A single trial is in flight.
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Open,
            _ => Self::HalfOpen,
        }
    }

    /// Upper-case name as exposed in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by [`CircuitBreaker::attempt`] when execution is not permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker rejected the attempt")]
pub struct Rejected;

/// Failure of [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit open")]
    Open,
    /// The call did not finish within the breaker timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Recent-N outcome window.
#[derive(Debug)]
struct RollingWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    capacity: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity,
        }
    }

    fn push(&mut self, failed: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }

    /// Whether `failures / attempts ≥ threshold%` with enough volume.
    fn should_trip(&self, minimum_requests: usize, threshold_pct: u8) -> bool {
        let attempts = self.len();
        attempts >= minimum_requests
            && self.failures * 100 >= usize::from(threshold_pct) * attempts
    }
}

/// Point-in-time statistics of a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    /// Current state.
    pub state: BreakerState,
    /// Failures in the rolling window.
    pub failure_count: usize,
    /// Attempts in the rolling window.
    pub window_len: usize,
    /// Successful attempts since startup.
    pub total_successes: u64,
    /// Failed attempts since startup.
    pub total_failures: u64,
    /// Attempts rejected since startup.
    pub total_rejections: u64,
    /// Transitions into OPEN since startup.
    pub times_opened: u64,
}

/// Per-tier circuit breaker.
pub struct CircuitBreaker {
    tier: Arc<str>,
    config: BreakerConfig,
    clock: Clock,

    state: AtomicU8,
    opened_at_ms: AtomicU64,
    window: Mutex<RollingWindow>,

    failure_count: AtomicUsize,
    window_len: AtomicUsize,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(tier: impl Into<Arc<str>>, config: BreakerConfig) -> Self {
        let window = Mutex::new(RollingWindow::new(config.window_size));
        Self {
            tier: tier.into(),
            config,
            clock: Clock::new(),
            state: AtomicU8::new(BreakerState::Closed as u8),
            opened_at_ms: AtomicU64::new(0),
            window,
            failure_count: AtomicUsize::new(0),
            window_len: AtomicUsize::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The configured thresholds.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Asks to run one execution attempt.
    ///
    /// Never blocks. In OPEN, the first caller after the reset timeout
    /// becomes the HALF_OPEN trial; everybody else is rejected until the
    /// trial resolves.
    pub fn attempt(&self) -> Result<Attempt<'_>, Rejected> {
        match self.state() {
            BreakerState::Closed => Ok(Attempt::new(self, false)),
            BreakerState::HalfOpen => Err(self.reject()),
            BreakerState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                if self.clock.now_ms().saturating_sub(opened_at) < self.config.reset_timeout_ms {
                    return Err(self.reject());
                }
                match self.state.compare_exchange(
                    BreakerState::Open as u8,
                    BreakerState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        info!(tier = %self.tier, "circuit breaker half-open, admitting trial");
                        Ok(Attempt::new(self, true))
                    }
                    Err(_) => Err(self.reject()),
                }
            }
        }
    }

    fn reject(&self) -> Rejected {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        Rejected
    }

    /// Runs `operation` as one attempt bounded by the breaker timeout.
    ///
    /// Errors and timeouts count as failures. Dropping the returned future
    /// abandons the attempt.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let attempt = self.attempt().map_err(|_| BreakerError::Open)?;
        let timeout = self.config.timeout();

        match tokio::time::timeout(timeout, operation).await {
            Ok(Ok(value)) => {
                attempt.succeed();
                Ok(value)
            }
            Ok(Err(err)) => {
                attempt.fail();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                attempt.fail();
                Err(BreakerError::Timeout(timeout))
            }
        }
    }

    fn record(&self, probe: bool, failed: bool) {
        if failed {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        }

        let mut window = self.window.lock();

        if probe {
            if failed {
                self.open(&mut window, BreakerState::HalfOpen);
            } else {
                window.clear();
                self.state.store(BreakerState::Closed as u8, Ordering::Release);
                info!(tier = %self.tier, "circuit breaker closed after successful trial");
            }
        } else if self.state() == BreakerState::Closed {
            // Outcomes of attempts that started before a trip are dropped.
            window.push(failed);
            if failed
                && window.should_trip(
                    self.config.minimum_requests,
                    self.config.error_threshold_percentage,
                )
            {
                self.open(&mut window, BreakerState::Closed);
            }
        }

        self.failure_count.store(window.failures, Ordering::Release);
        self.window_len.store(window.len(), Ordering::Release);
    }

    /// Transitions into OPEN; caller holds the window lock.
    fn open(&self, window: &mut RollingWindow, from: BreakerState) {
        warn!(
            tier = %self.tier,
            from = from.as_str(),
            failures = window.failures,
            attempts = window.len(),
            "circuit breaker opened"
        );
        window.clear();
        self.opened_at_ms.store(self.clock.now_ms(), Ordering::Release);
        self.state.store(BreakerState::Open as u8, Ordering::Release);
        self.times_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// A trial dropped without an outcome.
    fn abandon_probe(&self) {
        let mut window = self.window.lock();
        warn!(tier = %self.tier, "half-open trial abandoned");
        self.open(&mut window, BreakerState::HalfOpen);
        self.failure_count.store(0, Ordering::Release);
        self.window_len.store(0, Ordering::Release);
    }

    /// Failures in the rolling window.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Statistics snapshot; reads atomics only.
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            failure_count: self.failure_count(),
            window_len: self.window_len.load(Ordering::Acquire),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("tier", &self.tier)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

/// Permission to run one execution attempt.
///
/// Resolve it with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping an unresolved trial re-opens the breaker; dropping any other
/// unresolved attempt records nothing.
#[must_use = "an attempt must be resolved with succeed() or fail()"]
pub struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> Attempt<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    /// Whether this is the HALF_OPEN trial.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records a success.
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record(self.probe, false);
    }

    /// Records a failure.
    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record(self.probe, true);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.probe && !self.resolved {
            self.breaker.abandon_probe();
        }
    }
}

impl fmt::Debug for Attempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attempt")
            .field("probe", &self.probe)
            .field("resolved", &self.resolved)
            .finish()
    }
}
