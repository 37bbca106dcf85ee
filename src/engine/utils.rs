//! # Utilities (utils.rs)
//!
//! Low-level helpers shared by the per-tier components: a monotonic clock,
//! spin-loop relaxation for CAS retries, and a cache-line wrapper for hot
//! atomics.
//!
//! ## Time Base
//!
//! ```text
//!     Clock (one per component instance)
//!
//!     origin ─────────────────────────────► now
//!       │◄──────────── now_ms() ───────────►│
//!
//!     Every timestamp a component stores is an offset from its own
//!     origin, so a u64 of milliseconds never wraps in practice.
//! ```
//!
//! The clock reads `tokio::time::Instant`, which follows the runtime's
//! paused clock in tests and falls back to the system monotonic clock
//! everywhere else (including plain threads with no runtime).

use std::time::Duration;
use tokio::time::Instant;

/// Cache line size for x86_64 processors.
#[cfg(target_arch = "x86_64")]
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Cache line size for ARM64 processors.
#[cfg(target_arch = "aarch64")]
pub(crate) const CACHE_LINE_SIZE: usize = 128;

/// Default cache line size for other architectures.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Monotonic millisecond clock anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    /// Starts a new clock at the current instant.
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    #[inline]
    pub(crate) fn now_ms(&self) -> u64 {
        duration_ms(self.origin.elapsed())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Converts a duration to whole nanoseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// CPU relaxation hint for spin loops.
///
/// Emits PAUSE on x86_64 and YIELD on ARM64 through the portable
/// `spin_loop` intrinsic.
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Cache-aligned wrapper that keeps a hot atomic on its own cache line.
///
/// ```text
///     Without alignment:              With alignment:
///     ┌────────────┬────────────┐     ┌─────────────────────────┐
///     │ counter A  │ counter B  │     │ counter A               │
///     └────────────┴────────────┘     └─────────────────────────┘
///     one line, both invalidated      ┌─────────────────────────┐
///                                     │ counter B               │
///                                     └─────────────────────────┘
/// ```
#[cfg_attr(target_arch = "aarch64", repr(C, align(128)))]
#[cfg_attr(not(target_arch = "aarch64"), repr(C, align(64)))]
pub(crate) struct CacheAligned<T> {
    pub(crate) value: T,
}

const _: () = assert!(std::mem::align_of::<CacheAligned<u64>>() >= CACHE_LINE_SIZE);

impl<T> CacheAligned<T> {
    /// Creates a new cache-aligned value.
    #[inline(always)]
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

/// Exponential backoff for contended CAS loops.
///
/// ```text
///     Step 0..=3: spin 1, 2, 4, 8 times
///     Step 4+:    yield to the OS scheduler
/// ```
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    step: u32,
    max_step: u32,
}

impl Backoff {
    /// Creates a backoff that stops growing after `max_step` steps.
    pub(crate) fn new(max_step: u32) -> Self {
        Self { step: 0, max_step }
    }

    /// Waits a little longer than the previous call did.
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step < 4 {
            for _ in 0..(1u32 << self.step) {
                cpu_relax();
            }
        } else {
            std::thread::yield_now();
        }
        self.step = (self.step + 1).min(self.max_step);
    }
}
