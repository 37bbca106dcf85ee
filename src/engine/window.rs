//! # Fixed-Window Counter
//!
//! The admission primitive behind every rate-limited tier: a lock-free
//! fixed-window point counter for a single admission key.
//!
//! ## The Fixed Window Algorithm
//!
//! ```text
//!     quota = 5 points, window = 1000ms
//!
//!     t=0     consume ─► window opens at 0     [■□□□□] allowed
//!     t=200   consume ─►                       [■■□□□] allowed
//!     t=300   consume(3)►                      [■■■■■] allowed
//!     t=400   consume ─►                       [■■■■■] denied, retry in 600ms
//!     t=1000  window expired
//!     t=1450  consume ─► window opens at 1450  [■□□□□] allowed
//! ```
//!
//! A window starts on the first consumption after the previous window
//! expired, not on a wall-clock boundary.
//!
//! ## Lock-Free Design
//!
//! Window start and consumed points live in one `AtomicU64`, so a rollover
//! and the first consumption of the new window happen in the same
//! compare-and-swap:
//!
//! ```text
//!     63                          24 23                 0
//!     ┌─────────────────────────────┬───────────────────┐
//!     │ window start + 1 (ms)       │ consumed points   │
//!     └─────────────────────────────┴───────────────────┘
//!       0 = no window opened yet
//! ```
//!
//! The CAS loop has no retry bound. A failed CAS means another caller made
//! progress, so the loop always terminates.

use super::config::{MemoryOrdering, QuotaConfig};
use super::utils::{Backoff, CacheAligned};
use std::sync::atomic::AtomicU64;
use std::time::Duration;

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const START_MASK: u64 = (1 << (64 - COUNT_BITS)) - 1;

/// Ceiling for the CAS backoff; after this the loop yields each retry.
const MAX_BACKOFF_STEP: u32 = 6;

/// Outcome of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The points were admitted.
    Allowed {
        /// Points left in the current window (`u64::MAX` when unlimited).
        remaining: u64,
    },
    /// Admitting the points would exceed the quota.
    Denied {
        /// Time until the current window ends.
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the request was admitted.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[inline(always)]
fn pack(start_ms: u64, consumed: u64) -> u64 {
    (((start_ms & START_MASK) + 1) << COUNT_BITS) | (consumed & COUNT_MASK)
}

#[inline(always)]
fn unpack(state: u64) -> Option<(u64, u64)> {
    match state >> COUNT_BITS {
        0 => None,
        start => Some((start - 1, state & COUNT_MASK)),
    }
}

/// Lock-free fixed-window counter for one admission key.
///
/// Timestamps are milliseconds from the owning limiter's clock and are
/// passed in by the caller, which keeps the counter deterministic.
#[repr(C)]
pub(crate) struct FixedWindow {
    /// Packed window start and consumed points.
    state: CacheAligned<AtomicU64>,

    quota: u64,
    window_ms: u64,
    ordering: MemoryOrdering,
}

impl FixedWindow {
    pub(crate) fn new(config: &QuotaConfig) -> Self {
        Self {
            state: CacheAligned::new(AtomicU64::new(0)),
            quota: config.points,
            window_ms: config.window_ms,
            ordering: config.ordering,
        }
    }

    /// The window `(start, consumed)` that is live at `now_ms`, if any.
    #[inline]
    fn live(&self, state: u64, now_ms: u64) -> Option<(u64, u64)> {
        unpack(state).filter(|(start, _)| now_ms < start.saturating_add(self.window_ms))
    }

    /// Attempts to consume `cost` points at `now_ms`.
    ///
    /// ```text
    ///     load state ─► window live? ──no──► start new window at now
    ///         ▲              │yes                   │
    ///         │              ▼                      ▼
    ///         │        consumed + cost > quota ? ──yes──► Denied
    ///         │              │no
    ///         │              ▼
    ///         └─fail── CAS(state, consumed + cost) ──ok──► Allowed
    /// ```
    pub(crate) fn consume(&self, cost: u64, now_ms: u64) -> Admission {
        let mut backoff = Backoff::new(MAX_BACKOFF_STEP);

        loop {
            let current = self.state.value.load(self.ordering.load());
            let (start, consumed) = self.live(current, now_ms).unwrap_or((now_ms, 0));

            if cost == 0 {
                return Admission::Allowed {
                    remaining: self.quota - consumed,
                };
            }

            let next = consumed.saturating_add(cost);
            if next > self.quota {
                let window_end = start.saturating_add(self.window_ms);
                return Admission::Denied {
                    retry_after: Duration::from_millis(window_end.saturating_sub(now_ms)),
                };
            }

            match self.state.value.compare_exchange_weak(
                current,
                pack(start, next),
                self.ordering.rmw(),
                self.ordering.cas_failure(),
            ) {
                Ok(_) => {
                    return Admission::Allowed {
                        remaining: self.quota - next,
                    }
                }
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Points consumed in the window live at `now_ms`.
    #[inline]
    pub(crate) fn consumed(&self, now_ms: u64) -> u64 {
        let state = self.state.value.load(self.ordering.load());
        self.live(state, now_ms).map_or(0, |(_, consumed)| consumed)
    }

    /// Whether no window is live at `now_ms`.
    #[inline]
    pub(crate) fn is_expired(&self, now_ms: u64) -> bool {
        let state = self.state.value.load(self.ordering.load());
        self.live(state, now_ms).is_none()
    }
}

impl std::fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.value.load(self.ordering.load());
        f.debug_struct("FixedWindow")
            .field("window", &unpack(state))
            .field("quota", &self.quota)
            .field("window_ms", &self.window_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64 as Counter, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn window(points: u64, window_ms: u64) -> FixedWindow {
        FixedWindow::new(&QuotaConfig::new(points, window_ms))
    }

    #[test]
    fn test_pack_roundtrip_edges() {
        assert_eq!(unpack(0), None);
        assert_eq!(unpack(pack(0, 0)), Some((0, 0)));
        assert_eq!(unpack(pack(123_456, COUNT_MASK)), Some((123_456, COUNT_MASK)));
    }

    #[test]
    fn test_quota_enforced_within_window() {
        let w = window(5, 1_000);

        for i in 0..5 {
            assert_eq!(w.consume(1, 10), Admission::Allowed { remaining: 4 - i });
        }
        assert_eq!(
            w.consume(1, 400),
            Admission::Denied {
                retry_after: Duration::from_millis(610)
            }
        );
        assert_eq!(w.consumed(400), 5);
    }

    #[test]
    fn test_new_window_resets_counter() {
        let w = window(2, 1_000);
        assert!(w.consume(2, 0).is_allowed());
        assert!(!w.consume(1, 999).is_allowed());

        assert!(w.is_expired(1_000));
        assert_eq!(w.consumed(1_000), 0);

        // The next window starts at the first consumption after expiry.
        assert!(w.consume(1, 1_450).is_allowed());
        assert!(w.consume(1, 2_300).is_allowed());
        assert!(!w.consume(1, 2_449).is_allowed());
        assert!(w.consume(1, 2_450).is_allowed());
    }

    #[test]
    fn test_cost_accumulates() {
        let w = window(10, 1_000);
        assert_eq!(w.consume(4, 0), Admission::Allowed { remaining: 6 });
        assert_eq!(w.consume(6, 1), Admission::Allowed { remaining: 0 });
        assert!(!w.consume(1, 2).is_allowed());
    }

    #[test]
    fn test_denied_consumption_leaves_counter_untouched() {
        let w = window(10, 1_000);
        assert!(w.consume(8, 0).is_allowed());
        assert!(!w.consume(3, 1).is_allowed());
        assert_eq!(w.consumed(1), 8);
        assert!(w.consume(2, 2).is_allowed());
    }

    #[test]
    fn test_zero_cost_always_allowed() {
        let w = window(1, 1_000);
        assert!(w.consume(1, 0).is_allowed());
        assert_eq!(w.consume(0, 1), Admission::Allowed { remaining: 0 });
        assert!(w.is_expired(5_000));
    }

    #[test]
    fn test_cost_above_quota_denied() {
        let w = window(3, 1_000);
        assert!(!w.consume(4, 0).is_allowed());
        assert!(w.is_expired(0));
    }

    #[test]
    fn test_concurrent_consumption_is_exact() {
        let w = Arc::new(window(1_000, 60_000));
        let allowed = Arc::new(Counter::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let w = w.clone();
                let allowed = allowed.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        if w.consume(1, 5).is_allowed() {
                            allowed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::Relaxed), 1_000);
        assert_eq!(w.consumed(5), 1_000);
    }

    #[test]
    fn test_every_ordering_enforces_quota() {
        for ordering in [
            MemoryOrdering::Relaxed,
            MemoryOrdering::AcquireRelease,
            MemoryOrdering::Sequential,
        ] {
            let w = FixedWindow::new(&QuotaConfig::new(3, 100).with_ordering(ordering));
            let allowed = (0..5).filter(|_| w.consume(1, 0).is_allowed()).count();
            assert_eq!(allowed, 3);
        }
    }

    #[test]
    fn test_debug_impl() {
        let w = window(3, 100);
        w.consume(1, 7);
        let debug = format!("{:?}", w);
        assert!(debug.contains("FixedWindow"));
        assert!(debug.contains("Some((7, 1))"));
    }
}
