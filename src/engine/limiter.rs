//! # Per-Tier Rate Limiter
//!
//! Admission control for one tier. Each admission key (for example a caller
//! address) gets its own [`FixedWindow`], created lazily on first use.
//!
//! ```text
//!     consume("10.0.0.1") ──┐
//!     consume("10.0.0.2") ──┼──► RateLimiter("free") ──► per-key windows
//!     consume("10.0.0.1") ──┘           │
//!                                       ▼
//!                              ┌──────────────────┐
//!                              │ DashMap          │
//!                              │  key → window    │
//!                              │  key → window    │
//!                              └──────────────────┘
//! ```
//!
//! ## Key Features
//!
//! 1. **Per-key quotas**: one key exhausting its quota does not deny another key
//! 2. **Unlimited tiers**: no map, no counters, always allowed
//! 3. **Bounded memory**: at most `max_tracked_keys` keys; expired keys are
//!    purged first when the table fills, then new keys are denied
//! 4. **Janitor**: optional background thread purging expired keys

use super::config::{QuotaConfig, RateLimit};
use super::utils::Clock;
use super::window::{Admission, FixedWindow};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fraction of the key table at which purging kicks in on insert (90%).
const PURGE_THRESHOLD_PERCENT: usize = 90;

type WindowMap = DashMap<Arc<str>, Arc<FixedWindow>, ahash::RandomState>;

struct KeyedWindows {
    quota: QuotaConfig,
    windows: WindowMap,
    active_keys: AtomicUsize,
    purge_in_progress: AtomicBool,
    /// Set while new keys are being turned away; cleared by a purge that frees slots.
    table_full: AtomicBool,
}

/// Rate limiter for a single tier.
///
/// Thread-safe; share it by reference or through `Arc`.
pub struct RateLimiter {
    tier: Arc<str>,
    keyed: Option<KeyedWindows>,
    clock: Clock,

    total_allowed: AtomicU64,
    total_denied: AtomicU64,
    keys_created: AtomicU64,
    keys_purged: AtomicU64,
}

/// Point-in-time statistics of a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterStats {
    /// Configured points per window, `None` when unlimited.
    pub quota: Option<u64>,
    /// Points consumed in the live windows of all tracked keys.
    pub consumed: u64,
    /// Keys currently tracked.
    pub tracked_keys: usize,
    /// Consumptions admitted since startup.
    pub total_allowed: u64,
    /// Consumptions denied since startup.
    pub total_denied: u64,
    /// Keys created since startup.
    pub keys_created: u64,
    /// Keys purged since startup.
    pub keys_purged: u64,
}

impl RateLimiter {
    /// Creates the limiter for `tier` with the given policy.
    pub fn new(tier: impl Into<Arc<str>>, policy: &RateLimit) -> Self {
        let keyed = policy.quota().map(|quota| {
            let shards = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8)
                .next_power_of_two()
                .clamp(4, 64);
            let capacity = (quota.max_tracked_keys / shards).clamp(16, 1024);

            KeyedWindows {
                quota: quota.clone(),
                windows: DashMap::with_capacity_and_hasher_and_shard_amount(
                    capacity,
                    ahash::RandomState::new(),
                    shards,
                ),
                active_keys: AtomicUsize::new(0),
                purge_in_progress: AtomicBool::new(false),
                table_full: AtomicBool::new(false),
            }
        });

        Self {
            tier: tier.into(),
            keyed,
            clock: Clock::new(),
            total_allowed: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            keys_created: AtomicU64::new(0),
            keys_purged: AtomicU64::new(0),
        }
    }

    /// The tier this limiter belongs to.
    pub fn tier(&self) -> &str {
        &self.tier
    }

    /// Whether the tier is unlimited.
    pub fn is_unlimited(&self) -> bool {
        self.keyed.is_none()
    }

    /// Consumes one point for `key`.
    #[inline]
    pub fn try_consume(&self, key: &str) -> Admission {
        self.consume(key, 1)
    }

    /// Consumes `cost` points for `key`.
    ///
    /// Non-blocking. Unlimited tiers always return `Allowed` without
    /// keeping a counter.
    pub fn consume(&self, key: &str, cost: u64) -> Admission {
        let Some(keyed) = &self.keyed else {
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
            return Admission::Allowed { remaining: u64::MAX };
        };

        let now_ms = self.clock.now_ms();
        let admission = match self.window_for(keyed, key, now_ms) {
            Some(window) => window.consume(cost, now_ms),
            None => Admission::Denied {
                retry_after: keyed.quota.window(),
            },
        };

        match admission {
            Admission::Allowed { .. } => {
                self.total_allowed.fetch_add(1, Ordering::Relaxed);
            }
            Admission::Denied { retry_after } => {
                self.total_denied.fetch_add(1, Ordering::Relaxed);
                debug!(tier = %self.tier, key, cost, ?retry_after, "admission denied");
            }
        }
        admission
    }

    /// Gets or creates the window for `key`; `None` when the key table is full.
    fn window_for(&self, keyed: &KeyedWindows, key: &str, now_ms: u64) -> Option<Arc<FixedWindow>> {
        if let Some(window) = keyed.windows.get(key) {
            return Some(window.clone());
        }

        let max = keyed.quota.max_tracked_keys;
        let current = keyed.active_keys.load(Ordering::Acquire);
        if current >= max.saturating_mul(PURGE_THRESHOLD_PERCENT) / 100 {
            self.purge_under_pressure(keyed, now_ms);
            if keyed.active_keys.load(Ordering::Acquire) >= max {
                self.deny_new_key(keyed, key, max);
                return None;
            }
        }

        match keyed.windows.entry(Arc::from(key)) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let prev = keyed.active_keys.fetch_add(1, Ordering::AcqRel);
                if prev >= max {
                    keyed.active_keys.fetch_sub(1, Ordering::AcqRel);
                    self.deny_new_key(keyed, key, max);
                    return None;
                }

                let window = Arc::new(FixedWindow::new(&keyed.quota));
                vacant.insert(window.clone());
                self.keys_created.fetch_add(1, Ordering::Relaxed);
                debug!(tier = %self.tier, key, tracked = prev + 1, "tracking admission key");
                Some(window)
            }
        }
    }

    /// Warns once when the table fills up; later denials only log at debug.
    fn deny_new_key(&self, keyed: &KeyedWindows, key: &str, max: usize) {
        if keyed.table_full.swap(true, Ordering::AcqRel) {
            debug!(tier = %self.tier, key, max, "admission key table full, denying new key");
        } else {
            warn!(tier = %self.tier, max, "admission key table full, denying new keys until a purge frees slots");
        }
    }

    /// Purge triggered from the hot path; only one caller runs it at a time.
    fn purge_under_pressure(&self, keyed: &KeyedWindows, now_ms: u64) {
        if keyed
            .purge_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _guard = PurgeGuard {
            flag: &keyed.purge_in_progress,
        };

        let removed = self.remove_expired(keyed, now_ms);
        if removed > 0 {
            info!(tier = %self.tier, removed, "purged expired admission keys under pressure");
        }
    }

    /// Drops expired windows that no caller still holds.
    ///
    /// `retain` holds each shard's write lock, so no new clone of a window
    /// can appear while it is checked. A held window stays in the table and
    /// any point consumed through it still counts for its key.
    fn remove_expired(&self, keyed: &KeyedWindows, now_ms: u64) -> usize {
        let mut removed = 0;
        keyed.windows.retain(|_, window| {
            if Arc::strong_count(window) == 1 && window.is_expired(now_ms) {
                removed += 1;
                keyed.active_keys.fetch_sub(1, Ordering::AcqRel);
                false
            } else {
                true
            }
        });
        self.keys_purged.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            keyed.table_full.store(false, Ordering::Release);
        }
        removed
    }

    /// Removes keys whose window has expired. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(keyed) = &self.keyed else {
            return 0;
        };
        let removed = self.remove_expired(keyed, self.clock.now_ms());
        if removed > 0 {
            debug!(tier = %self.tier, removed, "purged expired admission keys");
        }
        removed
    }

    /// Points consumed by `key` in its live window.
    pub fn consumed(&self, key: &str) -> u64 {
        let Some(keyed) = &self.keyed else {
            return 0;
        };
        keyed
            .windows
            .get(key)
            .map_or(0, |window| window.consumed(self.clock.now_ms()))
    }

    /// Keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.keyed
            .as_ref()
            .map_or(0, |keyed| keyed.active_keys.load(Ordering::Acquire))
    }

    /// Statistics snapshot; eventually consistent across keys.
    ///
    /// Summing `consumed` walks every tracked key under each shard's read
    /// lock in turn, so inserts of new keys into that shard wait for the
    /// walk. Cost grows with `tracked_keys`, bounded by `max_tracked_keys`.
    pub fn stats(&self) -> LimiterStats {
        let now_ms = self.clock.now_ms();
        let consumed = self.keyed.as_ref().map_or(0, |keyed| {
            keyed
                .windows
                .iter()
                .map(|entry| entry.value().consumed(now_ms))
                .sum()
        });

        LimiterStats {
            quota: self.keyed.as_ref().map(|keyed| keyed.quota.points),
            consumed,
            tracked_keys: self.tracked_keys(),
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            keys_created: self.keys_created.load(Ordering::Relaxed),
            keys_purged: self.keys_purged.load(Ordering::Relaxed),
        }
    }

    /// Starts a stoppable thread that purges expired keys every `interval`.
    ///
    /// Send `()` on (or drop) the returned sender to stop it.
    pub fn start_janitor(
        self: Arc<Self>,
        interval: Duration,
    ) -> std::io::Result<(thread::JoinHandle<()>, mpsc::Sender<()>)> {
        spawn_janitor(format!("bulkhead-janitor-{}", self.tier), interval, move || {
            self.purge_expired();
        })
    }
}

/// Runs `purge` every `interval` on a named thread until signalled.
pub(crate) fn spawn_janitor<F>(
    name: String,
    interval: Duration,
    mut purge: F,
) -> std::io::Result<(thread::JoinHandle<()>, mpsc::Sender<()>)>
where
    F: FnMut() + Send + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel();
    let handle = thread::Builder::new().name(name).spawn(move || {
        info!(?interval, "janitor started");
        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("janitor stopping");
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => purge(),
            }
        }
    })?;
    Ok((handle, stop_tx))
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tier", &self.tier)
            .field("quota", &self.keyed.as_ref().map(|keyed| &keyed.quota))
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

/// Resets the purge flag on every exit path.
struct PurgeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(points: u64, window_ms: u64) -> RateLimiter {
        RateLimiter::new("free", &RateLimit::Quota(QuotaConfig::new(points, window_ms)))
    }

    #[test]
    fn test_quota_plus_one_is_denied() {
        let limiter = limited(100, 60_000);

        let allowed = (0..105)
            .filter(|_| limiter.try_consume("10.0.0.1").is_allowed())
            .count();

        assert_eq!(allowed, 100);
        let stats = limiter.stats();
        assert_eq!(stats.total_allowed, 100);
        assert_eq!(stats.total_denied, 5);
        assert_eq!(stats.consumed, 100);
        assert_eq!(stats.quota, Some(100));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limited(3, 60_000);

        for _ in 0..3 {
            assert!(limiter.try_consume("a").is_allowed());
        }
        assert!(!limiter.try_consume("a").is_allowed());

        assert!(limiter.try_consume("b").is_allowed());
        assert_eq!(limiter.consumed("a"), 3);
        assert_eq!(limiter.consumed("b"), 1);
        assert_eq!(limiter.consumed("unknown"), 0);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_unlimited_keeps_no_state() {
        let limiter = RateLimiter::new("enterprise", &RateLimit::Unlimited);
        assert!(limiter.is_unlimited());

        for _ in 0..10_000 {
            assert_eq!(
                limiter.consume("k", 50),
                Admission::Allowed { remaining: u64::MAX }
            );
        }

        let stats = limiter.stats();
        assert_eq!(stats.quota, None);
        assert_eq!(stats.tracked_keys, 0);
        assert_eq!(stats.consumed, 0);
        assert_eq!(limiter.purge_expired(), 0);
    }

    #[test]
    fn test_window_expiry_and_purge() {
        let limiter = limited(1, 30);
        assert!(limiter.try_consume("a").is_allowed());
        assert!(!limiter.try_consume("a").is_allowed());

        thread::sleep(Duration::from_millis(40));

        assert_eq!(limiter.consumed("a"), 0);
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.try_consume("a").is_allowed());

        let stats = limiter.stats();
        assert_eq!(stats.keys_created, 2);
        assert_eq!(stats.keys_purged, 1);
    }

    #[test]
    fn test_full_key_table_denies_new_keys() {
        let limiter = RateLimiter::new(
            "free",
            &RateLimit::Quota(QuotaConfig::new(10, 60_000).with_max_tracked_keys(4)),
        );

        for key in ["a", "b", "c", "d"] {
            assert!(limiter.try_consume(key).is_allowed());
        }
        assert_eq!(limiter.tracked_keys(), 4);

        // Nothing has expired, so the new key cannot be tracked.
        assert!(!limiter.try_consume("e").is_allowed());
        // Known keys keep working.
        assert!(limiter.try_consume("a").is_allowed());
    }

    #[test]
    fn test_purge_skips_window_held_by_caller() {
        let limiter = limited(1, 20);
        assert!(limiter.try_consume("k").is_allowed());

        thread::sleep(Duration::from_millis(30));

        // A caller fetched the expired window but has not consumed yet.
        let keyed = limiter.keyed.as_ref().unwrap();
        let held = Arc::clone(&keyed.windows.get("k").unwrap());
        assert_eq!(limiter.purge_expired(), 0);
        assert_eq!(limiter.tracked_keys(), 1);

        assert!(held.consume(1, limiter.clock.now_ms()).is_allowed());
        assert!(!limiter.try_consume("k").is_allowed());
        assert_eq!(limiter.consumed("k"), 1);
    }

    #[test]
    fn test_full_key_table_warns_once_until_purge() {
        let limiter = RateLimiter::new(
            "free",
            &RateLimit::Quota(QuotaConfig::new(10, 20).with_max_tracked_keys(2)),
        );
        let keyed = limiter.keyed.as_ref().unwrap();
        assert!(limiter.try_consume("a").is_allowed());
        assert!(limiter.try_consume("b").is_allowed());
        assert!(!keyed.table_full.load(Ordering::Acquire));

        assert!(!limiter.try_consume("c").is_allowed());
        assert!(keyed.table_full.load(Ordering::Acquire));
        assert!(!limiter.try_consume("d").is_allowed());
        assert!(keyed.table_full.load(Ordering::Acquire));

        thread::sleep(Duration::from_millis(30));

        assert_eq!(limiter.purge_expired(), 2);
        assert!(!keyed.table_full.load(Ordering::Acquire));
        assert!(limiter.try_consume("c").is_allowed());
    }

    #[test]
    fn test_full_key_table_purges_expired_keys() {
        let limiter = RateLimiter::new(
            "free",
            &RateLimit::Quota(QuotaConfig::new(10, 20).with_max_tracked_keys(2)),
        );
        assert!(limiter.try_consume("a").is_allowed());
        assert!(limiter.try_consume("b").is_allowed());

        thread::sleep(Duration::from_millis(30));

        assert!(limiter.try_consume("c").is_allowed());
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.stats().keys_purged, 2);
    }

    #[test]
    fn test_concurrent_keys_share_nothing() {
        let limiter = Arc::new(limited(50, 60_000));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let limiter = limiter.clone();
                thread::spawn(move || {
                    let key = format!("10.0.0.{}", i);
                    (0..80).filter(|_| limiter.try_consume(&key).is_allowed()).count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 50);
        }
        assert_eq!(limiter.tracked_keys(), 8);
        assert_eq!(limiter.stats().consumed, 400);
    }

    #[test]
    fn test_concurrent_same_key_is_exact() {
        let limiter = Arc::new(limited(500, 60_000));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || {
                    (0..100).filter(|_| limiter.try_consume("shared").is_allowed()).count()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 500);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_janitor_purges_and_stops() {
        let limiter = Arc::new(limited(5, 20));
        for i in 0..5 {
            limiter.try_consume(&format!("k{}", i));
        }

        let (handle, stop_tx) = limiter
            .clone()
            .start_janitor(Duration::from_millis(25))
            .unwrap();

        thread::sleep(Duration::from_millis(120));
        stop_tx.send(()).unwrap();
        handle.join().unwrap();

        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_purge_guard_resets_flag() {
        let flag = AtomicBool::new(true);
        {
            let _guard = PurgeGuard { flag: &flag };
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_debug_impl() {
        let limiter = limited(5, 1_000);
        let debug = format!("{:?}", limiter);
        assert!(debug.contains("RateLimiter"));
        assert!(debug.contains("free"));
    }
}
