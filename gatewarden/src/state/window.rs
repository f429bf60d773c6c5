// gatewarden/src/state/window.rs
//
// TTL-bounded sliding-window store, shared by all requests.
// DashMap = sharded concurrent HashMap — safe across tokio tasks with no
// global mutex.
//
// Layout:
//   - Hot 1-minute counters: lock-free epoch reset + atomic increment
//   - Timing rings: last 10 arrival stamps per identity
//   - Path sets: bounded recently-seen path list per identity
//   - Behavior profiles: 24h per-identity profile behind an RwLock
//
// Under memory pressure entries may be evicted early; callers treat an
// absent entry as "new client". Keys are identity hashes, never
// plaintext identifiers.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::profile::BehaviorProfile;

pub const COUNTER_TTL_SECS: i64 = 60;
pub const TIMING_TTL_SECS: i64 = 300;
pub const PATHS_TTL_SECS: i64 = 300;
pub const TIMING_RING_CAPACITY: usize = 10;

// ── Lock-free TTL counter ─────────────────────────────────────────────────────

/// Counter that resets itself when its window expires. The epoch swap and
/// the count reset are two separate atomics; increments racing the reset
/// may land on either side, which the window contract allows (readers can
/// observe any interleaving of concurrent increments).
struct TtlCounter {
    epoch_ms: AtomicI64,
    count:    AtomicU64,
}

impl TtlCounter {
    fn new(now_ms: i64) -> Self {
        Self { epoch_ms: AtomicI64::new(now_ms), count: AtomicU64::new(0) }
    }

    fn incr(&self, now_ms: i64, ttl_ms: i64) -> u64 {
        self.maybe_reset(now_ms, ttl_ms);
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn peek(&self, now_ms: i64, ttl_ms: i64) -> u64 {
        let epoch = self.epoch_ms.load(Ordering::Acquire);
        if now_ms - epoch >= ttl_ms {
            0
        } else {
            self.count.load(Ordering::Relaxed)
        }
    }

    fn maybe_reset(&self, now_ms: i64, ttl_ms: i64) {
        let epoch = self.epoch_ms.load(Ordering::Acquire);
        if now_ms - epoch < ttl_ms {
            return;
        }
        if self
            .epoch_ms
            .compare_exchange(epoch, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.count.store(0, Ordering::Relaxed);
        }
    }

    fn expired_for(&self, now_ms: i64, grace_ms: i64) -> bool {
        now_ms - self.epoch_ms.load(Ordering::Acquire) >= grace_ms
    }
}

// ── TTL-wrapped collections ───────────────────────────────────────────────────

struct TimingRing {
    stamps_ms:  Mutex<Vec<i64>>,
    expires_ms: AtomicI64,
}

struct PathSet {
    paths:      Mutex<Vec<String>>,
    expires_ms: AtomicI64,
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct WindowStore {
    counters: DashMap<String, TtlCounter>,
    timings:  DashMap<String, TimingRing>,
    paths:    DashMap<String, PathSet>,
    profiles: DashMap<String, Arc<RwLock<BehaviorProfile>>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            timings:  DashMap::new(),
            paths:    DashMap::new(),
            profiles: DashMap::new(),
        }
    }

    /// Atomic increment-and-read; creates the counter if absent.
    pub fn incr_and_get(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> u64 {
        let now_ms = now.timestamp_millis();
        let counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| TtlCounter::new(now_ms));
        counter.incr(now_ms, ttl.num_milliseconds())
    }

    /// Read without creating. Absent or expired reads as zero.
    pub fn peek_count(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> u64 {
        let now_ms = now.timestamp_millis();
        self.counters
            .get(key)
            .map(|c| c.peek(now_ms, ttl.num_milliseconds()))
            .unwrap_or(0)
    }

    /// Append an arrival stamp, keeping the newest `TIMING_RING_CAPACITY`
    /// entries. Returns the ring contents including the new stamp.
    pub fn push_timestamp(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Vec<i64> {
        let now_ms = now.timestamp_millis();
        let ring = self.timings.entry(key.to_string()).or_insert_with(|| TimingRing {
            stamps_ms:  Mutex::new(Vec::with_capacity(TIMING_RING_CAPACITY)),
            expires_ms: AtomicI64::new(0),
        });
        ring.expires_ms
            .store(now_ms + ttl.num_milliseconds(), Ordering::Release);
        let mut stamps = ring.stamps_ms.lock();
        stamps.push(now_ms);
        let excess = stamps.len().saturating_sub(TIMING_RING_CAPACITY);
        if excess > 0 {
            stamps.drain(..excess);
        }
        stamps.clone()
    }

    /// Record a path for the identity. Returns true when the path was not
    /// already present; evicts the oldest entry when over capacity.
    pub fn add_path(
        &self,
        key: &str,
        path: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        max: usize,
    ) -> bool {
        let now_ms = now.timestamp_millis();
        let set = self.paths.entry(key.to_string()).or_insert_with(|| PathSet {
            paths:      Mutex::new(Vec::new()),
            expires_ms: AtomicI64::new(0),
        });
        set.expires_ms
            .store(now_ms + ttl.num_milliseconds(), Ordering::Release);
        let mut paths = set.paths.lock();
        if paths.iter().any(|p| p == path) {
            return false;
        }
        paths.push(path.to_string());
        if paths.len() > max {
            paths.remove(0);
        }
        true
    }

    pub fn seen_paths(&self, key: &str) -> Vec<String> {
        self.paths
            .get(key)
            .map(|s| s.paths.lock().clone())
            .unwrap_or_default()
    }

    /// Single materialization per identity: concurrent callers all get
    /// the same Arc; a reader never observes a half-built profile.
    pub fn get_or_create_profile(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Arc<RwLock<BehaviorProfile>> {
        self.profiles
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BehaviorProfile::new(key, now))))
            .clone()
    }

    pub fn profile(&self, key: &str) -> Option<Arc<RwLock<BehaviorProfile>>> {
        self.profiles.get(key).map(|p| p.clone())
    }

    pub fn identity_count(&self) -> usize {
        self.profiles.len()
    }

    /// Drop expired entries across all maps.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        // Counters linger a little past their window so a fresh request
        // reuses the allocation instead of re-creating it.
        let counter_grace = COUNTER_TTL_SECS * 1000 * 5;
        let before = self.counters.len() + self.timings.len() + self.paths.len() + self.profiles.len();

        self.counters.retain(|_, c| !c.expired_for(now_ms, counter_grace));
        self.timings
            .retain(|_, t| t.expires_ms.load(Ordering::Acquire) > now_ms);
        self.paths
            .retain(|_, p| p.expires_ms.load(Ordering::Acquire) > now_ms);
        self.profiles.retain(|_, p| !p.read().expired(now));

        let after = self.counters.len() + self.timings.len() + self.paths.len() + self.profiles.len();
        if before != after {
            debug!(evicted = before - after, "window store sweep");
        }
    }

    /// Background eviction loop; one per store.
    pub async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            self.sweep(Utc::now());
        }
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new()
    }
}
