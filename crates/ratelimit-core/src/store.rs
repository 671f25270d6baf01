//! Shared bucket storage and background cleanup
//!
//! Every limiter in the process writes into one [`BucketStore`], keyed by the
//! limiter's prefix. A single sweeper task per store removes buckets whose
//! window has ended, so keys that stop sending traffic are reclaimed.

use crate::RateLimitError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// In-flight consumption for one `(limiter, key)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Requests seen in the current window, rejected ones included
    pub count: u32,
    pub window_reset_at: Instant,
}

impl Bucket {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            window_reset_at: now + window,
        }
    }

    /// Past its window; logically absent even if not yet swept
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_reset_at
    }
}

/// Process-wide bucket map shared by all limiters
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: DashMap<String, Bucket>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key`, starting a new window if the current
    /// one has ended. Returns the bucket as it stands after this request.
    ///
    /// The read-modify-write runs under the shard lock for `key`.
    pub(crate) fn hit(&self, key: String, window: Duration, now: Instant) -> Bucket {
        match self.buckets.entry(key) {
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                if bucket.is_expired(now) {
                    *bucket = Bucket::fresh(now, window);
                } else {
                    bucket.count = bucket.count.saturating_add(1);
                }
                *bucket
            }
            Entry::Vacant(vacant) => *vacant.insert(Bucket::fresh(now, window)),
        }
    }

    /// Current bucket for `key`, expired or not
    pub fn get(&self, key: &str) -> Option<Bucket> {
        self.buckets.get(key).map(|b| *b)
    }

    /// Get current number of tracked buckets (for metrics)
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Remove expired buckets, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now));
        before.saturating_sub(self.buckets.len())
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// Returns `Ok(false)` if a sweeper is already running for this store.
    /// The task only holds a weak reference: it stops once the store is
    /// dropped and never keeps the runtime alive on its own.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<bool, RateLimitError> {
        if interval.is_zero() {
            return Err(RateLimitError::Config(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RateLimitError::Internal(format!("cannot start bucket sweeper: {e}")))?;

        let mut slot = self.sweeper.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Bucket sweeper already running");
            return Ok(false);
        }

        let weak = Arc::downgrade(self);
        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let removed = store.evict_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired rate limit buckets");
                }
            }
        }));

        info!(?interval, "Started rate limit bucket sweeper");
        Ok(true)
    }

    /// Cancel the sweeper. Returns whether one was running.
    pub fn stop_sweeper(&self) -> bool {
        match self.sweeper.lock().take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                if was_running {
                    info!("Stopped rate limit bucket sweeper");
                }
                was_running
            }
            None => false,
        }
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for BucketStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_hit_creates_and_increments() {
        let store = BucketStore::new();
        let now = Instant::now();

        let first = store.hit("k".to_string(), WINDOW, now);
        assert_eq!(first.count, 1);
        assert_eq!(first.window_reset_at, now + WINDOW);

        let second = store.hit("k".to_string(), WINDOW, now + Duration::from_secs(10));
        assert_eq!(second.count, 2);
        // Window is fixed at creation, not extended by traffic
        assert_eq!(second.window_reset_at, now + WINDOW);
    }

    #[test]
    fn test_hit_replaces_expired_bucket() {
        let store = BucketStore::new();
        let now = Instant::now();

        for _ in 0..5 {
            store.hit("k".to_string(), WINDOW, now);
        }
        let later = now + WINDOW;
        let bucket = store.hit("k".to_string(), WINDOW, later);
        assert_eq!(bucket.count, 1);
        assert_eq!(bucket.window_reset_at, later + WINDOW);
    }

    #[test]
    fn test_evict_expired() {
        let store = BucketStore::new();
        let now = Instant::now();

        store.hit("short".to_string(), Duration::from_secs(1), now);
        store.hit("long".to_string(), WINDOW, now);
        assert_eq!(store.len(), 2);

        let removed = store.evict_expired_at(now + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").is_some());
    }

    #[test]
    fn test_start_sweeper_outside_runtime() {
        let store = Arc::new(BucketStore::new());
        let result = store.start_sweeper(Duration::from_secs(1));
        assert!(matches!(result, Err(RateLimitError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_is_single_instance() {
        let store = Arc::new(BucketStore::new());

        assert!(store.start_sweeper(Duration::from_secs(60)).unwrap());
        assert!(!store.start_sweeper(Duration::from_secs(60)).unwrap());
        assert!(store.sweeper_running());

        assert!(store.stop_sweeper());
        assert!(!store.stop_sweeper());

        // Can be restarted after a stop
        assert!(store.start_sweeper(Duration::from_secs(60)).unwrap());
        store.stop_sweeper();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_idle_keys() {
        let store = Arc::new(BucketStore::new());
        store.start_sweeper(Duration::from_secs(30)).unwrap();

        let now = Instant::now();
        for i in 0..100 {
            store.hit(format!("idle:{i}"), Duration::from_secs(10), now);
        }
        assert_eq!(store.len(), 100);

        // Past expiry plus one full cleanup interval, with no further traffic
        tokio::time::sleep(Duration::from_secs(10 + 30 + 1)).await;
        assert_eq!(store.len(), 0);

        store.stop_sweeper();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_keeps_active_keys() {
        let store = Arc::new(BucketStore::new());
        store.start_sweeper(Duration::from_secs(5)).unwrap();

        let now = Instant::now();
        for i in 0..10 {
            store.hit(format!("idle:{i}"), Duration::from_secs(1), now);
        }
        store.hit("active".to_string(), Duration::from_secs(3600), now);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.len(), 1);
        assert!(store.get("active").is_some());

        store.stop_sweeper();
    }
}
