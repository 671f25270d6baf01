//! In-memory TTL cache of permission decisions
//!
//! One entry per `(identity, module)`. Expiry is lazy: stale entries are
//! ignored at read time and overwritten by the next fetch, never swept.

use crate::store::{IdentityId, Module, PermissionSet, StoreError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime of a cached decision
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache key. The action is deliberately absent: one row answers read,
/// write and delete for the module.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub identity: IdentityId,
    pub module: Module,
}

impl CacheKey {
    pub fn new(identity: IdentityId, module: Module) -> Self {
        Self { identity, module }
    }
}

/// Last known answer for one `(identity, module)` pair
#[derive(Clone, Debug)]
pub struct PermissionDecision {
    pub identity_id: IdentityId,
    pub module: Module,
    pub perms: PermissionSet,
    /// When the store returned this row
    pub fetched_at: Instant,
}

impl PermissionDecision {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }
}

/// Outcome of [`PermissionCache::get_or_fetch`]
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Served from a fresh cached row
    Hit(PermissionSet),
    /// Fetched from the store (possibly by a concurrent caller) and cached
    Fetched(PermissionSet),
    /// The store query failed; nothing was cached
    Failed(StoreError),
}

type InflightFetch = Arc<OnceCell<Result<PermissionSet, StoreError>>>;

struct InflightSlot {
    cell: InflightFetch,
    /// Callers currently awaiting `cell`
    waiters: usize,
}

/// Thread-safe permission decision cache with TTL and per-key fetch coalescing
pub struct PermissionCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, PermissionDecision>>,
    inflight: Mutex<HashMap<CacheKey, InflightSlot>>,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PermissionCache {
    /// Create an empty cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a cached decision if it exists and is within TTL
    pub fn get(&self, key: &CacheKey) -> Option<PermissionDecision> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<PermissionDecision> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .cloned()
    }

    /// Store a decision, unconditionally replacing any prior entry
    pub fn put(&self, key: CacheKey, perms: PermissionSet) -> PermissionDecision {
        let decision = PermissionDecision {
            identity_id: key.identity.clone(),
            module: key.module.clone(),
            perms,
            fetched_at: Instant::now(),
        };
        self.entries.write().insert(key, decision.clone());
        decision
    }

    /// Drop the entry for one key (e.g. after an admin edits that row)
    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
        self.inflight.lock().clear();
    }

    /// Number of physically retained entries, fresh or stale
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the cached decision for `key`, or run `fetch` and cache its result.
    ///
    /// Concurrent misses on the same key share one `fetch`. A missing row is
    /// cached as [`PermissionSet::DENY_ALL`]. A failed fetch is handed to every
    /// waiter but never cached, so the next miss queries the store again.
    pub async fn get_or_fetch<F, Fut>(&self, key: &CacheKey, fetch: F) -> Lookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<PermissionSet>, StoreError>>,
    {
        if let Some(hit) = self.get(key) {
            return Lookup::Hit(hit.perms);
        }

        let cell: InflightFetch = {
            let mut inflight = self.inflight.lock();
            let slot = inflight.entry(key.clone()).or_insert_with(|| InflightSlot {
                cell: Arc::default(),
                waiters: 0,
            });
            slot.waiters += 1;
            slot.cell.clone()
        };
        // Releases the in-flight slot even if this future is dropped mid-fetch
        let _guard = InflightGuard {
            cache: self,
            key,
            cell: cell.clone(),
        };

        let result = cell
            .get_or_init(move || async move {
                // A fetch for this key may have landed between our miss and now
                if let Some(hit) = self.get(key) {
                    return Ok(hit.perms);
                }
                debug!(
                    identity = %key.identity,
                    module = %key.module,
                    "Permission cache miss, querying store"
                );
                let perms = match fetch().await {
                    Ok(row) => row.unwrap_or(PermissionSet::DENY_ALL),
                    Err(e) => return Err(e),
                };
                self.put(key.clone(), perms);
                Ok(perms)
            })
            .await
            .clone();

        match result {
            Ok(perms) => Lookup::Fetched(perms),
            Err(e) => Lookup::Failed(e),
        }
    }
}

/// One caller's claim on an in-flight fetch.
///
/// The slot is removed once the fetch has completed, or when the last waiter
/// goes away without completing it.
struct InflightGuard<'a> {
    cache: &'a PermissionCache,
    key: &'a CacheKey,
    cell: InflightFetch,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight.lock();
        let Some(slot) = inflight.get_mut(self.key) else {
            return;
        };
        // Replaced by a later fetch after a clear
        if !Arc::ptr_eq(&slot.cell, &self.cell) {
            return;
        }
        slot.waiters = slot.waiters.saturating_sub(1);
        if slot.waiters == 0 || slot.cell.initialized() {
            inflight.remove(self.key);
        }
    }
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.len())
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}
