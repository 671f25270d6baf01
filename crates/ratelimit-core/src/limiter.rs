//! Fixed-window rate limiter implementation
//!
//! Each limiter counts requests per derived key inside a fixed window that
//! starts with the first request and does not slide. Counts live in the
//! shared [`BucketStore`].

use crate::config::{LimiterConfig, RuntimeMode};
use crate::key::{derive_key, KeyStrategy, RequestContext, DEFAULT_STRATEGIES};
use crate::store::BucketStore;
use crate::{RateLimitDecision, RateLimitError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A configured limiter bound to the shared bucket store
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: LimiterConfig,
    mode: RuntimeMode,
    strategies: Vec<KeyStrategy>,
    buckets: Arc<BucketStore>,
}

impl RateLimiter {
    /// Create a limiter using the default key strategies
    pub fn new(config: LimiterConfig, mode: RuntimeMode, buckets: Arc<BucketStore>) -> Self {
        Self {
            config,
            mode,
            strategies: DEFAULT_STRATEGIES.to_vec(),
            buckets,
        }
    }

    /// Replace the ordered key strategies
    pub fn with_strategies(mut self, strategies: Vec<KeyStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Check if a request should be admitted
    ///
    /// Internal errors never reject: they are logged and the request is admitted.
    pub fn admit(&self, ctx: &RequestContext<'_>) -> RateLimitDecision {
        self.admit_at(ctx, Instant::now())
    }

    fn admit_at(&self, ctx: &RequestContext<'_>, now: Instant) -> RateLimitDecision {
        if self.config.test_bypass && self.mode.is_test() {
            return RateLimitDecision::Unmetered;
        }

        let key = match self.key_for(ctx) {
            Ok(key) => key,
            Err(e) => {
                // Fail open: rate limiting must not become an outage vector
                warn!(
                    limiter = %self.config.name,
                    error = %e,
                    "Rate limit check failed, admitting request"
                );
                return RateLimitDecision::Unmetered;
            }
        };

        let limit = self.config.max_requests;
        let bucket = self.buckets.hit(key, self.config.window(), now);

        if bucket.count <= limit {
            RateLimitDecision::Allow {
                current: bucket.count,
                limit,
                remaining: limit - bucket.count,
            }
        } else {
            let retry_after = retry_after(bucket.window_reset_at, now);
            debug!(
                limiter = %self.config.name,
                count = bucket.count,
                limit,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            RateLimitDecision::LimitExceeded { retry_after, limit }
        }
    }

    /// Derive the bucket key for `ctx`
    pub fn key_for(&self, ctx: &RequestContext<'_>) -> Result<String, RateLimitError> {
        derive_key(&self.strategies, self.config.prefix(), ctx, self.mode)
    }

    /// Get a reference to the config
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn buckets(&self) -> &Arc<BucketStore> {
        &self.buckets
    }
}

/// Whole seconds until the window resets, rounded up, never below one
fn retry_after(window_reset_at: Instant, now: Instant) -> Duration {
    let remaining_ms = window_reset_at.saturating_duration_since(now).as_millis();
    let secs = remaining_ms.div_ceil(1000).max(1);
    Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
}
