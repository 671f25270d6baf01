//! ratelimit-core: fixed-window rate limiting for the fleet dashboard gate
//!
//! Named limiters count requests per derived key in fixed windows. All
//! limiters share one [`BucketStore`]; a single background sweeper reclaims
//! buckets whose window has ended.
//!
//! # Example
//!
//! ```rust,ignore
//! use ratelimit_core::{BucketStore, LimiterConfig, RateLimiter, RequestContext, RuntimeMode};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let buckets = Arc::new(BucketStore::new());
//! buckets.start_sweeper(Duration::from_secs(60))?;
//!
//! let limiter = RateLimiter::new(
//!     LimiterConfig::new("api", Duration::from_secs(60), 200),
//!     RuntimeMode::Production,
//!     buckets.clone(),
//! );
//!
//! let ctx = RequestContext {
//!     identity: Some("user-123"),
//!     client_ip: Some("10.0.0.7".parse()?),
//!     user_agent: Some("fleet-ui/2.1"),
//!     bearer_token: None,
//! };
//!
//! match limiter.admit(&ctx) {
//!     RateLimitDecision::LimitExceeded { retry_after, .. } => {
//!         println!("Rate limited, retry in {} seconds", retry_after.as_secs())
//!     }
//!     _ => println!("Request allowed"),
//! }
//! ```

pub mod config;
pub mod key;
pub mod limiter;
pub mod store;

// Re-export public types
pub use config::{Config, LimiterConfig, RuntimeMode};
pub use key::{derive_key, sha256_hex, KeyStrategy, RequestContext, DEFAULT_STRATEGIES};
pub use limiter::RateLimiter;
pub use store::{Bucket, BucketStore};

use std::time::Duration;
use thiserror::Error;

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request allowed
    Allow {
        /// Current count in window
        current: u32,
        /// Configured limit
        limit: u32,
        /// Remaining requests in window
        remaining: u32,
    },
    /// Admitted without counting: test bypass, or the check itself failed
    Unmetered,
    /// Request rate limited
    LimitExceeded {
        /// Time until the window resets (maps to Retry-After header)
        retry_after: Duration,
        /// Configured limit
        limit: u32,
    },
}

impl RateLimitDecision {
    /// Check if the request is allowed
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateLimitDecision::LimitExceeded { .. })
    }

    /// Whole seconds to wait, for rejected requests only
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateLimitDecision::LimitExceeded { retry_after, .. } => Some(retry_after.as_secs()),
            _ => None,
        }
    }

    /// Outcome label for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            RateLimitDecision::Allow { .. } => "allow",
            RateLimitDecision::Unmetered => "unmetered",
            RateLimitDecision::LimitExceeded { .. } => "limited",
        }
    }
}

/// Error type for rate limit operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
