//! authz-core: permission-decision cache for the fleet dashboard gate
//!
//! Answers "may this identity read/write/delete in this module?" from an
//! in-process TTL cache sitting in front of the permission store.
//!
//! # Features
//!
//! - **TTL cache**: one row per `(identity, module)` answers all three actions
//! - **Negative caching**: a missing store row is cached as deny-all
//! - **Coalesced misses**: concurrent misses on one key share a single store query
//! - **Asymmetric failure policy**: store failures allow reads, deny writes/deletes
//!
//! # Example
//!
//! ```rust,ignore
//! use authz_core::{check_authz, Identity, MemoryPermissionStore, Module, NoopMetrics,
//!     PermissionCache, PermissionSet};
//!
//! let cache = PermissionCache::default();
//! let store = MemoryPermissionStore::new();
//! store.grant("user-7", "vehicles", PermissionSet::new(true, false, false));
//!
//! let identity = Identity::new("user-7", "dispatcher");
//! let decision = check_authz(
//!     Some(&identity),
//!     &Module::from("vehicles"),
//!     "read",
//!     &cache,
//!     &store,
//!     &NoopMetrics,
//! ).await;
//! assert!(decision.is_allowed());
//! ```

pub mod cache;
pub mod decision;
pub mod store;

// Re-export public types
pub use cache::{CacheKey, Lookup, PermissionCache, PermissionDecision, DEFAULT_TTL};
pub use decision::{
    check_authz, Action, AuthzDecision, AuthzError, AuthzMetrics, AuthzSource, DenyReason,
    Identity, NoopMetrics,
};
pub use store::{
    IdentityId, MemoryPermissionStore, Module, PermissionSet, PermissionStore, StoreError,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::PermissionCache;
    pub use crate::decision::{
        check_authz, Action, AuthzDecision, AuthzMetrics, AuthzSource, DenyReason, Identity,
        NoopMetrics,
    };
    pub use crate::store::{IdentityId, Module, PermissionSet, PermissionStore, StoreError};
}
