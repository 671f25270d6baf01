//! Core authorization decision logic
//!
//! Implements the cache -> store cascade for `(identity, module, action)`
//! checks, with asymmetric handling of store failures: reads fail open,
//! writes and deletes fail closed.

use crate::cache::{CacheKey, Lookup, PermissionCache};
use crate::store::{IdentityId, Module, PermissionSet, PermissionStore};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Operation being authorized against a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Write,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
        }
    }

    /// Evaluate this action against a permission row
    pub fn permitted_by(&self, perms: &PermissionSet) -> bool {
        match self {
            Action::Read => perms.can_read,
            Action::Write => perms.can_write,
            Action::Delete => perms.can_delete,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "delete" => Ok(Action::Delete),
            other => Err(AuthzError::InvalidAction(other.to_string())),
        }
    }
}

/// Errors raised by the calling layer's misuse of the authorization API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("invalid permission action: {0:?}")]
    InvalidAction(String),
}

/// Authenticated principal handed over by upstream token verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: IdentityId,
    pub role: String,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Source of the authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzSource {
    /// Fresh cached row
    Cache,
    /// Queried from the permission store
    Store,
    /// Store query failed; decided by the failure policy
    StoreUnavailable,
}

impl AuthzSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthzSource::Cache => "cache",
            AuthzSource::Store => "store",
            AuthzSource::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// No identity was presented
    Unauthenticated,
    /// Identity lacks the permission, or a mutating action hit a store failure
    Forbidden,
    /// The caller passed an invalid action; a programming error, not a user one
    Misconfigured(String),
}

impl DenyReason {
    /// HTTP status code to return
    pub fn status(&self) -> u16 {
        match self {
            DenyReason::Unauthenticated => 401,
            DenyReason::Forbidden => 403,
            DenyReason::Misconfigured(_) => 500,
        }
    }

    /// Caller-facing message. Never carries backend error detail.
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "Authentication required",
            DenyReason::Forbidden => "Insufficient permissions",
            DenyReason::Misconfigured(_) => "Server misconfiguration",
        }
    }
}

/// Authorization decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzDecision {
    /// Request allowed
    Allow {
        /// Where the decision came from
        source: AuthzSource,
    },
    /// Request denied
    Deny {
        reason: DenyReason,
        /// Where the decision came from, if a lookup happened at all
        source: Option<AuthzSource>,
    },
}

impl AuthzDecision {
    pub fn allow(source: AuthzSource) -> Self {
        AuthzDecision::Allow { source }
    }

    pub fn deny(reason: DenyReason) -> Self {
        AuthzDecision::Deny {
            reason,
            source: None,
        }
    }

    pub fn deny_from(reason: DenyReason, source: AuthzSource) -> Self {
        AuthzDecision::Deny {
            reason,
            source: Some(source),
        }
    }

    /// Check if the decision allows the request
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthzDecision::Allow { .. })
    }

    pub fn source(&self) -> Option<AuthzSource> {
        match self {
            AuthzDecision::Allow { source } => Some(*source),
            AuthzDecision::Deny { source, .. } => *source,
        }
    }

    /// Outcome label used for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            AuthzDecision::Allow { source } => match source {
                AuthzSource::Cache => "allow_cache",
                AuthzSource::Store => "allow_store",
                AuthzSource::StoreUnavailable => "allow_fail_open",
            },
            AuthzDecision::Deny { reason, source } => match (reason, source) {
                (DenyReason::Unauthenticated, _) => "deny_unauthenticated",
                (DenyReason::Misconfigured(_), _) => "deny_misconfigured",
                (DenyReason::Forbidden, Some(AuthzSource::Cache)) => "deny_cache",
                (DenyReason::Forbidden, Some(AuthzSource::StoreUnavailable)) => {
                    "deny_fail_closed"
                }
                (DenyReason::Forbidden, _) => "deny_store",
            },
        }
    }
}

/// Metrics callback trait for recording authorization decisions
///
/// Implement this to integrate with your metrics system (Prometheus, etc.)
pub trait AuthzMetrics: Send + Sync {
    /// Record a decision outcome
    fn record_decision(&self, outcome: &str);
    /// Record decision latency
    fn record_latency(&self, seconds: f64);
    /// Record permission store round-trip time
    fn record_store_rtt(&self, seconds: f64);
}

/// No-op metrics implementation for testing
pub struct NoopMetrics;

impl AuthzMetrics for NoopMetrics {
    fn record_decision(&self, _outcome: &str) {}
    fn record_latency(&self, _seconds: f64) {}
    fn record_store_rtt(&self, _seconds: f64) {}
}

/// Check whether `identity` may perform `action` on `module`
///
/// 1. No identity -> 401 Unauthenticated
/// 2. Invalid action -> 500 Misconfigured
/// 3. Fresh cached row for `(identity, module)` -> evaluate it
/// 4. Otherwise query the store, cache the row (missing row = deny-all), evaluate
/// 5. Store failure -> allow reads, deny writes/deletes; nothing is cached
pub async fn check_authz(
    identity: Option<&Identity>,
    module: &Module,
    action: &str,
    cache: &PermissionCache,
    store: &dyn PermissionStore,
    metrics: &dyn AuthzMetrics,
) -> AuthzDecision {
    let start = std::time::Instant::now();
    let decision = decide(identity, module, action, cache, store, metrics).await;
    metrics.record_decision(decision.outcome());
    metrics.record_latency(start.elapsed().as_secs_f64());
    decision
}

async fn decide(
    identity: Option<&Identity>,
    module: &Module,
    action: &str,
    cache: &PermissionCache,
    store: &dyn PermissionStore,
    metrics: &dyn AuthzMetrics,
) -> AuthzDecision {
    let Some(identity) = identity else {
        debug!(%module, action, "No identity presented");
        return AuthzDecision::deny(DenyReason::Unauthenticated);
    };

    let action = match action.parse::<Action>() {
        Ok(action) => action,
        Err(e) => {
            warn!(%module, error = %e, "Authorization check called with invalid action");
            return AuthzDecision::deny(DenyReason::Misconfigured(e.to_string()));
        }
    };

    let key = CacheKey::new(identity.id.clone(), module.clone());
    let fetch_key = &key;
    let lookup = cache
        .get_or_fetch(&key, move || async move {
            let store_start = std::time::Instant::now();
            let result = store.fetch(&fetch_key.identity, &fetch_key.module).await;
            metrics.record_store_rtt(store_start.elapsed().as_secs_f64());
            result
        })
        .await;

    let (perms, source) = match lookup {
        Lookup::Hit(perms) => (perms, AuthzSource::Cache),
        Lookup::Fetched(perms) => (perms, AuthzSource::Store),
        Lookup::Failed(e) => {
            return match action {
                Action::Read => {
                    warn!(
                        identity = %identity.id,
                        role = %identity.role,
                        %module,
                        %action,
                        error = %e,
                        "Permission store unavailable - allowing read (fail-open)"
                    );
                    AuthzDecision::allow(AuthzSource::StoreUnavailable)
                }
                Action::Write | Action::Delete => {
                    warn!(
                        identity = %identity.id,
                        role = %identity.role,
                        %module,
                        %action,
                        error = %e,
                        "Permission store unavailable - denying mutation (fail-closed)"
                    );
                    AuthzDecision::deny_from(DenyReason::Forbidden, AuthzSource::StoreUnavailable)
                }
            };
        }
    };

    if action.permitted_by(&perms) {
        debug!(
            identity = %identity.id,
            %module,
            %action,
            source = source.as_str(),
            "Authorization: allow"
        );
        AuthzDecision::allow(source)
    } else {
        debug!(
            identity = %identity.id,
            role = %identity.role,
            %module,
            %action,
            source = source.as_str(),
            "Authorization: deny"
        );
        AuthzDecision::deny_from(DenyReason::Forbidden, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPermissionStore;
    use std::time::Duration;

    fn user(id: &str) -> Identity {
        Identity::new(id, "dispatcher")
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("read".parse::<Action>(), Ok(Action::Read));
        assert_eq!("write".parse::<Action>(), Ok(Action::Write));
        assert_eq!("delete".parse::<Action>(), Ok(Action::Delete));
        assert_eq!(
            "admin".parse::<Action>(),
            Err(AuthzError::InvalidAction("admin".to_string()))
        );
        // Case-sensitive on purpose: the calling layer passes literals
        assert!("READ".parse::<Action>().is_err());
    }

    #[tokio::test]
    async fn test_no_identity_is_unauthenticated() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();

        let decision = check_authz(
            None,
            &Module::from("vehicles"),
            "read",
            &cache,
            &store,
            &NoopMetrics,
        )
        .await;

        assert_eq!(decision, AuthzDecision::deny(DenyReason::Unauthenticated));
        assert_eq!(store.query_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_action_is_misconfiguration() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();

        let decision = check_authz(
            Some(&user("u1")),
            &Module::from("vehicles"),
            "approve",
            &cache,
            &store,
            &NoopMetrics,
        )
        .await;

        match decision {
            AuthzDecision::Deny {
                reason: reason @ DenyReason::Misconfigured(_),
                ..
            } => assert_eq!(reason.status(), 500),
            other => panic!("Expected misconfiguration, got {other:?}"),
        }
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn test_one_row_answers_every_action() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();
        store.grant("u1", "vehicles", PermissionSet::new(true, false, false));
        let module = Module::from("vehicles");
        let u1 = user("u1");

        let read = check_authz(Some(&u1), &module, "read", &cache, &store, &NoopMetrics).await;
        assert_eq!(read, AuthzDecision::allow(AuthzSource::Store));

        let write = check_authz(Some(&u1), &module, "write", &cache, &store, &NoopMetrics).await;
        assert_eq!(
            write,
            AuthzDecision::deny_from(DenyReason::Forbidden, AuthzSource::Cache)
        );

        let delete = check_authz(Some(&u1), &module, "delete", &cache, &store, &NoopMetrics).await;
        assert!(!delete.is_allowed());

        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_row_cached_as_deny() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();
        let module = Module::from("customers");
        let u1 = user("u1");

        for _ in 0..5 {
            let decision =
                check_authz(Some(&u1), &module, "read", &cache, &store, &NoopMetrics).await;
            assert!(matches!(
                decision,
                AuthzDecision::Deny {
                    reason: DenyReason::Forbidden,
                    ..
                }
            ));
        }

        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_read_fails_open() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();
        store.set_failing(true);
        let module = Module::from("vehicles");
        let u1 = user("u1");

        let decision = check_authz(Some(&u1), &module, "read", &cache, &store, &NoopMetrics).await;
        assert_eq!(decision, AuthzDecision::allow(AuthzSource::StoreUnavailable));
        assert!(cache.is_empty());

        // Not cached: the next call hits the store again
        let _ = check_authz(Some(&u1), &module, "read", &cache, &store, &NoopMetrics).await;
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_mutations_fail_closed() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();
        store.grant("u1", "vehicles", PermissionSet::new(true, true, true));
        store.set_failing(true);
        let module = Module::from("vehicles");
        let u1 = user("u1");

        for action in ["write", "delete"] {
            let decision =
                check_authz(Some(&u1), &module, action, &cache, &store, &NoopMetrics).await;
            assert_eq!(
                decision,
                AuthzDecision::deny_from(DenyReason::Forbidden, AuthzSource::StoreUnavailable)
            );
        }
        assert!(cache.is_empty());

        // Store recovers: the grant is honored immediately
        store.set_failing(false);
        let decision = check_authz(Some(&u1), &module, "write", &cache, &store, &NoopMetrics).await;
        assert_eq!(decision, AuthzDecision::allow(AuthzSource::Store));
        assert_eq!(store.query_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reuse_then_refresh() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let store = MemoryPermissionStore::new();
        store.grant("u1", "vehicles", PermissionSet::new(true, false, false));
        let module = Module::from("vehicles");
        let u1 = user("u1");

        assert!(check_authz(Some(&u1), &module, "read", &cache, &store, &NoopMetrics)
            .await
            .is_allowed());

        // Store changes are invisible while the row is fresh
        store.grant("u1", "vehicles", PermissionSet::new(true, true, false));
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(!check_authz(Some(&u1), &module, "write", &cache, &store, &NoopMetrics)
            .await
            .is_allowed());
        assert_eq!(store.query_count(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        let decision = check_authz(Some(&u1), &module, "write", &cache, &store, &NoopMetrics).await;
        assert_eq!(decision, AuthzDecision::allow(AuthzSource::Store));
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn test_identities_do_not_share_rows() {
        let cache = PermissionCache::default();
        let store = MemoryPermissionStore::new();
        store.grant("admin-1", "vehicles", PermissionSet::new(true, true, true));
        let module = Module::from("vehicles");

        let admin_id = user("admin-1");
        let admin =
            check_authz(Some(&admin_id), &module, "delete", &cache, &store, &NoopMetrics).await;
        assert!(admin.is_allowed());

        let other_id = user("u2");
        let other =
            check_authz(Some(&other_id), &module, "delete", &cache, &store, &NoopMetrics).await;
        assert!(!other.is_allowed());
        assert_eq!(store.query_count(), 2);
    }

    #[test]
    fn test_decision_outcome_labels() {
        assert_eq!(AuthzDecision::allow(AuthzSource::Cache).outcome(), "allow_cache");
        assert_eq!(
            AuthzDecision::allow(AuthzSource::StoreUnavailable).outcome(),
            "allow_fail_open"
        );
        assert_eq!(
            AuthzDecision::deny_from(DenyReason::Forbidden, AuthzSource::StoreUnavailable)
                .outcome(),
            "deny_fail_closed"
        );
        assert_eq!(
            AuthzDecision::deny(DenyReason::Unauthenticated).outcome(),
            "deny_unauthenticated"
        );
        assert_eq!(DenyReason::Forbidden.status(), 403);
    }
}
