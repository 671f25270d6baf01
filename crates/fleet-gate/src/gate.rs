//! Request gate composing rate limiting and authorization
//!
//! Every protected endpoint names a limiter and, optionally, a
//! `(module, action)` pair. The limiter runs first so rejected floods never
//! reach the permission store.

use crate::config::GateConfig;
use crate::telemetry::GateMetrics;
use crate::GateError;
use authz_core::{
    check_authz, AuthzDecision, AuthzSource, CacheKey, DenyReason, IdentityId, Module,
    PermissionCache, PermissionStore,
};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use http::{HeaderMap, StatusCode};
use ratelimit_core::{BucketStore, RateLimitDecision, RateLimiter, RequestContext, RuntimeMode};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub use authz_core::Identity;

pub const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Transport-level request attributes
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub client_ip: Option<IpAddr>,
    /// Overrides the `User-Agent` header when set
    pub user_agent: Option<String>,
    pub headers: HeaderMap,
}

impl RequestMeta {
    pub fn new(client_ip: Option<IpAddr>, headers: HeaderMap) -> Self {
        Self {
            client_ip,
            user_agent: None,
            headers,
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent
            .as_deref()
            .or_else(|| self.headers.get(USER_AGENT).and_then(|v| v.to_str().ok()))
    }
}

/// A request as seen by the gate
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    /// Set only if upstream token verification succeeded
    pub identity: Option<Identity>,
    pub meta: RequestMeta,
}

impl GateRequest {
    pub fn new(identity: Option<Identity>, meta: RequestMeta) -> Self {
        Self { identity, meta }
    }

    fn context(&self) -> RequestContext<'_> {
        RequestContext {
            identity: self.identity.as_ref().map(|i| i.id.as_str()),
            client_ip: self.meta.client_ip,
            user_agent: self.meta.user_agent(),
            bearer_token: extract_bearer_token(&self.meta.headers),
        }
    }
}

/// Extract the caller's credential from request headers.
///
/// Reads `Authorization: Bearer <token>` and falls back to `X-API-Key`.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// A request that passed the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateAdmission {
    pub ratelimit: RateLimitDecision,
    /// `None` when only the limiter was consulted
    pub authz: Option<AuthzSource>,
}

impl GateAdmission {
    /// `X-RateLimit-*` headers for the response, if the request was metered
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let RateLimitDecision::Allow {
            limit, remaining, ..
        } = self.ratelimit
        {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
        }
        headers
    }
}

/// Why the gate turned a request away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    RateLimited {
        limiter: String,
        retry_after: Duration,
        limit: u32,
        status: u16,
        message: String,
    },
    Denied(DenyReason),
}

/// Response to send for a rejected request
#[derive(Debug, Clone)]
pub struct RejectionResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl GateRejection {
    pub fn status(&self) -> StatusCode {
        let code = match self {
            GateRejection::RateLimited { status, .. } => *status,
            GateRejection::Denied(reason) => reason.status(),
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn into_response(self) -> RejectionResponse {
        let status = self.status();
        let mut headers = HeaderMap::new();
        let body = match self {
            GateRejection::RateLimited {
                retry_after,
                message,
                ..
            } => {
                let secs = retry_after.as_secs();
                headers.insert(RETRY_AFTER, HeaderValue::from(secs));
                json!({ "error": message, "retry_after": secs })
            }
            GateRejection::Denied(reason) => json!({ "error": reason.message() }),
        };
        RejectionResponse {
            status,
            headers,
            body,
        }
    }
}

/// Rate limiting and permission checks for all protected endpoints
pub struct RequestGate {
    mode: RuntimeMode,
    permissions: Arc<PermissionCache>,
    store: Arc<dyn PermissionStore>,
    buckets: Arc<BucketStore>,
    limiters: HashMap<String, RateLimiter>,
    cleanup_interval: Duration,
    metrics: Arc<GateMetrics>,
}

impl RequestGate {
    pub fn new(config: &GateConfig, store: Arc<dyn PermissionStore>) -> Result<Self, GateError> {
        config
            .ratelimit
            .validate()
            .map_err(|e| GateError::Config(format!("{e:#}")))?;
        if config.authz.ttl.is_zero() {
            return Err(GateError::Config(
                "authorization cache TTL must be greater than zero".to_string(),
            ));
        }

        let buckets = Arc::new(BucketStore::new());
        let limiters = config
            .ratelimit
            .limiters
            .iter()
            .map(|l| {
                let limiter = RateLimiter::new(l.clone(), config.mode, buckets.clone());
                (l.name.clone(), limiter)
            })
            .collect();

        Ok(Self {
            mode: config.mode,
            permissions: Arc::new(PermissionCache::new(config.authz.ttl)),
            store,
            buckets,
            limiters,
            cleanup_interval: config.ratelimit.cleanup_interval(),
            metrics: Arc::new(GateMetrics::new()),
        })
    }

    /// Share a metrics registry with other components
    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Start the bucket sweeper. Returns `Ok(false)` if already running.
    pub fn start_sweeper(&self) -> Result<bool, GateError> {
        Ok(self.buckets.start_sweeper(self.cleanup_interval)?)
    }

    pub fn stop_sweeper(&self) -> bool {
        self.buckets.stop_sweeper()
    }

    /// Run the named limiter, then the permission check.
    pub async fn check(
        &self,
        req: &GateRequest,
        limiter: &str,
        module: &Module,
        action: &str,
    ) -> Result<GateAdmission, GateRejection> {
        let ratelimit = self.admit(req, limiter)?;
        let authz = self.authorize(req, module, action).await?;
        Ok(GateAdmission {
            ratelimit,
            authz: Some(authz),
        })
    }

    /// Run only the named limiter, for endpoints without a module
    /// (e.g. login).
    pub fn check_rate(
        &self,
        req: &GateRequest,
        limiter: &str,
    ) -> Result<GateAdmission, GateRejection> {
        let ratelimit = self.admit(req, limiter)?;
        Ok(GateAdmission {
            ratelimit,
            authz: None,
        })
    }

    fn admit(&self, req: &GateRequest, name: &str) -> Result<RateLimitDecision, GateRejection> {
        let Some(limiter) = self.limiters.get(name) else {
            error!(limiter = name, "Endpoint references an unknown rate limiter");
            return Err(GateRejection::Denied(DenyReason::Misconfigured(format!(
                "unknown rate limiter {name:?}"
            ))));
        };

        let decision = limiter.admit(&req.context());
        self.metrics.record_ratelimit(name, &decision);

        match decision {
            RateLimitDecision::LimitExceeded { retry_after, limit } => {
                let config = limiter.config();
                debug!(
                    limiter = name,
                    identity = req.identity.as_ref().map(|i| i.id.as_str()),
                    "Request rate limited"
                );
                Err(GateRejection::RateLimited {
                    limiter: name.to_string(),
                    retry_after,
                    limit,
                    status: config.status,
                    message: config.message.clone(),
                })
            }
            other => Ok(other),
        }
    }

    async fn authorize(
        &self,
        req: &GateRequest,
        module: &Module,
        action: &str,
    ) -> Result<AuthzSource, GateRejection> {
        let decision = check_authz(
            req.identity.as_ref(),
            module,
            action,
            &self.permissions,
            self.store.as_ref(),
            self.metrics.as_ref(),
        )
        .await;

        match decision {
            AuthzDecision::Allow { source } => Ok(source),
            AuthzDecision::Deny { reason, .. } => Err(GateRejection::Denied(reason)),
        }
    }

    /// Drop one cached permission row after its store row was edited
    pub fn invalidate_permissions(&self, identity: &IdentityId, module: &Module) {
        self.permissions
            .invalidate(&CacheKey::new(identity.clone(), module.clone()));
    }

    /// Empty both caches so tests start from a clean state.
    ///
    /// Refused in production mode.
    pub fn clear_caches(&self) -> Result<(), GateError> {
        if self.mode.is_production() {
            return Err(GateError::ClearForbidden(self.mode));
        }
        self.permissions.clear();
        self.buckets.clear();
        info!(mode = %self.mode, "Cleared permission and rate limit caches");
        Ok(())
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn permissions(&self) -> &PermissionCache {
        &self.permissions
    }

    pub fn buckets(&self) -> &BucketStore {
        &self.buckets
    }

    pub fn limiter(&self, name: &str) -> Option<&RateLimiter> {
        self.limiters.get(name)
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }
}
