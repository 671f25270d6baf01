use authz_core::AuthzMetrics;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use ratelimit_core::RateLimitDecision;
use std::fmt;

// 0.5ms .. ~4s
const DECISION_BUCKETS: (f64, f64, u16) = (0.0005, 2.0, 14);

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthzLabels {
    pub outcome: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RateLimitLabels {
    pub limiter: String,
    pub outcome: String,
}

/// Prometheus metrics for authorization and rate limit decisions
#[derive(Debug)]
pub struct GateMetrics {
    registry: Registry,
    authz_decisions: Family<AuthzLabels, Counter>,
    authz_decision_seconds: Histogram,
    authz_store_rtt_seconds: Histogram,
    ratelimit_decisions: Family<RateLimitLabels, Counter>,
}

fn decision_histogram() -> Histogram {
    let (start, factor, length) = DECISION_BUCKETS;
    Histogram::new(exponential_buckets(start, factor, length))
}

impl GateMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("fleet_gate");

        let authz_decisions = Family::<AuthzLabels, Counter>::default();
        registry.register(
            "authz_decisions",
            "Authorization decisions by outcome",
            authz_decisions.clone(),
        );

        let authz_decision_seconds = decision_histogram();
        registry.register(
            "authz_decision_seconds",
            "Time to reach an authorization decision",
            authz_decision_seconds.clone(),
        );

        let authz_store_rtt_seconds = decision_histogram();
        registry.register(
            "authz_store_rtt_seconds",
            "Permission store query round-trip time",
            authz_store_rtt_seconds.clone(),
        );

        let ratelimit_decisions = Family::<RateLimitLabels, Counter>::default();
        registry.register(
            "ratelimit_decisions",
            "Rate limit decisions by limiter and outcome",
            ratelimit_decisions.clone(),
        );

        Self {
            registry,
            authz_decisions,
            authz_decision_seconds,
            authz_store_rtt_seconds,
            ratelimit_decisions,
        }
    }

    pub fn record_ratelimit(&self, limiter: &str, decision: &RateLimitDecision) {
        self.ratelimit_decisions
            .get_or_create(&RateLimitLabels {
                limiter: limiter.to_string(),
                outcome: decision.outcome().to_string(),
            })
            .inc();
    }

    /// Render all metrics in OpenMetrics text format
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthzMetrics for GateMetrics {
    fn record_decision(&self, outcome: &str) {
        self.authz_decisions
            .get_or_create(&AuthzLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    fn record_latency(&self, seconds: f64) {
        self.authz_decision_seconds.observe(seconds);
    }

    fn record_store_rtt(&self, seconds: f64) {
        self.authz_store_rtt_seconds.observe(seconds);
    }
}
