//! fleet-gate: request gating for the fleet telemetry dashboard
//!
//! Composes a fixed-window rate limiter ([`ratelimit_core`]) with a cached
//! role-based permission check ([`authz_core`]) in front of every protected
//! endpoint.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_gate::{GateConfig, GateRequest, RequestGate};
//!
//! let config = GateConfig::load(Path::new("/etc/fleet/gate.yaml"))?;
//! fleet_gate::init_logging(&config.logging);
//!
//! let gate = RequestGate::new(&config, store)?;
//! gate.start_sweeper()?;
//!
//! match gate.check(&request, "api", &Module::from("vehicles"), "write").await {
//!     Ok(admission) => { /* forward, adding admission.headers() */ }
//!     Err(rejection) => return rejection.into_response(),
//! }
//! ```

pub mod config;
pub mod gate;
pub mod telemetry;

pub use authz_core::{Identity, IdentityId, Module, PermissionSet, PermissionStore};
pub use config::{AuthzConfig, GateConfig, LogFormat, LoggingConfig, MODE_ENV};
pub use gate::{
    extract_bearer_token, GateAdmission, GateRejection, GateRequest, RejectionResponse,
    RequestGate, RequestMeta,
};
pub use ratelimit_core::RuntimeMode;
pub use telemetry::{init_logging, GateMetrics};

use ratelimit_core::RateLimitError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("clearing caches is not allowed in {0} mode")]
    ClearForbidden(RuntimeMode),

    #[error("invalid gate configuration: {0}")]
    Config(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}
