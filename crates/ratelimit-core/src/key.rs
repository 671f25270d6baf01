//! Bucket key derivation
//!
//! Keys are derived by an ordered list of strategies; the first strategy that
//! applies to a request wins.

use crate::config::RuntimeMode;
use crate::RateLimitError;
use std::net::IpAddr;

const UNKNOWN: &str = "unknown";

/// Request attributes consulted when deriving a bucket key
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext<'a> {
    /// Authenticated identity, if upstream verification succeeded
    pub identity: Option<&'a str>,
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<&'a str>,
    /// Raw bearer credential, only used for deterministic test keys
    pub bearer_token: Option<&'a str>,
}

impl<'a> RequestContext<'a> {
    fn identity(&self) -> Option<&'a str> {
        self.identity.filter(|s| !s.is_empty())
    }

    fn bearer_token(&self) -> Option<&'a str> {
        self.bearer_token.filter(|s| !s.is_empty())
    }

    fn client_addr(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn user_agent(&self) -> &'a str {
        self.user_agent.filter(|s| !s.is_empty()).unwrap_or(UNKNOWN)
    }
}

/// One way of turning a request into a bucket key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// `prefix:user:<identity>:<ip>:<user-agent>`. A token replayed from
    /// another client lands in a separate bucket.
    AuthenticatedSession,
    /// Test mode only: `prefix:test:<sha256(token)>` or `prefix:test:unauthenticated`
    DeterministicTest,
    /// `prefix:public:<ip>:<user-agent>`. Always applies: a request with no
    /// resolved address shares the `unknown` bucket for its user agent.
    PublicClient,
}

/// Strategies in priority order
pub const DEFAULT_STRATEGIES: &[KeyStrategy] = &[
    KeyStrategy::AuthenticatedSession,
    KeyStrategy::DeterministicTest,
    KeyStrategy::PublicClient,
];

impl KeyStrategy {
    /// Derive the key, or `None` if this strategy does not apply
    pub fn derive(
        &self,
        prefix: &str,
        ctx: &RequestContext<'_>,
        mode: RuntimeMode,
    ) -> Option<String> {
        match self {
            KeyStrategy::AuthenticatedSession => {
                let identity = ctx.identity()?;
                Some(format!(
                    "{prefix}:user:{identity}:{}:{}",
                    ctx.client_addr(),
                    ctx.user_agent()
                ))
            }
            KeyStrategy::DeterministicTest => {
                if !mode.is_test() {
                    return None;
                }
                Some(match ctx.bearer_token() {
                    Some(token) => format!("{prefix}:test:{}", sha256_hex(token)),
                    None => format!("{prefix}:test:unauthenticated"),
                })
            }
            KeyStrategy::PublicClient => Some(format!(
                "{prefix}:public:{}:{}",
                ctx.client_addr(),
                ctx.user_agent()
            )),
        }
    }
}

/// Run `strategies` in order and return the first derived key
pub fn derive_key(
    strategies: &[KeyStrategy],
    prefix: &str,
    ctx: &RequestContext<'_>,
    mode: RuntimeMode,
) -> Result<String, RateLimitError> {
    strategies
        .iter()
        .find_map(|strategy| strategy.derive(prefix, ctx, mode))
        .ok_or_else(|| {
            RateLimitError::KeyDerivation(
                "no configured key strategy applies to this request".to_string(),
            )
        })
}

/// Compute SHA-256 hash of input string, returned as lowercase hex
///
/// Used to keep raw bearer tokens out of bucket keys
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let out = hasher.finalize();
    base16ct::lower::encode_string(&out)
}
