use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use authz_core::DEFAULT_TTL;
use ratelimit_core::RuntimeMode;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configured runtime mode
pub const MODE_ENV: &str = "FLEET_GATE_MODE";

/// Resolved gate configuration
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub mode: RuntimeMode,
    pub authz: AuthzConfig,
    pub ratelimit: ratelimit_core::Config,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthzConfig {
    /// Lifetime of a cached permission row
    pub ttl: Duration,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawGateConfig {
    mode: Option<RuntimeMode>,
    #[serde(default)]
    authz: RawAuthzConfig,
    #[serde(default)]
    ratelimit: ratelimit_core::Config,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawAuthzConfig {
    ttl_seconds: Option<u64>,
}

impl GateConfig {
    /// Load configuration from a YAML file, applying environment overrides
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read gate config from {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string, applying environment overrides
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let raw: RawGateConfig =
            serde_yaml::from_str(yaml).context("Failed to parse gate config YAML")?;
        resolve(raw, parse::<RuntimeMode>(MODE_ENV)?)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> anyhow::Result<Self> {
        resolve(RawGateConfig::default(), parse::<RuntimeMode>(MODE_ENV)?)
    }

    pub fn with_mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }
}

fn resolve(raw: RawGateConfig, mode_override: Option<RuntimeMode>) -> anyhow::Result<GateConfig> {
    let ttl = match raw.authz.ttl_seconds {
        Some(0) => anyhow::bail!("authz.ttlSeconds must be greater than zero"),
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_TTL,
    };

    raw.ratelimit
        .validate()
        .context("Invalid ratelimit configuration")?;

    Ok(GateConfig {
        mode: mode_override.or(raw.mode).unwrap_or_default(),
        authz: AuthzConfig { ttl },
        ratelimit: raw.ratelimit,
        logging: raw.logging,
    })
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
    <T as FromStr>::Err: ToString,
{
    match env::var(env) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|e: <T as FromStr>::Err| {
                anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(yaml: &str) -> RawGateConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_full_config() {
        let config = resolve(
            raw(r#"
mode: test
authz:
  ttlSeconds: 30
ratelimit:
  cleanupIntervalSeconds: 10
  limiters:
    - name: api
      windowMs: 60000
      maxRequests: 200
    - name: auth
      windowMs: 15000
      maxRequests: 10
      message: "Too many authentication attempts, please try again later."
logging:
  filter: "fleet_gate=debug"
  format: json
"#),
            None,
        )
        .unwrap();

        assert_eq!(config.mode, RuntimeMode::Test);
        assert_eq!(config.authz.ttl, Duration::from_secs(30));
        assert_eq!(config.ratelimit.cleanup_interval(), Duration::from_secs(10));
        assert_eq!(config.ratelimit.limiter("auth").unwrap().max_requests, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter.as_deref(), Some("fleet_gate=debug"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = resolve(raw("{}"), None).unwrap();
        assert_eq!(config.mode, RuntimeMode::Production);
        assert_eq!(config.authz.ttl, DEFAULT_TTL);
        assert!(config.ratelimit.limiter("api").is_some());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_mode_override_wins() {
        let config = resolve(raw("mode: production"), Some(RuntimeMode::Test)).unwrap();
        assert_eq!(config.mode, RuntimeMode::Test);
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = resolve(raw("authz: { ttlSeconds: 0 }"), None).unwrap_err();
        assert!(err.to_string().contains("ttlSeconds"));
    }

    #[test]
    fn test_rejects_invalid_limiter() {
        let yaml = r#"
ratelimit:
  limiters:
    - name: api
      windowMs: 0
      maxRequests: 10
"#;
        let err = resolve(raw(yaml), None).unwrap_err();
        assert!(format!("{err:#}").contains("windowMs"));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(serde_yaml::from_str::<RawGateConfig>("ttl: 5").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = GateConfig::load(Path::new("/nonexistent/fleet-gate.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read gate config"));
    }
}
