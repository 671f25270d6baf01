//! Rate limit configuration parsing and validation
//!
//! Supports YAML configuration of named fixed-window limiters.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Process runtime mode
///
/// `Test` switches key derivation to deterministic, token-based keys and
/// honors per-limiter test bypass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    #[default]
    Production,
    Development,
    Test,
}

impl RuntimeMode {
    pub fn is_test(&self) -> bool {
        matches!(self, RuntimeMode::Test)
    }

    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeMode::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeMode::Production => "production",
            RuntimeMode::Development => "development",
            RuntimeMode::Test => "test",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(RuntimeMode::Production),
            "development" | "dev" => Ok(RuntimeMode::Development),
            "test" => Ok(RuntimeMode::Test),
            other => anyhow::bail!("unknown runtime mode {other:?}"),
        }
    }
}

/// Rate limiter set configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// How often the background sweep removes expired buckets
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,

    /// Named limiters
    #[serde(default = "default_limiters")]
    pub limiters: Vec<LimiterConfig>,
}

/// A single fixed-window limiter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterConfig {
    /// Name endpoints refer to this limiter by
    pub name: String,

    /// Bucket key prefix (defaults to `name`)
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Window duration in milliseconds
    pub window_ms: u64,

    /// Maximum admitted requests per window
    pub max_requests: u32,

    /// Message returned in the rejection body
    #[serde(default = "default_message")]
    pub message: String,

    /// HTTP status returned on rejection
    #[serde(default = "default_status")]
    pub status: u16,

    /// Admit unconditionally when running in test mode
    #[serde(default)]
    pub test_bypass: bool,
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

fn default_status() -> u16 {
    429
}

fn default_limiters() -> Vec<LimiterConfig> {
    vec![
        LimiterConfig::new("api", Duration::from_secs(60), 200),
        LimiterConfig::new("auth", Duration::from_secs(15 * 60), 10)
            .with_message("Too many authentication attempts, please try again later."),
        LimiterConfig::new("telemetry", Duration::from_secs(60), 600)
            .with_message("Telemetry rate limit exceeded, please slow down.")
            .with_test_bypass(true),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            limiters: default_limiters(),
        }
    }
}

impl LimiterConfig {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self {
            name: name.into(),
            key_prefix: None,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_requests,
            message: default_message(),
            status: default_status(),
            test_bypass: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_test_bypass(mut self, bypass: bool) -> Self {
        self.test_bypass = bypass;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn prefix(&self) -> &str {
        self.key_prefix.as_deref().unwrap_or(&self.name)
    }

    /// Check the limiter is usable
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("limiter name must not be empty");
        }
        if self.prefix().trim().is_empty() {
            anyhow::bail!("limiter {:?}: key prefix must not be empty", self.name);
        }
        if self.window_ms == 0 {
            anyhow::bail!("limiter {:?}: windowMs must be greater than zero", self.name);
        }
        if self.max_requests == 0 {
            anyhow::bail!("limiter {:?}: maxRequests must be greater than zero", self.name);
        }
        if !(400..=599).contains(&self.status) {
            anyhow::bail!(
                "limiter {:?}: status {} is not an HTTP error status",
                self.name,
                self.status
            );
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read rate limit config from {}", path.display()))?;

        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .with_context(|| "Failed to parse rate limit config YAML")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every limiter and reject duplicate names or prefixes
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_interval_seconds == 0 {
            anyhow::bail!("cleanupIntervalSeconds must be greater than zero");
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for limiter in &self.limiters {
            limiter.validate()?;
            if !names.insert(limiter.name.as_str()) {
                anyhow::bail!("duplicate limiter name {:?}", limiter.name);
            }
            // Limiters share one bucket store, so prefixes must not collide
            if !prefixes.insert(limiter.prefix()) {
                anyhow::bail!("duplicate limiter key prefix {:?}", limiter.prefix());
            }
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Find a limiter by name
    pub fn limiter(&self, name: &str) -> Option<&LimiterConfig> {
        self.limiters.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        config.validate().unwrap();

        let api = config.limiter("api").unwrap();
        assert_eq!(api.max_requests, 200);
        assert_eq!(api.window(), Duration::from_secs(60));
        assert_eq!(api.status, 429);
        assert!(!api.test_bypass);

        assert!(config.limiter("telemetry").unwrap().test_bypass);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
cleanupIntervalSeconds: 30
limiters:
  - name: api
    windowMs: 60000
    maxRequests: 200
  - name: login
    keyPrefix: "rl:login"
    windowMs: 15000
    maxRequests: 10
    message: "Too many login attempts"
    status: 503
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.cleanup_interval_seconds, 30);
        assert_eq!(config.limiters.len(), 2);

        let login = config.limiter("login").unwrap();
        assert_eq!(login.prefix(), "rl:login");
        assert_eq!(login.window(), Duration::from_millis(15_000));
        assert_eq!(login.message, "Too many login attempts");
        assert_eq!(login.status, 503);

        // Defaults fill in the rest
        let api = config.limiter("api").unwrap();
        assert_eq!(api.prefix(), "api");
        assert_eq!(api.status, 429);
    }

    #[test]
    fn test_missing_limiters_uses_presets() {
        let config = Config::from_yaml("cleanupIntervalSeconds: 5").unwrap();
        assert!(config.limiter("auth").is_some());
    }

    #[test]
    fn test_rejects_zero_max() {
        let yaml = r#"
limiters:
  - name: api
    windowMs: 60000
    maxRequests: 0
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("maxRequests"));
    }

    #[test]
    fn test_rejects_zero_window_and_bad_status() {
        assert!(LimiterConfig::new("a", Duration::ZERO, 1).validate().is_err());
        assert!(LimiterConfig::new("a", Duration::from_secs(1), 1)
            .with_status(200)
            .validate()
            .is_err());
    }

    #[test]
    fn test_rejects_duplicate_prefix() {
        let yaml = r#"
limiters:
  - name: api
    windowMs: 60000
    maxRequests: 10
  - name: other
    keyPrefix: api
    windowMs: 60000
    maxRequests: 10
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("prefix"));
    }

    #[test]
    fn test_runtime_mode_parse() {
        assert_eq!("test".parse::<RuntimeMode>().unwrap(), RuntimeMode::Test);
        assert_eq!(" Production ".parse::<RuntimeMode>().unwrap(), RuntimeMode::Production);
        assert_eq!("dev".parse::<RuntimeMode>().unwrap(), RuntimeMode::Development);
        assert!("staging".parse::<RuntimeMode>().is_err());
        assert_eq!(RuntimeMode::default(), RuntimeMode::Production);
    }
}
