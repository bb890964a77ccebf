//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    default_policies, default_tiers, BackendKind, PolicyConfig, Tier, DEFAULT_AGENT_PREFIX_LEN,
};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8082))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Counter backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Settings handed to a remote counter backend
    #[serde(default)]
    pub remote: RemoteStoreConfig,

    /// Seconds between sweeps of expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// User agent characters folded into client keys
    #[serde(default = "default_agent_prefix_len")]
    pub agent_prefix_len: usize,

    /// Named policies
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyConfig>,

    /// One policy per caller tier
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<Tier, PolicyConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            remote: RemoteStoreConfig::default(),
            sweep_interval_secs: default_sweep_interval(),
            agent_prefix_len: default_agent_prefix_len(),
            policies: default_policies(),
            tiers: default_tiers(),
        }
    }
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    600
}

fn default_agent_prefix_len() -> usize {
    DEFAULT_AGENT_PREFIX_LEN
}

/// Timeout and retry contract for a networked counter backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    /// Backend address
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_remote_timeout")]
    pub timeout_ms: u64,

    /// Retries after a failed call before the check fails
    #[serde(default = "default_remote_retries")]
    pub max_retries: u32,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_remote_timeout(),
            max_retries: default_remote_retries(),
        }
    }
}

fn default_remote_timeout() -> u64 {
    50
}

fn default_remote_retries() -> u32 {
    1
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file layered under
    /// `GATEKEEPER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject policies with empty windows or ceilings and incomplete tier tables.
    pub fn validate(&self) -> Result<()> {
        let rate_limiting = &self.rate_limiting;

        for (name, policy) in &rate_limiting.policies {
            policy.build(name)?;
        }
        for tier in Tier::ALL {
            let policy = rate_limiting.tiers.get(&tier).ok_or_else(|| {
                GatekeeperError::Config(format!("no policy configured for tier '{}'", tier))
            })?;
            policy.build(tier.as_str())?;
        }
        if rate_limiting.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatekeeperConfig::default();
        config.validate().unwrap();

        assert_eq!(config.server.http_addr.port(), 8082);
        assert_eq!(config.rate_limiting.backend, BackendKind::Memory);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(600));
        assert_eq!(config.rate_limiting.agent_prefix_len, 50);
        assert_eq!(config.rate_limiting.policies.len(), 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_yaml_overrides() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
rate_limiting:
  backend: distributed
  remote:
    endpoint: "redis://counters:6379"
    timeout_ms: 20
  sweep_interval_secs: 30
  policies:
    search:
      max_requests: 30
      unit: minute
logging:
  level: debug
  json: true
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.rate_limiting.backend, BackendKind::Distributed);
        assert_eq!(config.rate_limiting.remote.timeout_ms, 20);
        assert_eq!(config.rate_limiting.remote.max_retries, 1);
        assert_eq!(config.rate_limiting.policies.len(), 1);
        assert_eq!(config.rate_limiting.tiers.len(), 4);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
rate_limiting:
  policies:
    broken:
      max_requests: 0
      window_ms: 1000
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_incomplete_tier_table_rejected() {
        let yaml = r#"
rate_limiting:
  tiers:
    anonymous: { max_requests: 10, unit: minute }
"#;
        let err = GatekeeperConfig::from_yaml(yaml).err().unwrap();
        assert!(err.to_string().contains("authenticated"));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = r#"
rate_limiting:
  sweep_interval_secs: 0
"#;
        assert!(GatekeeperConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = GatekeeperConfig::load(None).unwrap();
        assert_eq!(config.rate_limiting.tiers.len(), 4);
    }

    #[test]
    fn test_load_layers_env_over_file() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9100"
rate_limiting:
  sweep_interval_secs: 120
  policies:
    search:
      max_requests: 30
      unit: minute
  tiers:
    anonymous: { max_requests: 2, unit: second }
    authenticated: { max_requests: 4, unit: second }
    premium: { max_requests: 8, window_ms: 1500 }
    admin: { max_requests: 16, unit: hour }
logging:
  level: debug
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        std::env::set_var("GATEKEEPER__LOGGING__LEVEL", "trace");
        std::env::set_var("GATEKEEPER__RATE_LIMITING__AGENT_PREFIX_LEN", "12");
        let loaded = GatekeeperConfig::load(Some(file.path()));
        std::env::remove_var("GATEKEEPER__LOGGING__LEVEL");
        std::env::remove_var("GATEKEEPER__RATE_LIMITING__AGENT_PREFIX_LEN");
        let config = loaded.unwrap();

        // From the file
        assert_eq!(config.server.http_addr.port(), 9100);
        assert_eq!(config.rate_limiting.sweep_interval_secs, 120);
        assert_eq!(config.rate_limiting.policies["search"].window_ms(), Some(60_000));
        assert_eq!(config.rate_limiting.tiers[&Tier::Premium].window_ms(), Some(1500));
        assert_eq!(config.rate_limiting.tiers[&Tier::Admin].max_requests, 16);

        // From the environment
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.rate_limiting.agent_prefix_len, 12);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(matches!(
            GatekeeperConfig::load(Some(missing.as_path())),
            Err(GatekeeperError::Config(_))
        ));
    }
}
