//! Rate limit policies and the configured policy table.
//!
//! A policy is immutable once built. Policies are declared in configuration
//! by name (`auth`, `api`, ...) and as one policy per caller tier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::identifier::RequestDescriptor;
use crate::error::{GatekeeperError, Result};

/// Custom key derivation overriding the default client identifier.
pub type KeyFn = Arc<dyn Fn(&RequestDescriptor) -> String + Send + Sync>;

/// Time unit accepted in policy configuration as an alternative to `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Declarative form of a policy, as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum requests allowed per window
    pub max_requests: u64,
    /// Window length in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// Window length as a unit, used when `window_ms` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
    /// Refund the reservation when the downstream handler succeeds
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Refund the reservation when the downstream handler fails
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl PolicyConfig {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: Some(window.as_millis() as u64),
            unit: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    /// Resolved window length in milliseconds.
    pub fn window_ms(&self) -> Option<u64> {
        self.window_ms
            .or_else(|| self.unit.map(|unit| unit.duration().as_millis() as u64))
    }

    /// Check the declared values and build a named policy.
    pub fn build(&self, name: &str) -> Result<Policy> {
        if name.is_empty() || name.contains('|') {
            return Err(GatekeeperError::Config(format!(
                "policy name '{}' must be non-empty and must not contain '|'",
                name
            )));
        }
        let window_ms = self.window_ms().ok_or_else(|| {
            GatekeeperError::Config(format!("policy '{}' needs window_ms or unit", name))
        })?;
        if window_ms == 0 {
            return Err(GatekeeperError::Config(format!(
                "policy '{}' must have a positive window",
                name
            )));
        }
        if self.max_requests == 0 {
            return Err(GatekeeperError::Config(format!(
                "policy '{}' must allow at least one request",
                name
            )));
        }

        Ok(Policy {
            name: name.to_string(),
            window_ms,
            max_requests: self.max_requests,
            key_fn: None,
            skip_successful_requests: self.skip_successful_requests,
            skip_failed_requests: self.skip_failed_requests,
        })
    }
}

/// An immutable rate limit policy: at most `max_requests` per `window_ms`.
#[derive(Clone)]
pub struct Policy {
    name: String,
    window_ms: u64,
    max_requests: u64,
    key_fn: Option<KeyFn>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("custom_key", &self.key_fn.is_some())
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .finish()
    }
}

impl Policy {
    /// Create a policy. Zero values are clamped to one.
    pub fn new(name: impl Into<String>, max_requests: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            window_ms: (window.as_millis() as u64).max(1),
            max_requests: max_requests.max(1),
            key_fn: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    /// Replace client identification with a custom key function.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn with_skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn with_skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn key_fn(&self) -> Option<&KeyFn> {
        self.key_fn.as_ref()
    }

    pub fn skip_successful_requests(&self) -> bool {
        self.skip_successful_requests
    }

    pub fn skip_failed_requests(&self) -> bool {
        self.skip_failed_requests
    }

    /// Whether a finished request with the given outcome should be refunded.
    pub fn skips_outcome(&self, succeeded: bool) -> bool {
        if succeeded {
            self.skip_successful_requests
        } else {
            self.skip_failed_requests
        }
    }
}

/// The default named policy table.
///
/// auth 5 per 15 minutes, api 100 per minute, payment 10 per hour,
/// feedback 5 per minute.
pub fn default_policies() -> BTreeMap<String, PolicyConfig> {
    let mut policies = BTreeMap::new();
    policies.insert(
        "auth".to_string(),
        PolicyConfig::new(5, Duration::from_secs(15 * 60)),
    );
    policies.insert("api".to_string(), PolicyConfig::new(100, Duration::from_secs(60)));
    policies.insert(
        "payment".to_string(),
        PolicyConfig::new(10, Duration::from_secs(3600)),
    );
    policies.insert(
        "feedback".to_string(),
        PolicyConfig::new(5, Duration::from_secs(60)),
    );
    policies
}
