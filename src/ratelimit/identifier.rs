//! Client identification from request attributes.

use serde::{Deserialize, Serialize};

/// Sentinel used when no address or agent string is available.
pub const UNKNOWN: &str = "unknown";

/// Default number of user agent characters folded into a client key.
pub const DEFAULT_AGENT_PREFIX_LEN: usize = 50;

/// The identifying attributes of an inbound request.
///
/// Supplied read-only by the HTTP layer; nothing here is ever mutated by
/// the admission path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Raw `X-Forwarded-For` header value (may hold a comma separated chain)
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Direct peer address or `X-Real-IP` value
    #[serde(default)]
    pub real_ip: Option<String>,
    /// Raw `User-Agent` header value
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Authenticated user id, if an upstream layer resolved one
    #[serde(default)]
    pub user_id: Option<String>,
    /// Request path
    #[serde(default)]
    pub path: String,
    /// Request method
    #[serde(default)]
    pub method: String,
}

impl RequestDescriptor {
    /// Create a descriptor for a path and method with no identifying attributes.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    pub fn with_user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent = Some(value.into());
        self
    }

    pub fn with_user_id(mut self, value: impl Into<String>) -> Self {
        self.user_id = Some(value.into());
        self
    }
}

/// Derives stable client keys from request descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentifier {
    agent_prefix_len: usize,
}

impl Default for ClientIdentifier {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_PREFIX_LEN)
    }
}

impl ClientIdentifier {
    /// Create an identifier that folds at most `agent_prefix_len` characters
    /// of the user agent into each key.
    pub fn new(agent_prefix_len: usize) -> Self {
        Self { agent_prefix_len }
    }

    /// The address portion of the key.
    ///
    /// Prefers the first forwarded address, then the direct address, then
    /// the `unknown` sentinel.
    pub fn client_address<'a>(&self, descriptor: &'a RequestDescriptor) -> &'a str {
        descriptor
            .forwarded_for
            .as_deref()
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .or_else(|| {
                descriptor
                    .real_ip
                    .as_deref()
                    .map(str::trim)
                    .filter(|addr| !addr.is_empty())
            })
            .unwrap_or(UNKNOWN)
    }

    /// Build the client key: `"{address}:{agent prefix}"`.
    ///
    /// Never fails; a descriptor with no attributes yields `"unknown:unknown"`.
    pub fn identify(&self, descriptor: &RequestDescriptor) -> String {
        let address = self.client_address(descriptor);
        let agent: String = match descriptor.user_agent.as_deref().map(str::trim) {
            Some(agent) if !agent.is_empty() => agent.chars().take(self.agent_prefix_len).collect(),
            _ => UNKNOWN.to_string(),
        };

        format!("{}:{}", address, agent)
    }
}
