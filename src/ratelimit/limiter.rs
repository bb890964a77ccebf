//! Core rate limiter implementation.
//!
//! Fixed-window counting: each key gets a counter that resets when its
//! window elapses. Memory and per-check cost are O(1) per key; a client can
//! burst up to twice the ceiling across a window boundary.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::identifier::{ClientIdentifier, RequestDescriptor};
use super::policy::Policy;
use super::store::CounterStore;
use crate::error::Result;

/// Current wall clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Scope a client key to a policy as `"{policy}|{client}"`.
///
/// `%` and `|` in the policy name are percent-encoded so the first `|`
/// always ends the policy part, whatever the client key contains.
fn store_key(policy: &str, client: &str) -> String {
    let policy = policy.replace('%', "%25").replace('|', "%7C");
    format!("{}|{}", policy, client)
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request must be rejected
    pub is_limited: bool,
    /// The policy ceiling
    pub limit: u64,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// End of the current window (ms since the Unix epoch)
    pub reset_at: u64,
    /// Seconds until the window resets; only set when limited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Window length of the policy
    pub window_ms: u64,
    /// Name of the policy that produced this decision
    pub policy: String,
    /// Store key the request was counted under
    #[serde(skip)]
    pub key: String,
}

impl Decision {
    /// Window end in whole seconds since the Unix epoch, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }
}

/// Evaluates one policy against a shared counter store.
///
/// Cheap to share behind an `Arc`; `check` never blocks on I/O with the
/// in-memory store and has no side effects besides the counter update.
pub struct RateLimiter {
    policy: Policy,
    store: Arc<dyn CounterStore>,
    identifier: ClientIdentifier,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("store", &self.store.kind())
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter for `policy` counting into `store`.
    pub fn new(policy: Policy, store: Arc<dyn CounterStore>) -> Self {
        Self {
            policy,
            store,
            identifier: ClientIdentifier::default(),
        }
    }

    /// Use a specific client identifier for keys.
    pub fn with_identifier(mut self, identifier: ClientIdentifier) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// The client key for a request: the policy's key function if it has
    /// one, otherwise the derived address/agent key.
    pub fn client_key(&self, descriptor: &RequestDescriptor) -> String {
        match self.policy.key_fn() {
            Some(key_fn) => key_fn(descriptor),
            None => self.identifier.identify(descriptor),
        }
    }

    /// Check and count a request at the current time.
    pub fn check(&self, descriptor: &RequestDescriptor) -> Result<Decision> {
        self.check_at(descriptor, now_millis())
    }

    /// Check and count a request at `now` (ms since the Unix epoch).
    pub fn check_at(&self, descriptor: &RequestDescriptor, now: u64) -> Result<Decision> {
        let key = store_key(self.policy.name(), &self.client_key(descriptor));
        let entry = self.store.hit(&key, &self.policy, now)?;

        let limit = self.policy.max_requests();
        let is_limited = entry.count > limit;
        let retry_after_seconds = is_limited
            .then(|| entry.window_reset_at.saturating_sub(now).div_ceil(1000));

        Ok(Decision {
            is_limited,
            limit,
            remaining: limit.saturating_sub(entry.count),
            count: entry.count,
            reset_at: entry.window_reset_at,
            retry_after_seconds,
            window_ms: self.policy.window_ms(),
            policy: self.policy.name().to_string(),
            key,
        })
    }

    /// Settle a reservation once the downstream outcome is known.
    ///
    /// Refunds the counted request when the policy skips this kind of
    /// outcome. Denied requests never reached the handler and are left alone.
    pub fn settle(&self, decision: &Decision, succeeded: bool) -> Result<()> {
        if decision.is_limited || !self.policy.skips_outcome(succeeded) {
            return Ok(());
        }
        self.store.release(&decision.key, decision.reset_at)
    }
}
