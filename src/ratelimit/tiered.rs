//! Tier-based policy selection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::identifier::{ClientIdentifier, RequestDescriptor};
use super::limiter::{now_millis, Decision, RateLimiter};
use super::policy::{Policy, PolicyConfig};
use super::store::CounterStore;
use crate::error::{GatekeeperError, Result};

/// Caller classification supplied by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Authenticated,
    Premium,
    Admin,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Anonymous, Tier::Authenticated, Tier::Premium, Tier::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }

    /// Parse a tier name, ignoring ASCII case.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(name.trim()))
    }

    fn policy_name(&self) -> String {
        format!("tier-{}", self.as_str())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The default tier table: 20, 100, 500 and 1000 requests per minute.
pub fn default_tiers() -> BTreeMap<Tier, PolicyConfig> {
    let minute = Duration::from_secs(60);
    BTreeMap::from([
        (Tier::Anonymous, PolicyConfig::new(20, minute)),
        (Tier::Authenticated, PolicyConfig::new(100, minute)),
        (Tier::Premium, PolicyConfig::new(500, minute)),
        (Tier::Admin, PolicyConfig::new(1000, minute)),
    ])
}

/// Holds one rate limiter per tier, all counting into the same store.
#[derive(Debug)]
pub struct TieredRateLimiter {
    limiters: HashMap<Tier, RateLimiter>,
}

impl TieredRateLimiter {
    /// Build from one policy per tier. Every tier must be present.
    pub fn new(
        policies: BTreeMap<Tier, Policy>,
        store: Arc<dyn CounterStore>,
        identifier: ClientIdentifier,
    ) -> Result<Self> {
        if let Some(missing) = Tier::ALL.iter().find(|tier| !policies.contains_key(*tier)) {
            return Err(GatekeeperError::Config(format!(
                "no rate limit policy configured for tier '{}'",
                missing
            )));
        }

        let limiters = policies
            .into_iter()
            .map(|(tier, policy)| {
                let limiter =
                    RateLimiter::new(policy, Arc::clone(&store)).with_identifier(identifier);
                (tier, limiter)
            })
            .collect();

        Ok(Self { limiters })
    }

    /// Build from the declarative tier table.
    pub fn from_config(
        tiers: &BTreeMap<Tier, PolicyConfig>,
        store: Arc<dyn CounterStore>,
        identifier: ClientIdentifier,
    ) -> Result<Self> {
        let policies = tiers
            .iter()
            .map(|(tier, config)| -> Result<(Tier, Policy)> {
                Ok((*tier, config.build(&tier.policy_name())?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Self::new(policies, store, identifier)
    }

    /// The limiter serving a tier.
    pub fn limiter(&self, tier: Tier) -> &RateLimiter {
        // new() guarantees every tier has a limiter
        &self.limiters[&tier]
    }

    /// Resolve a tier name, falling back to `anonymous` for unknown names.
    pub fn resolve(&self, tier: &str) -> Tier {
        Tier::parse(tier).unwrap_or_else(|| {
            warn!(tier = %tier, "Unknown caller tier, applying anonymous policy");
            Tier::Anonymous
        })
    }

    /// Check a request against the policy of the named tier.
    pub fn check(&self, descriptor: &RequestDescriptor, tier: &str) -> Result<Decision> {
        self.check_at(descriptor, tier, now_millis())
    }

    pub fn check_at(&self, descriptor: &RequestDescriptor, tier: &str, now: u64) -> Result<Decision> {
        self.check_tier_at(descriptor, self.resolve(tier), now)
    }

    pub fn check_tier(&self, descriptor: &RequestDescriptor, tier: Tier) -> Result<Decision> {
        self.check_tier_at(descriptor, tier, now_millis())
    }

    pub fn check_tier_at(
        &self,
        descriptor: &RequestDescriptor,
        tier: Tier,
        now: u64,
    ) -> Result<Decision> {
        self.limiter(tier).check_at(descriptor, now)
    }

    /// Settle a reservation made under `tier`.
    pub fn settle(&self, tier: Tier, decision: &Decision, succeeded: bool) -> Result<()> {
        self.limiter(tier).settle(decision, succeeded)
    }
}
