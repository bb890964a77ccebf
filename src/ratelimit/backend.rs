//! Counter backend selection.
//!
//! The backend is chosen by configuration. Only the in-memory store ships
//! with the crate; a networked store is plugged in by registering a factory
//! for [`BackendKind::Distributed`]. Selecting a backend nobody registered is
//! a hard error, so a misconfigured deployment never runs without limits.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::store::{CounterStore, MemoryCounterStore};
use crate::config::RateLimitingConfig;
use crate::error::{GatekeeperError, Result};

/// Counter backend kinds selectable in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, lost on restart
    #[default]
    Memory,
    /// Shared store reached over the network
    Distributed,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Distributed => "distributed",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a counter store from the rate limiting configuration.
pub type BackendFactory =
    Arc<dyn Fn(&RateLimitingConfig) -> Result<Arc<dyn CounterStore>> + Send + Sync>;

/// Registered counter backend factories.
pub struct BackendRegistry {
    factories: RwLock<HashMap<BackendKind, BackendFactory>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<BackendKind> = self.factories.read().keys().copied().collect();
        f.debug_struct("BackendRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl BackendRegistry {
    /// A registry with no backends at all.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the in-memory backend registered.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(BackendKind::Memory, |_config: &RateLimitingConfig| {
            let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
            Ok(store)
        });
        registry
    }

    /// Register (or replace) the factory for a backend kind.
    pub fn register<F>(&self, kind: BackendKind, factory: F)
    where
        F: Fn(&RateLimitingConfig) -> Result<Arc<dyn CounterStore>> + Send + Sync + 'static,
    {
        self.factories.write().insert(kind, Arc::new(factory));
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        self.factories.read().contains_key(&kind)
    }

    /// Build the store selected by `config.backend`.
    pub fn build(&self, config: &RateLimitingConfig) -> Result<Arc<dyn CounterStore>> {
        let factory = self
            .factories
            .read()
            .get(&config.backend)
            .cloned()
            .ok_or_else(|| {
                GatekeeperError::BackendNotSupported(format!(
                    "no '{}' counter backend is registered",
                    config.backend
                ))
            })?;

        let store = factory(config)?;
        info!(backend = %config.backend, "Counter store initialized");
        Ok(store)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
