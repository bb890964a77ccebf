//! Violation reporting, off the admission path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::identifier::{ClientIdentifier, RequestDescriptor};
use super::limiter::Decision;
use crate::error::Result;

/// A structured record of one denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    /// Client address only; the agent string is never reported
    pub client: String,
    pub path: String,
    pub method: String,
    pub policy: String,
    pub limit: u64,
    pub attempts: u64,
    pub window_ms: u64,
}

/// Destination for violation records (log pipeline, alerting, ...).
#[async_trait]
pub trait ViolationSink: Send + Sync {
    async fn emit(&self, record: &ViolationRecord) -> Result<()>;
}

/// Writes violations to the `tracing` pipeline at `WARN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ViolationSink for TracingSink {
    async fn emit(&self, record: &ViolationRecord) -> Result<()> {
        warn!(
            timestamp = %record.timestamp.to_rfc3339(),
            client = %record.client,
            path = %record.path,
            method = %record.method,
            policy = %record.policy,
            limit = record.limit,
            attempts = record.attempts,
            window_ms = record.window_ms,
            "Rate limit exceeded"
        );
        Ok(())
    }
}

/// Hands denied decisions to a sink on a background task.
///
/// Sink failures are logged and dropped; they never reach the caller.
#[derive(Clone)]
pub struct ViolationReporter {
    sink: Arc<dyn ViolationSink>,
    identifier: ClientIdentifier,
}

impl Default for ViolationReporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl ViolationReporter {
    pub fn new(sink: Arc<dyn ViolationSink>) -> Self {
        Self {
            sink,
            identifier: ClientIdentifier::default(),
        }
    }

    /// Build the record for a denied decision. Allowed decisions yield `None`.
    pub fn record(&self, descriptor: &RequestDescriptor, decision: &Decision) -> Option<ViolationRecord> {
        if !decision.is_limited {
            return None;
        }

        Some(ViolationRecord {
            timestamp: Utc::now(),
            client: self.identifier.client_address(descriptor).to_string(),
            path: descriptor.path.clone(),
            method: descriptor.method.clone(),
            policy: decision.policy.clone(),
            limit: decision.limit,
            attempts: decision.count,
            window_ms: decision.window_ms,
        })
    }

    /// Report a denied decision without waiting for the sink.
    ///
    /// Returns the spawned task, or `None` when nothing was reported (the
    /// decision was not limited, or no tokio runtime is available).
    pub fn report(&self, descriptor: &RequestDescriptor, decision: &Decision) -> Option<JoinHandle<()>> {
        let record = self.record(descriptor, decision)?;

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(client = %record.client, "No runtime available, dropping violation report");
                return None;
            }
        };

        let sink = Arc::clone(&self.sink);
        Some(runtime.spawn(async move {
            if let Err(e) = sink.emit(&record).await {
                warn!(error = %e, client = %record.client, "Failed to report rate limit violation");
            }
        }))
    }
}
