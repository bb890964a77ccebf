//! Admission check service.
//!
//! Exposes the limiters over HTTP so that a proxy or application in another
//! process can ask for a decision before running its handler.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::admission::{admit, apply_headers, unavailable_response, Admission};
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::ratelimit::{
    ClientIdentifier, CounterStore, RateLimiter, RequestDescriptor, TieredRateLimiter,
    ViolationReporter,
};

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRequest {
    /// Named policy to apply
    #[serde(default)]
    pub policy: Option<String>,
    /// Caller tier; takes precedence over `policy`
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(flatten)]
    pub descriptor: RequestDescriptor,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    tracked_keys: usize,
}

/// Shared state of the check service.
#[derive(Clone)]
pub struct AppState {
    policies: Arc<BTreeMap<String, RateLimiter>>,
    tiered: Arc<TieredRateLimiter>,
    reporter: ViolationReporter,
    store: Arc<dyn CounterStore>,
}

impl AppState {
    /// Build every configured limiter on top of one shared store.
    pub fn from_config(
        config: &RateLimitingConfig,
        store: Arc<dyn CounterStore>,
        reporter: ViolationReporter,
    ) -> Result<Self> {
        let identifier = ClientIdentifier::new(config.agent_prefix_len);

        let policies = config
            .policies
            .iter()
            .map(|(name, policy)| -> Result<(String, RateLimiter)> {
                let limiter = RateLimiter::new(policy.build(name)?, Arc::clone(&store))
                    .with_identifier(identifier);
                Ok((name.clone(), limiter))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let tiered = TieredRateLimiter::from_config(&config.tiers, Arc::clone(&store), identifier)?;

        Ok(Self {
            policies: Arc::new(policies),
            tiered: Arc::new(tiered),
            reporter,
            store,
        })
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/check", post(check))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.store.kind(),
        tracked_keys: state.store.len(),
    })
}

/// Decide whether the described request may proceed.
#[instrument(
    skip(state, request),
    fields(
        policy = ?request.policy,
        tier = ?request.tier,
        path = %request.descriptor.path
    )
)]
async fn check(State(state): State<AppState>, Json(request): Json<CheckRequest>) -> Response {
    let descriptor = &request.descriptor;

    let result = match (&request.tier, &request.policy) {
        (Some(tier), _) => state.tiered.check(descriptor, tier),
        (None, Some(name)) => match state.policies.get(name) {
            Some(limiter) => limiter.check(descriptor),
            None => {
                warn!(policy = %name, "Check requested for unknown policy");
                return (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({
                        "error": "Unknown policy",
                        "message": format!("no rate limit policy named '{}'", name),
                    })),
                )
                    .into_response();
            }
        },
        (None, None) => state.tiered.check(descriptor, "anonymous"),
    };

    let decision = match result {
        Ok(decision) => decision,
        Err(e) => return unavailable_response(&e),
    };

    debug!(
        policy = %decision.policy,
        limited = decision.is_limited,
        remaining = decision.remaining,
        "Admission decision made"
    );

    if decision.is_limited {
        state.reporter.report(descriptor, &decision);
    }

    match admit(decision) {
        Admission::Deny(response) => response,
        Admission::Proceed(decision) => {
            let mut response = Json(&decision).into_response();
            apply_headers(response.headers_mut(), &decision);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryCounterStore, PolicyConfig};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let mut config = RateLimitingConfig::default();
        config.policies.insert(
            "tiny".to_string(),
            PolicyConfig::new(1, Duration::from_secs(60)),
        );
        AppState::from_config(
            &config,
            Arc::new(MemoryCounterStore::new()),
            ViolationReporter::default(),
        )
        .unwrap()
    }

    fn check_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/check")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_named_policy_allows_then_limits() {
        let app = router(state());
        let body = serde_json::json!({
            "policy": "tiny",
            "real_ip": "10.2.3.4",
            "path": "/feedback",
            "method": "POST",
        });

        let response = app.clone().oneshot(check_request(body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        let json = body_json(response).await;
        assert_eq!(json["isLimited"], false);
        assert_eq!(json["policy"], "tiny");

        let response = app.oneshot(check_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Too many requests");
        assert!(json["retryAfter"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_tier_takes_precedence() {
        let app = router(state());
        let body = serde_json::json!({
            "policy": "tiny",
            "tier": "premium",
            "real_ip": "10.2.3.4",
            "path": "/items",
            "method": "GET",
        });

        let response = app.oneshot(check_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "500");
    }

    #[tokio::test]
    async fn test_no_policy_or_tier_is_anonymous() {
        let app = router(state());
        let body = serde_json::json!({ "path": "/", "method": "GET" });

        let response = app.oneshot(check_request(body)).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "20");
        let json = body_json(response).await;
        assert_eq!(json["policy"], "tier-anonymous");
    }

    #[tokio::test]
    async fn test_unknown_policy_is_not_found() {
        let app = router(state());
        let body = serde_json::json!({ "policy": "nope", "path": "/", "method": "GET" });

        let response = app.oneshot(check_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let state = state();
        let app = router(state.clone());

        let check = serde_json::json!({ "policy": "api", "path": "/", "method": "GET" });
        app.clone().oneshot(check_request(check)).await.unwrap();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["tracked_keys"], 1);
        assert_eq!(state.store().len(), 1);
    }
}
