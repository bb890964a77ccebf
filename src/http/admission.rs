//! Translation between rate limit decisions and HTTP.
//!
//! The translator functions hold no state: a limited [`Decision`] becomes a
//! `429` response, anything else is a pass-through. The axum middleware
//! functions wire a limiter, the translator and the violation reporter
//! around a protected handler.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::GatekeeperError;
use crate::ratelimit::{
    Decision, RateLimiter, RequestDescriptor, Tier, TieredRateLimiter, ViolationReporter,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// What the HTTP layer should do with a request.
#[derive(Debug)]
pub enum Admission {
    /// Run the protected handler
    Proceed(Decision),
    /// Answer with this response instead
    Deny(Response),
}

/// JSON body of a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenialBody {
    pub error: &'static str,
    pub message: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: Option<u64>,
}

/// Map a decision to the boundary protocol.
pub fn admit(decision: Decision) -> Admission {
    if decision.is_limited {
        Admission::Deny(deny_response(&decision))
    } else {
        Admission::Proceed(decision)
    }
}

/// Attach `X-RateLimit-*` headers describing a decision.
///
/// `X-RateLimit-Reset` is the window end in epoch seconds.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

/// Build the `429 Too Many Requests` response for a limited decision.
pub fn deny_response(decision: &Decision) -> Response {
    let retry_after = decision.retry_after_seconds;
    let message = match retry_after {
        Some(secs) => format!("Rate limit exceeded. Try again in {} seconds.", secs),
        None => "Rate limit exceeded. Try again later.".to_string(),
    };
    let body = DenialBody {
        error: "Too many requests",
        message,
        retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(
        axum::http::header::RETRY_AFTER,
        HeaderValue::from(retry_after.unwrap_or(0)),
    );
    response
}

/// Response used when the limiter itself failed; the request is not let through.
pub fn unavailable_response(err: &GatekeeperError) -> Response {
    error!(error = %err, "Rate limit check failed, rejecting request");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": "Service unavailable",
            "message": "Admission control is unavailable",
        })),
    )
        .into_response()
}

/// Read the identifying attributes of an HTTP request.
pub fn descriptor_from_request(request: &Request) -> RequestDescriptor {
    let headers = request.headers();
    let header = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let real_ip = header(&X_REAL_IP).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    });

    RequestDescriptor {
        forwarded_for: header(&X_FORWARDED_FOR),
        real_ip,
        user_agent: header(&axum::http::header::USER_AGENT),
        user_id: None,
        path: request.uri().path().to_string(),
        method: request.method().as_str().to_string(),
    }
}

/// Caller tier set on the request by an upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerTier(pub String);

impl From<Tier> for CallerTier {
    fn from(tier: Tier) -> Self {
        Self(tier.as_str().to_string())
    }
}

/// State for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    pub limiter: Arc<RateLimiter>,
    pub reporter: ViolationReporter,
}

impl AdmissionState {
    pub fn new(limiter: Arc<RateLimiter>, reporter: ViolationReporter) -> Self {
        Self { limiter, reporter }
    }
}

/// Single-policy admission middleware.
///
/// ```ignore
/// let app = Router::new()
///     .route("/login", post(login))
///     .layer(axum::middleware::from_fn_with_state(state, rate_limit_middleware));
/// ```
pub async fn rate_limit_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let descriptor = descriptor_from_request(&request);
    let limiter = &state.limiter;

    let decision = match limiter.check(&descriptor) {
        Ok(decision) => decision,
        Err(e) => return unavailable_response(&e),
    };
    if decision.is_limited {
        state.reporter.report(&descriptor, &decision);
    }

    match admit(decision) {
        Admission::Deny(response) => response,
        Admission::Proceed(decision) => {
            let mut response = next.run(request).await;
            settle_outcome(&response, |succeeded| limiter.settle(&decision, succeeded));
            apply_headers(response.headers_mut(), &decision);
            response
        }
    }
}

/// State for [`tiered_rate_limit_middleware`].
#[derive(Clone)]
pub struct TieredAdmissionState {
    pub limiter: Arc<TieredRateLimiter>,
    pub reporter: ViolationReporter,
}

impl TieredAdmissionState {
    pub fn new(limiter: Arc<TieredRateLimiter>, reporter: ViolationReporter) -> Self {
        Self { limiter, reporter }
    }
}

/// Tiered admission middleware; requests without a [`CallerTier`] are anonymous.
pub async fn tiered_rate_limit_middleware(
    State(state): State<TieredAdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let descriptor = descriptor_from_request(&request);
    let tier = match request.extensions().get::<CallerTier>() {
        Some(CallerTier(name)) => state.limiter.resolve(name),
        None => Tier::Anonymous,
    };

    let decision = match state.limiter.check_tier(&descriptor, tier) {
        Ok(decision) => decision,
        Err(e) => return unavailable_response(&e),
    };

    if decision.is_limited {
        state.reporter.report(&descriptor, &decision);
    }

    match admit(decision) {
        Admission::Deny(response) => response,
        Admission::Proceed(decision) => {
            let mut response = next.run(request).await;
            settle_outcome(&response, |succeeded| {
                state.limiter.settle(tier, &decision, succeeded)
            });
            apply_headers(response.headers_mut(), &decision);
            response
        }
    }
}

/// Report the handler outcome back to the limiter. Failures only get logged.
fn settle_outcome<F>(response: &Response, settle: F)
where
    F: FnOnce(bool) -> crate::error::Result<()>,
{
    let succeeded = response.status().as_u16() < 400;
    if let Err(e) = settle(succeeded) {
        warn!(error = %e, "Failed to settle rate limit reservation");
    }
}
