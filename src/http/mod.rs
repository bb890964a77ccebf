//! HTTP surface: admission middleware and the check service.

pub mod admission;
mod server;
mod service;

pub use admission::{
    rate_limit_middleware, tiered_rate_limit_middleware, AdmissionState, CallerTier,
    TieredAdmissionState,
};
pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest};
