//! Gatekeeper - Request Admission Control
//!
//! This crate implements fixed-window rate limiting for network-facing
//! endpoints: per-client counters in a shared store, tiered policies chosen
//! by caller classification, a background sweeper that reclaims expired
//! counters, and axum middleware that turns decisions into HTTP responses.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
