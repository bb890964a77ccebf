//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// Admission denial is not an error; it is a [`Decision`](crate::ratelimit::Decision)
/// with `is_limited` set.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A counter backend was selected that has no registered implementation
    #[error("Counter backend not supported: {0}")]
    BackendNotSupported(String),

    /// A registered counter backend failed to answer
    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Violation sink failures
    #[error("Violation reporter error: {0}")]
    Reporter(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
