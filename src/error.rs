//! Error types for the Floodgate service.

use thiserror::Error;

use crate::ratelimit::Dimension;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The configuration source could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(String),

    /// A field holds a value the service cannot run with.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Reasons an admission check turns a request away.
///
/// These never escape the admission layer as errors; they are carried inside
/// a [`Rejection`](crate::admission::Rejection) and answered directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// A limiter dimension ran out of tokens for this key.
    #[error("rate limited on {dimension} `{key}`")]
    RateLimited { dimension: Dimension, key: String },

    /// The endpoint's circuit breaker is not admitting traffic.
    #[error("circuit open for `{path}`")]
    CircuitOpen { path: String },
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
