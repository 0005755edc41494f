//! Limiter dimensions and key generation.

use serde::{Deserialize, Serialize};

/// The axis along which requests are rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Per authenticated user id
    User,
    /// Per normalized API path
    ApiPath,
    /// Per client IP address
    Ip,
}

impl Dimension {
    /// All dimensions, in the order the admission middleware evaluates them.
    pub const ALL: [Dimension; 3] = [Dimension::User, Dimension::ApiPath, Dimension::Ip];

    /// Short name used in logs, metrics labels and rejection payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::User => "user",
            Dimension::ApiPath => "api",
            Dimension::Ip => "ip",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies a token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The dimension this bucket limits
    pub dimension: Dimension,
    /// User id, normalized path or client IP
    pub identity: String,
}

impl LimiterKey {
    /// Create a new limiter key.
    pub fn new(dimension: Dimension, identity: &str) -> Self {
        Self {
            dimension,
            identity: identity.to_string(),
        }
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dimension, self.identity)
    }
}
