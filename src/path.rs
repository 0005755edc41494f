//! Request path normalization and exclusion matching.

/// Normalize a request path so equivalent spellings share limiter and
/// breaker state.
///
/// Drops any query string or fragment, collapses repeated slashes and removes
/// a trailing slash. The root path stays `/`, and a missing leading slash is
/// added.
pub fn normalize_path(raw: &str) -> String {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let mut normalized = String::with_capacity(end + 1);

    for segment in raw[..end].split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// A configured exclusion pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Matches exactly one path
    Exact(String),
    /// Matches every path starting with the prefix (`/static/**`)
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/**") {
            Some(prefix) => PathPattern::Prefix(prefix.to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    /// Check whether a path matches this pattern.
    ///
    /// Prefix matching is purely textual, so `/static/**` also matches
    /// `/staticfiles`.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}
