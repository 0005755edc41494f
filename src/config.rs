//! Configuration management for Floodgate.

use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::ratelimit::Dimension;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Prometheus scrape endpoint; metrics are not exported when unset
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            metrics_addr: None,
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Master switch; when false every request is admitted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-user limit
    #[serde(
        default = "DimensionLimit::default_user",
        deserialize_with = "DimensionLimit::deserialize_user"
    )]
    pub user: DimensionLimit,

    /// Per-path limit
    #[serde(
        default = "DimensionLimit::default_api",
        deserialize_with = "DimensionLimit::deserialize_api"
    )]
    pub api: DimensionLimit,

    /// Per-client-IP limit
    #[serde(
        default = "DimensionLimit::default_ip",
        deserialize_with = "DimensionLimit::deserialize_ip"
    )]
    pub ip: DimensionLimit,

    /// Circuit breaker defaults applied to every path
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Paths admitted without any checks. A pattern ending in `/**` matches
    /// by prefix, anything else must match exactly.
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user: DimensionLimit::default_user(),
            api: DimensionLimit::default_api(),
            ip: DimensionLimit::default_ip(),
            breaker: BreakerConfig::default(),
            exclude_paths: default_exclude_paths(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_exclude_paths() -> Vec<String> {
    vec!["/api/auth/login".to_string(), "/api/auth/captcha".to_string()]
}

/// Token bucket settings for one limiter dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionLimit {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sustained rate in tokens per second
    pub qps: f64,
    /// Bucket size, i.e. the largest burst admitted at once
    pub burst_capacity: u64,
}

impl DimensionLimit {
    pub fn new(qps: f64, burst_capacity: u64) -> Self {
        Self {
            enabled: true,
            qps,
            burst_capacity,
        }
    }

    /// A limit that skips its dimension entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(0.0, 0)
        }
    }

    fn default_user() -> Self {
        Self::new(10.0, 20)
    }

    fn default_api() -> Self {
        Self::new(100.0, 200)
    }

    fn default_ip() -> Self {
        Self::new(20.0, 40)
    }

    fn deserialize_user<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        DimensionLimitOverride::deserialize(deserializer).map(|o| o.apply(Self::default_user()))
    }

    fn deserialize_api<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        DimensionLimitOverride::deserialize(deserializer).map(|o| o.apply(Self::default_api()))
    }

    fn deserialize_ip<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        DimensionLimitOverride::deserialize(deserializer).map(|o| o.apply(Self::default_ip()))
    }

    fn check(&self, dimension: Dimension) -> std::result::Result<(), ConfigError> {
        let field = |name: &str| format!("admission.{}.{}", dimension.as_str(), name);

        if !self.qps.is_finite() || self.qps < 0.0 {
            return Err(ConfigError::invalid(field("qps"), "must be a non-negative number"));
        }
        if self.burst_capacity == 0 {
            return Err(ConfigError::invalid(field("burst_capacity"), "must be > 0"));
        }
        Ok(())
    }
}

/// A dimension section as written; fields left out keep the dimension's
/// default.
#[derive(Debug, Deserialize)]
struct DimensionLimitOverride {
    enabled: Option<bool>,
    qps: Option<f64>,
    burst_capacity: Option<u64>,
}

impl DimensionLimitOverride {
    fn apply(self, base: DimensionLimit) -> DimensionLimit {
        DimensionLimit {
            enabled: self.enabled.unwrap_or(base.enabled),
            qps: self.qps.unwrap_or(base.qps),
            burst_capacity: self.burst_capacity.unwrap_or(base.burst_capacity),
        }
    }
}

/// How `error_threshold` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// Fraction of failed outcomes in the window, in `(0, 1]`
    Ratio,
    /// Absolute number of failed outcomes in the window
    Count,
}

/// Resolved breaker trip condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorThreshold {
    Ratio(f64),
    Count(u32),
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_threshold_mode")]
    pub threshold_mode: ThresholdMode,

    /// Failure ratio or count that trips the breaker, see `threshold_mode`
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,

    /// Number of most recent outcomes the threshold is evaluated over
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Outcomes required in the window before a ratio is evaluated
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Responses slower than this count as failures
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Probe requests admitted while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,

    /// How long the breaker stays open before probing
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_mode: default_threshold_mode(),
            error_threshold: default_error_threshold(),
            window_size: default_window_size(),
            minimum_calls: default_minimum_calls(),
            timeout_ms: default_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
            open_duration_ms: default_open_duration_ms(),
        }
    }
}

fn default_threshold_mode() -> ThresholdMode {
    ThresholdMode::Ratio
}

fn default_error_threshold() -> f64 {
    0.5
}

fn default_window_size() -> usize {
    20
}

fn default_minimum_calls() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_half_open_max_probes() -> u32 {
    3
}

fn default_open_duration_ms() -> u64 {
    30_000
}

impl BreakerConfig {
    /// The trip condition as configured.
    pub fn threshold(&self) -> ErrorThreshold {
        match self.threshold_mode {
            ThresholdMode::Ratio => ErrorThreshold::Ratio(self.error_threshold),
            ThresholdMode::Count => ErrorThreshold::Count(self.error_threshold as u32),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    fn check(&self) -> std::result::Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::invalid("admission.breaker.window_size", "must be > 0"));
        }
        if self.minimum_calls > self.window_size {
            return Err(ConfigError::invalid(
                "admission.breaker.minimum_calls",
                "must not exceed window_size",
            ));
        }
        match self.threshold_mode {
            ThresholdMode::Ratio => {
                if !(self.error_threshold > 0.0 && self.error_threshold <= 1.0) {
                    return Err(ConfigError::invalid(
                        "admission.breaker.error_threshold",
                        "ratio must be in (0, 1]",
                    ));
                }
            }
            ThresholdMode::Count => {
                if !(self.error_threshold >= 1.0
                    && self.error_threshold.fract() == 0.0
                    && self.error_threshold <= self.window_size as f64)
                {
                    return Err(ConfigError::invalid(
                        "admission.breaker.error_threshold",
                        "count must be a whole number between 1 and window_size",
                    ));
                }
            }
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("admission.breaker.timeout_ms", "must be > 0"));
        }
        if self.half_open_max_probes == 0 {
            return Err(ConfigError::invalid(
                "admission.breaker.half_open_max_probes",
                "must be > 0",
            ));
        }
        if self.open_duration_ms == 0 {
            return Err(ConfigError::invalid(
                "admission.breaker.open_duration_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

impl AdmissionConfig {
    fn limit_mut(&mut self, dimension: Dimension) -> &mut DimensionLimit {
        match dimension {
            Dimension::User => &mut self.user,
            Dimension::ApiPath => &mut self.api,
            Dimension::Ip => &mut self.ip,
        }
    }

    /// Validate the configuration, replacing every invalid part with a safe
    /// fallback instead of refusing to start.
    ///
    /// An invalid limiter dimension or breaker section is disabled and an
    /// invalid exclusion pattern is dropped. The problems found are returned
    /// so callers can report them.
    pub fn sanitize(&mut self) -> Vec<ConfigError> {
        let mut problems = Vec::new();

        for dimension in Dimension::ALL {
            let limit = self.limit_mut(dimension);
            if !limit.enabled {
                continue;
            }
            if let Err(e) = limit.check(dimension) {
                warn!(error = %e, dimension = %dimension, "Disabling limiter dimension");
                *limit = DimensionLimit::disabled();
                problems.push(e);
            }
        }

        if self.breaker.enabled {
            if let Err(e) = self.breaker.check() {
                warn!(error = %e, "Disabling circuit breaker");
                self.breaker.enabled = false;
                problems.push(e);
            }
        }

        self.exclude_paths.retain(|pattern| {
            if pattern.starts_with('/') {
                true
            } else {
                let e = ConfigError::invalid(
                    "admission.exclude_paths",
                    format!("pattern `{}` must start with `/`", pattern),
                );
                warn!(error = %e, "Dropping exclusion pattern");
                problems.push(e);
                false
            }
        });

        problems
    }
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::Load(format!("Failed to parse configuration: {}", e)).into())
    }

    /// Load configuration from an optional file overlaid with `FLOODGATE__`
    /// environment variables, e.g. `FLOODGATE__ADMISSION__IP__QPS=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, "FLOODGATE")
    }

    fn load_with_env_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<FloodgateConfig>())
            .map_err(|e| ConfigError::Load(e.to_string()).into())
    }
}
