//! Keyed token bucket registry.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::bucket::TokenBucket;
use super::dimension::{Dimension, LimiterKey};
use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, DimensionLimit};

/// Owns one token bucket per `(dimension, key)` pair.
///
/// Buckets are created on first use with the limit passed to that first call
/// and are never evicted, so the number of buckets grows with the number of
/// distinct users, paths and client IPs seen by the process.
#[derive(Debug)]
pub struct LimiterRegistry {
    /// Token buckets indexed by limiter key
    buckets: DashMap<LimiterKey, Arc<TokenBucket>>,
    user: DimensionLimit,
    api: DimensionLimit,
    ip: DimensionLimit,
    clock: Arc<dyn Clock>,
}

impl LimiterRegistry {
    /// Create a registry with the per-dimension limits from `config`.
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a registry that reads time from `clock`.
    pub fn with_clock(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            user: config.user,
            api: config.api,
            ip: config.ip,
            clock,
        }
    }

    /// Take one token from the bucket for `(dimension, key)`, creating the
    /// bucket with `qps` and `burst_capacity` if it does not exist yet.
    ///
    /// An empty key means the identity is absent and always succeeds.
    pub fn try_acquire(&self, dimension: Dimension, key: &str, qps: f64, burst_capacity: u64) -> bool {
        if key.is_empty() {
            return true;
        }

        let limiter_key = LimiterKey::new(dimension, key);

        trace!(key = %limiter_key, "Checking rate limit");

        // Clone the handle out so the map shard is released before the
        // bucket lock is taken.
        let bucket = match self.buckets.get(&limiter_key) {
            Some(bucket) => Arc::clone(bucket.value()),
            None => {
                let entry = self.buckets.entry(limiter_key).or_insert_with(|| {
                    debug!(
                        dimension = %dimension,
                        key = key,
                        qps = qps,
                        burst_capacity = burst_capacity,
                        "Creating new token bucket"
                    );
                    Arc::new(TokenBucket::new(burst_capacity, qps, Arc::clone(&self.clock)))
                });
                Arc::clone(entry.value())
            }
        };

        bucket.try_acquire_one()
    }

    /// Check the configured per-user limit. `None` skips the dimension.
    pub fn try_acquire_for_user(&self, user_id: Option<&str>) -> bool {
        self.acquire_configured(Dimension::User, user_id)
    }

    /// Check the configured per-path limit.
    pub fn try_acquire_for_api(&self, path: &str) -> bool {
        self.acquire_configured(Dimension::ApiPath, Some(path))
    }

    /// Check the configured per-IP limit. `None` skips the dimension.
    pub fn try_acquire_for_ip(&self, ip: Option<&str>) -> bool {
        self.acquire_configured(Dimension::Ip, ip)
    }

    /// Check the configured limit for any dimension.
    pub fn try_acquire_for(&self, dimension: Dimension, key: Option<&str>) -> bool {
        self.acquire_configured(dimension, key)
    }

    /// Get the limit this registry applies to a dimension.
    pub fn limit(&self, dimension: Dimension) -> DimensionLimit {
        match dimension {
            Dimension::User => self.user,
            Dimension::ApiPath => self.api,
            Dimension::Ip => self.ip,
        }
    }

    fn acquire_configured(&self, dimension: Dimension, key: Option<&str>) -> bool {
        let limit = self.limit(dimension);
        match key {
            Some(key) if limit.enabled => {
                self.try_acquire(dimension, key, limit.qps, limit.burst_capacity)
            }
            _ => true,
        }
    }

    /// Get the tokens currently available for a key, if its bucket exists.
    pub fn available_tokens(&self, dimension: Dimension, key: &str) -> Option<f64> {
        let limiter_key = LimiterKey::new(dimension, key);
        let bucket = self.buckets.get(&limiter_key).map(|b| Arc::clone(b.value()))?;
        Some(bucket.available_tokens())
    }

    /// Drop every bucket, e.g. after limits have been reconfigured.
    pub fn clear(&self) {
        let dropped = self.buckets.len();
        self.buckets.clear();
        info!(dropped = dropped, "Cleared all token buckets");
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn registry(config: &AdmissionConfig) -> (LimiterRegistry, MockClock) {
        let clock = MockClock::new();
        (LimiterRegistry::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn config_with(user: DimensionLimit, api: DimensionLimit, ip: DimensionLimit) -> AdmissionConfig {
        AdmissionConfig {
            user,
            api,
            ip,
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_creation() {
        let (limiter, _clock) = registry(&AdmissionConfig::default());
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_try_acquire_creates_bucket() {
        let (limiter, _clock) = registry(&AdmissionConfig::default());

        assert!(limiter.try_acquire(Dimension::User, "alice", 1.0, 2));
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.available_tokens(Dimension::User, "alice"), Some(1.0));
    }

    #[test]
    fn test_existing_bucket_keeps_its_first_configuration() {
        let (limiter, _clock) = registry(&AdmissionConfig::default());

        assert!(limiter.try_acquire(Dimension::ApiPath, "/a", 0.0, 1));
        assert!(!limiter.try_acquire(Dimension::ApiPath, "/a", 100.0, 100));
    }

    #[test]
    fn test_empty_identity_is_skipped() {
        let (limiter, _clock) = registry(&AdmissionConfig::default());

        assert!(limiter.try_acquire(Dimension::User, "", 0.0, 1));
        assert!(limiter.try_acquire_for_user(None));
        assert!(limiter.try_acquire_for_ip(None));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_configured_limits_per_dimension() {
        let config = config_with(
            DimensionLimit::new(0.0, 1),
            DimensionLimit::new(0.0, 2),
            DimensionLimit::new(0.0, 3),
        );
        let (limiter, _clock) = registry(&config);

        assert!(limiter.try_acquire_for_user(Some("u1")));
        assert!(!limiter.try_acquire_for_user(Some("u1")));

        assert!(limiter.try_acquire_for_api("/orders"));
        assert!(limiter.try_acquire_for_api("/orders"));
        assert!(!limiter.try_acquire_for_api("/orders"));

        for _ in 0..3 {
            assert!(limiter.try_acquire_for_ip(Some("10.0.0.1")));
        }
        assert!(!limiter.try_acquire_for_ip(Some("10.0.0.1")));
    }

    #[test]
    fn test_disabled_dimension_always_admits() {
        let config = config_with(
            DimensionLimit::disabled(),
            DimensionLimit::new(0.0, 1),
            DimensionLimit::new(0.0, 1),
        );
        let (limiter, _clock) = registry(&config);

        for _ in 0..100 {
            assert!(limiter.try_acquire_for_user(Some("u1")));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_same_identity_in_different_dimensions_is_independent() {
        let config = config_with(
            DimensionLimit::new(0.0, 1),
            DimensionLimit::new(0.0, 1),
            DimensionLimit::new(0.0, 1),
        );
        let (limiter, _clock) = registry(&config);

        assert!(limiter.try_acquire_for_user(Some("shared")));
        assert!(limiter.try_acquire_for_ip(Some("shared")));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_refill_through_registry() {
        let config = config_with(
            DimensionLimit::new(5.0, 10),
            DimensionLimit::disabled(),
            DimensionLimit::disabled(),
        );
        let (limiter, clock) = registry(&config);

        for _ in 0..10 {
            assert!(limiter.try_acquire_for_user(Some("bob")));
        }
        assert!(!limiter.try_acquire_for_user(Some("bob")));

        clock.advance(Duration::from_secs(1));

        for _ in 0..5 {
            assert!(limiter.try_acquire_for_user(Some("bob")));
        }
        assert!(!limiter.try_acquire_for_user(Some("bob")));
    }

    #[test]
    fn test_clear_buckets() {
        let (limiter, _clock) = registry(&AdmissionConfig::default());

        limiter.try_acquire_for_api("/a");
        limiter.try_acquire_for_api("/b");
        assert_eq!(limiter.bucket_count(), 2);

        limiter.clear();
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.available_tokens(Dimension::ApiPath, "/a"), None);
    }

    #[test]
    fn test_concurrent_distinct_ips_do_not_interfere() {
        let config = config_with(
            DimensionLimit::disabled(),
            DimensionLimit::disabled(),
            DimensionLimit::new(0.0, 50),
        );
        let (limiter, _clock) = registry(&config);
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["192.168.0.1", "192.168.0.2"]
            .into_iter()
            .map(|ip| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..80).filter(|_| limiter.try_acquire_for_ip(Some(ip))).count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 50);
        }
        assert_eq!(limiter.available_tokens(Dimension::Ip, "192.168.0.1"), Some(0.0));
        assert_eq!(limiter.available_tokens(Dimension::Ip, "192.168.0.2"), Some(0.0));
    }

    #[test]
    fn test_concurrent_first_use_creates_single_bucket() {
        let config = config_with(
            DimensionLimit::new(0.0, 10),
            DimensionLimit::disabled(),
            DimensionLimit::disabled(),
        );
        let (limiter, _clock) = registry(&config);
        let limiter = Arc::new(limiter);
        let granted = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        if limiter.try_acquire_for_user(Some("carol")) {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(granted.load(Ordering::SeqCst), 10);
    }
}
