//! Lazily populated breaker per endpoint path.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::config::BreakerConfig;
use crate::path::normalize_path;

/// Owns one [`CircuitBreaker`] per normalized path.
///
/// Breakers are never evicted; path cardinality is bounded by the routes the
/// protected service exposes.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    /// Settings applied to every breaker created by this registry
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Get the breaker for `path`, creating it on first reference.
    pub fn get(&self, path: &str) -> Arc<CircuitBreaker> {
        let path = normalize_path(path);

        if let Some(breaker) = self.breakers.get(&path) {
            return Arc::clone(breaker.value());
        }

        let entry = self.breakers.entry(path.clone()).or_insert_with(|| {
            debug!(breaker = %path, "Creating new circuit breaker");
            Arc::new(CircuitBreaker::with_clock(
                path.clone(),
                self.config.clone(),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Get a snapshot of an existing breaker without creating one.
    pub fn snapshot(&self, path: &str) -> Option<BreakerSnapshot> {
        let breaker = self
            .breakers
            .get(&normalize_path(path))
            .map(|b| Arc::clone(b.value()))?;
        Some(breaker.snapshot())
    }

    /// Get the number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// The settings new breakers are created with.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}
