//! Token bucket implementation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::clock::Clock;

/// A token bucket that refills lazily at a fixed rate up to its capacity.
///
/// Buckets start full. Refill and consumption happen inside one critical
/// section, so concurrent callers can never jointly take more tokens than
/// the bucket holds.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: u64,
    /// Tokens added per second
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    /// Create a new, full bucket.
    ///
    /// A non-finite or negative `refill_rate` is treated as zero, which turns
    /// the bucket into a fixed quota.
    pub fn new(capacity: u64, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let refill_rate = if refill_rate.is_finite() {
            refill_rate.max(0.0)
        } else {
            0.0
        };
        let now = clock.now();

        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill_at: now,
            }),
            clock,
        }
    }

    /// Try to take `n` tokens.
    ///
    /// Returns `true` if the tokens were taken, `false` if the bucket does not
    /// currently hold enough. Requests larger than the capacity always fail.
    pub fn try_acquire(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.capacity {
            return false;
        }

        let mut state = self.state.lock();
        self.refill(&mut state);

        let wanted = n as f64;
        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Try to take a single token.
    pub fn try_acquire_one(&self) -> bool {
        self.try_acquire(1)
    }

    /// Get the number of tokens currently available, after refilling.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill_at);
        state.last_refill_at = now;

        if self.refill_rate > 0.0 {
            let refilled = state.tokens + elapsed.as_secs_f64() * self.refill_rate;
            state.tokens = refilled.min(self.capacity as f64);
        }
    }
}
