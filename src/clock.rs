//! Time source used by buckets, breakers and the admission middleware.

use std::fmt::Debug;
use std::time::Instant;

/// Port for obtaining the current monotonic time.
///
/// Production code uses [`SystemClock`]; tests drive time explicitly with
/// `MockClock` so refill and cooldown behavior is deterministic.
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// System clock implementation using `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
pub use mock::MockClock;

#[cfg(test)]
mod mock {
    use super::Clock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Manually advanced clock. Clones share the same time value.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current_time: Arc<Mutex<Instant>>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self {
                current_time: Arc::new(Mutex::new(Instant::now())),
            }
        }

        pub fn advance(&self, duration: Duration) {
            *self.current_time.lock() += duration;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current_time.lock()
        }
    }
}
