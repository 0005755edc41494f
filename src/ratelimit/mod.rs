//! Rate limiting logic and state management.

mod bucket;
mod dimension;
mod limiter;

pub use bucket::TokenBucket;
pub use dimension::{Dimension, LimiterKey};
pub use limiter::LimiterRegistry;
