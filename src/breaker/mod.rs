//! Circuit breaking for downstream endpoints.

mod circuit_breaker;
mod registry;

pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CallOutcome, CircuitBreaker, CircuitState, ProbeId,
};
pub use registry::BreakerRegistry;
