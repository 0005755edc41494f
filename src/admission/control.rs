//! Admission control trait for abstracting the layer behind the gRPC surface.

use std::time::Duration;

use crate::breaker::ProbeId;

use super::decision::{AdmissionTicket, Decision, Outcome, RequestIdentity};

/// Trait for admission control implementations.
///
/// Lets the gRPC service run against [`AdmissionMiddleware`](super::AdmissionMiddleware)
/// or any other implementation, e.g. a fixed-answer stub in tests.
pub trait AdmissionControl: Send + Sync {
    /// Decide whether a request may proceed.
    fn before(&self, identity: &RequestIdentity) -> Decision;

    /// Report how an admitted request ended.
    fn after(&self, ticket: AdmissionTicket, outcome: Outcome);

    /// Report a completion measured by the caller, for requests whose ticket
    /// did not travel with them. `probe` is the probe id handed out at
    /// admission, if any.
    fn complete(&self, path: &str, elapsed: Duration, failed: bool, probe: Option<ProbeId>);
}
