//! Request admission: breaker and limiter checks around each request.

mod client_ip;
mod control;
mod decision;
mod middleware;
mod sink;

pub use client_ip::{resolve_client_ip, CLIENT_IP_HEADERS, UNKNOWN_IP};
pub use control::AdmissionControl;
pub use decision::{
    AdmissionTicket, Decision, Outcome, Rejection, RejectionBody, RequestIdentity, REJECTION_STATUS,
};
pub use middleware::AdmissionMiddleware;
pub use sink::{MetricsSink, NoopSink, OutcomeEvent, OutcomeKind, OutcomeSink};
