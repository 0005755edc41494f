//! Request identity, admission decisions and rejection payloads.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::breaker::{CircuitBreaker, ProbeId};
use crate::error::AdmissionError;

/// HTTP status answered for every rejection.
///
/// Rate-limit and circuit-open rejections share this status; clients cannot
/// tell them apart by status alone.
pub const REJECTION_STATUS: u16 = 429;

const RATE_LIMITED_MESSAGE: &str = "Too many requests, please retry later";
const CIRCUIT_OPEN_MESSAGE: &str = "Service temporarily unavailable, please retry later";

/// Who is asking for what.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Authenticated user, `None` for anonymous requests
    pub user_id: Option<String>,
    /// Request path as received; normalized by the middleware
    pub path: String,
    /// Client IP, `None` when it could not be determined
    pub ip: Option<String>,
}

impl RequestIdentity {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// Proof of admission, handed back to the middleware on completion.
///
/// Dropping a ticket that holds a half-open probe without completing it
/// returns the probe slot to the breaker.
#[derive(Debug)]
pub struct AdmissionTicket {
    path: String,
    started_at: Instant,
    breaker: Option<Arc<CircuitBreaker>>,
    probe: Option<ProbeId>,
    settled: bool,
}

impl AdmissionTicket {
    pub(crate) fn tracked(
        path: String,
        started_at: Instant,
        breaker: Arc<CircuitBreaker>,
        probe: Option<ProbeId>,
    ) -> Self {
        Self {
            path,
            started_at,
            breaker: Some(breaker),
            probe,
            settled: false,
        }
    }

    /// A ticket for a request admitted without checks (excluded path or
    /// admission disabled). Its outcome is not fed to any breaker.
    pub(crate) fn untracked(path: String, started_at: Instant) -> Self {
        Self {
            path,
            started_at,
            breaker: None,
            probe: None,
            settled: false,
        }
    }

    /// The normalized path the request was admitted for.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Whether this request is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// The probe id to report with the outcome, if this is a probe.
    pub fn probe_id(&self) -> Option<ProbeId> {
        self.probe
    }

    /// Whether the outcome of this request feeds a breaker.
    pub fn is_tracked(&self) -> bool {
        self.breaker.is_some()
    }

    pub(crate) fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub(crate) fn settle(&mut self) {
        self.settled = true;
    }

    /// Give up local ownership of the outcome, e.g. when completion will be
    /// reported later through [`complete`](super::AdmissionMiddleware::complete).
    pub fn detach(mut self) {
        self.settled = true;
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let (Some(breaker), Some(probe)) = (&self.breaker, self.probe) {
            breaker.abandon_probe(probe);
        }
    }
}

/// How an admitted request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler produced a response with this status code
    Responded(u16),
    /// The handler failed without producing a response
    Errored,
}

impl Outcome {
    /// Errors and server-error statuses are failures.
    pub fn is_failure(&self) -> bool {
        match self {
            Outcome::Responded(status) => *status >= 500,
            Outcome::Errored => true,
        }
    }
}

/// JSON body written for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub code: u16,
    pub message: String,
}

/// A request turned away by the admission layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: AdmissionError,
}

impl Rejection {
    pub fn new(reason: AdmissionError) -> Self {
        Self { reason }
    }

    /// HTTP status to answer with.
    pub fn status(&self) -> u16 {
        REJECTION_STATUS
    }

    pub fn body(&self) -> RejectionBody {
        let message = match self.reason {
            AdmissionError::RateLimited { .. } => RATE_LIMITED_MESSAGE,
            AdmissionError::CircuitOpen { .. } => CIRCUIT_OPEN_MESSAGE,
        };
        RejectionBody {
            code: REJECTION_STATUS,
            message: message.to_string(),
        }
    }

    /// Serialized [`RejectionBody`].
    pub fn to_json(&self) -> String {
        // A struct of a number and a string always serializes.
        serde_json::to_string(&self.body()).unwrap_or_default()
    }
}

/// Result of [`before`](super::AdmissionMiddleware::before).
#[derive(Debug)]
pub enum Decision {
    Admit(AdmissionTicket),
    Reject(Rejection),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Reject(rejection) => Some(rejection),
            Decision::Admit(_) => None,
        }
    }
}
