//! Outcome reporting.

use metrics::{counter, histogram};
use std::fmt::Debug;
use std::time::Duration;

use super::decision::Rejection;
use crate::error::AdmissionError;

/// How a completed request was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::Timeout => "timeout",
        }
    }
}

/// A completed request, as reported to an [`OutcomeSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub path: String,
    pub kind: OutcomeKind,
    pub elapsed: Duration,
}

/// Receives request outcomes and rejections, e.g. for monitoring.
pub trait OutcomeSink: Send + Sync + Debug {
    fn record_outcome(&self, event: &OutcomeEvent);

    fn record_rejection(&self, _path: &str, _rejection: &Rejection) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl OutcomeSink for NoopSink {
    fn record_outcome(&self, _event: &OutcomeEvent) {}
}

/// Publishes outcomes through the `metrics` facade.
///
/// Emits `floodgate_requests_total{path, outcome}`,
/// `floodgate_request_duration_seconds{path}` and
/// `floodgate_rejections_total{path, reason}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl OutcomeSink for MetricsSink {
    fn record_outcome(&self, event: &OutcomeEvent) {
        counter!(
            "floodgate_requests_total",
            "path" => event.path.clone(),
            "outcome" => event.kind.as_str()
        )
        .increment(1);
        histogram!("floodgate_request_duration_seconds", "path" => event.path.clone())
            .record(event.elapsed.as_secs_f64());
    }

    fn record_rejection(&self, path: &str, rejection: &Rejection) {
        let reason = match &rejection.reason {
            AdmissionError::RateLimited { dimension, .. } => dimension.as_str(),
            AdmissionError::CircuitOpen { .. } => "circuit_open",
        };
        counter!(
            "floodgate_rejections_total",
            "path" => path.to_string(),
            "reason" => reason
        )
        .increment(1);
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingSink;

#[cfg(test)]
mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub outcomes: Mutex<Vec<OutcomeEvent>>,
        pub rejections: Mutex<Vec<(String, Rejection)>>,
    }

    impl OutcomeSink for RecordingSink {
        fn record_outcome(&self, event: &OutcomeEvent) {
            self.outcomes.lock().push(event.clone());
        }

        fn record_rejection(&self, path: &str, rejection: &Rejection) {
            self.rejections
                .lock()
                .push((path.to_string(), rejection.clone()));
        }
    }
}
