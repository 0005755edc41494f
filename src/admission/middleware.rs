//! Composition of breakers and limiters into a single admission decision.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::control::AdmissionControl;
use super::decision::{AdmissionTicket, Decision, Outcome, Rejection, RequestIdentity};
use super::sink::{NoopSink, OutcomeEvent, OutcomeKind, OutcomeSink};
use crate::breaker::{BreakerPermit, BreakerRegistry, CallOutcome, CircuitBreaker, ProbeId};
use crate::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::path::{normalize_path, PathPattern};
use crate::ratelimit::{Dimension, LimiterRegistry};

/// Admission layer wrapped around every request.
///
/// `before` consults the path's breaker, then the user, path and IP limiters,
/// stopping at the first refusal. `after` feeds the outcome back to the
/// breaker and the outcome sink.
#[derive(Debug)]
pub struct AdmissionMiddleware {
    enabled: bool,
    breaker_enabled: bool,
    exclusions: Vec<PathPattern>,
    limiters: Arc<LimiterRegistry>,
    breakers: Arc<BreakerRegistry>,
    sink: Arc<dyn OutcomeSink>,
    clock: Arc<dyn Clock>,
}

impl AdmissionMiddleware {
    /// Build the layer and its registries from `config`.
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Build the layer with every time-based decision reading `clock`.
    pub fn with_clock(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        let limiters = Arc::new(LimiterRegistry::with_clock(config, Arc::clone(&clock)));
        let breakers = Arc::new(BreakerRegistry::with_clock(
            config.breaker.clone(),
            Arc::clone(&clock),
        ));
        Self::from_parts(config, limiters, breakers, clock)
    }

    /// Build the layer around registries owned elsewhere.
    pub fn from_parts(
        config: &AdmissionConfig,
        limiters: Arc<LimiterRegistry>,
        breakers: Arc<BreakerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            breaker_enabled: config.breaker.enabled,
            exclusions: config
                .exclude_paths
                .iter()
                .map(|p| PathPattern::parse(p))
                .collect(),
            limiters,
            breakers,
            sink: Arc::new(NoopSink),
            clock,
        }
    }

    /// Forward outcomes and rejections to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.limiters
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Check whether a normalized path bypasses admission entirely.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclusions.iter().any(|p| p.matches(path))
    }

    /// Decide whether a request may proceed.
    pub fn before(&self, identity: &RequestIdentity) -> Decision {
        let path = normalize_path(&identity.path);
        let now = self.clock.now();

        if !self.enabled || self.is_excluded(&path) {
            trace!(path = %path, "Admitting without checks");
            return Decision::Admit(AdmissionTicket::untracked(path, now));
        }

        let mut breaker: Option<(Arc<CircuitBreaker>, Option<ProbeId>)> = None;
        if self.breaker_enabled {
            let b = self.breakers.get(&path);
            let permit = b.acquire();
            if permit == BreakerPermit::Denied {
                return self.reject(&path, AdmissionError::CircuitOpen { path: path.clone() });
            }
            breaker = Some((b, permit.probe_id()));
        }

        let checks = [
            (Dimension::User, identity.user_id.as_deref()),
            (Dimension::ApiPath, Some(path.as_str())),
            (Dimension::Ip, identity.ip.as_deref()),
        ];
        for (dimension, key) in checks {
            if self.limiters.try_acquire_for(dimension, key) {
                continue;
            }
            if let Some((b, Some(probe))) = &breaker {
                b.abandon_probe(*probe);
            }
            let key = key.unwrap_or_default().to_string();
            return self.reject(&path, AdmissionError::RateLimited { dimension, key });
        }

        let ticket = match breaker {
            Some((b, probe)) => AdmissionTicket::tracked(path, now, b, probe),
            None => AdmissionTicket::untracked(path, now),
        };
        Decision::Admit(ticket)
    }

    /// Report how an admitted request ended.
    pub fn after(&self, mut ticket: AdmissionTicket, outcome: Outcome) {
        let elapsed = self.clock.now().saturating_duration_since(ticket.started_at());
        let kind = self.classify(elapsed, outcome.is_failure());

        if let Some(breaker) = ticket.breaker() {
            Self::feed(breaker, ticket.path(), kind, elapsed, ticket.probe_id());
        }
        ticket.settle();

        self.sink.record_outcome(&OutcomeEvent {
            path: ticket.path().to_string(),
            kind,
            elapsed,
        });
    }

    /// Report a completion whose elapsed time the caller measured.
    ///
    /// `probe` must be the id from the admitted ticket when the request was a
    /// half-open probe; without it the outcome is ignored while half-open.
    pub fn complete(&self, path: &str, elapsed: Duration, failed: bool, probe: Option<ProbeId>) {
        let path = normalize_path(path);
        let kind = self.classify(elapsed, failed);

        if self.enabled && self.breaker_enabled && !self.is_excluded(&path) {
            Self::feed(&self.breakers.get(&path), &path, kind, elapsed, probe);
        }

        self.sink.record_outcome(&OutcomeEvent {
            path,
            kind,
            elapsed,
        });
    }

    fn classify(&self, elapsed: Duration, failed: bool) -> OutcomeKind {
        if elapsed > self.breakers.config().timeout() {
            OutcomeKind::Timeout
        } else if failed {
            OutcomeKind::Failure
        } else {
            OutcomeKind::Success
        }
    }

    fn feed(
        breaker: &CircuitBreaker,
        path: &str,
        kind: OutcomeKind,
        elapsed: Duration,
        probe: Option<ProbeId>,
    ) {
        let outcome = match kind {
            OutcomeKind::Timeout => {
                warn!(
                    path = %path,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = breaker.timeout().as_millis() as u64,
                    "Request exceeded timeout"
                );
                CallOutcome::Timeout
            }
            OutcomeKind::Failure => {
                debug!(path = %path, "Request failed");
                CallOutcome::Failure
            }
            OutcomeKind::Success => CallOutcome::Success,
        };
        breaker.record(outcome, probe);
    }

    fn reject(&self, path: &str, reason: AdmissionError) -> Decision {
        match &reason {
            AdmissionError::RateLimited { dimension, key } => {
                warn!(dimension = %dimension, key = %key, path = %path, "Request rate limited");
            }
            AdmissionError::CircuitOpen { .. } => {
                warn!(path = %path, "Request rejected by open circuit");
            }
        }
        let rejection = Rejection::new(reason);
        self.sink.record_rejection(path, &rejection);
        Decision::Reject(rejection)
    }
}

impl AdmissionControl for AdmissionMiddleware {
    fn before(&self, identity: &RequestIdentity) -> Decision {
        AdmissionMiddleware::before(self, identity)
    }

    fn after(&self, ticket: AdmissionTicket, outcome: Outcome) {
        AdmissionMiddleware::after(self, ticket, outcome)
    }

    fn complete(&self, path: &str, elapsed: Duration, failed: bool, probe: Option<ProbeId>) {
        AdmissionMiddleware::complete(self, path, elapsed, failed, probe)
    }
}
