//! Per-endpoint circuit breaker.
//!
//! A breaker starts closed and records the outcome of every admitted
//! request in a rolling window of the most recent `window_size` calls. When
//! failures in that window reach the configured threshold it opens and
//! rejects everything for `open_duration`. The first caller after the
//! cooldown moves it to half-open, where at most `half_open_max_probes`
//! requests are let through: if all of them succeed the breaker closes,
//! a single failure reopens it.
//!
//! Each probe carries a [`ProbeId`]. While half-open only outcomes reported
//! for an outstanding probe of the current half-open period count; outcomes
//! of requests admitted earlier are dropped. A probe whose outcome is not
//! reported within `timeout_ms` is treated as a timeout.
//!
//! Every transition happens under one mutex per breaker, so concurrent
//! callers observe a consistent state and can never over-grant probes.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{BreakerConfig, ErrorThreshold};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Traffic flows normally and outcomes are recorded
    Closed,
    /// Traffic is rejected until the cooldown elapses
    Open,
    /// A bounded number of probe requests test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    /// Failures in the rolling window
    pub failure_count: usize,
    /// Successes in the rolling window while closed, probe successes while half-open
    pub success_count: usize,
    pub half_open_probe_count: u32,
    /// Outcomes currently held in the rolling window
    pub window_len: usize,
    /// Time since the breaker last opened
    #[serde(skip)]
    pub open_for: Option<Duration>,
}

/// Identifies one probe admission of a breaker.
///
/// Ids are never reused by the same breaker, so an id from an earlier
/// half-open period never matches a probe of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

impl ProbeId {
    /// Rebuild an id from its wire form; `0` means "not a probe".
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(ProbeId(raw))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Result of asking a breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPermit {
    /// Closed: the request passes normally
    Granted,
    /// Half-open: the request passes as one of the bounded probes
    Probe(ProbeId),
    /// Open, or half-open with the probe budget spent
    Denied,
}

impl BreakerPermit {
    pub fn probe_id(&self) -> Option<ProbeId> {
        match self {
            BreakerPermit::Probe(id) => Some(*id),
            _ => None,
        }
    }
}

/// Outcome of a call, as fed to a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Slower than the breaker's timeout; counts as a failure
    Timeout,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Most recent outcomes, `true` for a failure
    window: VecDeque<bool>,
    window_failures: usize,
    half_open_successes: usize,
    half_open_probe_count: u32,
    /// Probes of the current half-open period still awaiting an outcome
    outstanding_probes: Vec<(ProbeId, Instant)>,
    next_probe_id: u64,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(window_size),
            window_failures: 0,
            half_open_successes: 0,
            half_open_probe_count: 0,
            outstanding_probes: Vec::new(),
            next_probe_id: 1,
            opened_at: None,
        }
    }

    fn grant_probe(&mut self, now: Instant) -> ProbeId {
        let id = ProbeId(self.next_probe_id);
        self.next_probe_id += 1;
        self.half_open_probe_count += 1;
        self.outstanding_probes.push((id, now));
        id
    }

    /// Remove an outstanding probe, returning whether it was one.
    fn settle_probe(&mut self, id: ProbeId) -> bool {
        match self.outstanding_probes.iter().position(|(p, _)| *p == id) {
            Some(index) => {
                self.outstanding_probes.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn push(&mut self, failed: bool, window_size: usize) {
        if self.window.len() >= window_size {
            if let Some(true) = self.window.pop_front() {
                self.window_failures -= 1;
            }
        }
        self.window.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
    }

    fn clear_counters(&mut self) {
        self.window.clear();
        self.window_failures = 0;
        self.half_open_successes = 0;
        self.half_open_probe_count = 0;
        self.outstanding_probes.clear();
    }
}

/// Circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock::new()))
    }

    /// Create a closed breaker that reads time from `clock`.
    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new(window_size)),
            clock,
        }
    }

    /// Get the name (normally the endpoint path) of this breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.expire_probes(&mut inner, self.clock.now());
        inner.state
    }

    /// Responses slower than this are recorded as timeouts.
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Decide whether a request may pass.
    ///
    /// While open, the first call after the cooldown moves the breaker to
    /// half-open and is admitted as its first probe. While half-open, each
    /// admitted call consumes one probe slot. A probe admitted here can only
    /// be settled through its lease expiring; use [`acquire`](Self::acquire)
    /// to report its outcome.
    pub fn allow_request(&self) -> bool {
        self.acquire() != BreakerPermit::Denied
    }

    /// Like [`allow_request`](Self::allow_request), but hands out the id of
    /// a probe admission so its outcome can be reported.
    pub fn acquire(&self) -> BreakerPermit {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.expire_probes(&mut inner, now);

        match inner.state {
            CircuitState::Closed => BreakerPermit::Granted,
            CircuitState::Open => {
                let cooled_down = inner.opened_at.map_or(true, |opened| {
                    now.saturating_duration_since(opened) >= self.config.open_duration()
                });

                if !cooled_down {
                    return BreakerPermit::Denied;
                }

                inner.state = CircuitState::HalfOpen;
                inner.clear_counters();
                info!(breaker = %self.name, "Circuit breaker half-open, probing recovery");
                BreakerPermit::Probe(inner.grant_probe(now))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probe_count < self.config.half_open_max_probes {
                    BreakerPermit::Probe(inner.grant_probe(now))
                } else {
                    BreakerPermit::Denied
                }
            }
        }
    }

    /// Give back the slot of a probe that never reached the endpoint.
    ///
    /// Does nothing if the probe already settled or belongs to an earlier
    /// half-open period.
    pub fn abandon_probe(&self, probe: ProbeId) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.settle_probe(probe) {
            inner.half_open_probe_count -= 1;
            debug!(breaker = %self.name, probe = probe.get(), "Probe slot returned");
        } else {
            trace!(breaker = %self.name, probe = probe.get(), "Ignoring stale probe");
        }
    }

    /// Record a successful response to a request admitted while closed.
    pub fn record_success(&self) {
        self.record(CallOutcome::Success, None);
    }

    /// Record a failed response to a request admitted while closed.
    pub fn record_failure(&self) {
        self.record(CallOutcome::Failure, None);
    }

    /// Record a response that exceeded the timeout. Counts as a failure.
    pub fn record_timeout(&self) {
        self.record(CallOutcome::Timeout, None);
    }

    /// Record an outcome. `probe` is the id handed out by
    /// [`acquire`](Self::acquire) when the request was admitted as a probe.
    ///
    /// While closed every outcome enters the window. While half-open only
    /// outcomes of outstanding probes count. While open nothing counts.
    pub fn record(&self, outcome: CallOutcome, probe: Option<ProbeId>) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.expire_probes(&mut inner, now);
        let failed = outcome != CallOutcome::Success;

        match inner.state {
            CircuitState::Closed => {
                inner.push(failed, self.config.window_size.max(1));
                // Evaluated after successes too: a success can complete the
                // minimum sample of a window already over the ratio.
                if self.should_trip(&inner) {
                    self.trip(&mut inner, CircuitState::Closed, now);
                }
            }
            CircuitState::HalfOpen => {
                let counts = probe.map_or(false, |id| inner.settle_probe(id));
                if !counts {
                    trace!(breaker = %self.name, outcome = ?outcome, "Ignoring non-probe outcome while half-open");
                    return;
                }

                if failed {
                    self.trip(&mut inner, CircuitState::HalfOpen, now);
                } else {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_probes as usize {
                        inner.state = CircuitState::Closed;
                        inner.opened_at = None;
                        inner.clear_counters();
                        info!(breaker = %self.name, "Circuit breaker closed, endpoint recovered");
                    }
                }
            }
            CircuitState::Open => {
                trace!(breaker = %self.name, outcome = ?outcome, "Ignoring outcome while open");
            }
        }
    }

    /// Reopen if an outstanding probe outlived the timeout without an
    /// outcome. The breaker counts as opened when that probe timed out.
    fn expire_probes(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::HalfOpen {
            return;
        }

        let lease = self.config.timeout();
        let expired_at = inner
            .outstanding_probes
            .iter()
            .map(|(_, granted_at)| *granted_at + lease)
            .filter(|deadline| now > *deadline)
            .min();

        if let Some(deadline) = expired_at {
            warn!(
                breaker = %self.name,
                timeout_ms = self.config.timeout_ms,
                "Probe outcome not reported within timeout"
            );
            self.trip(inner, CircuitState::HalfOpen, deadline);
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        match self.config.threshold() {
            ErrorThreshold::Count(count) => inner.window_failures >= count.max(1) as usize,
            ErrorThreshold::Ratio(ratio) => {
                let calls = inner.window.len();
                calls >= self.config.minimum_calls.max(1)
                    && inner.window_failures as f64 / calls as f64 >= ratio
            }
        }
    }

    fn trip(&self, inner: &mut BreakerInner, from: CircuitState, at: Instant) {
        let failures = inner.window_failures;
        let calls = inner.window.len();

        inner.state = CircuitState::Open;
        inner.opened_at = Some(at);
        inner.clear_counters();

        match from {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Circuit breaker reopened, probe failed");
            }
            _ => {
                warn!(
                    breaker = %self.name,
                    failures = failures,
                    calls = calls,
                    open_duration_ms = self.config.open_duration_ms,
                    "Circuit breaker opened"
                );
            }
        }
    }

    /// Force the breaker back to closed with empty counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.clear_counters();
    }

    /// Get a consistent view of the breaker's state and counters.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.expire_probes(&mut inner, now);
        let success_count = match inner.state {
            CircuitState::HalfOpen => inner.half_open_successes,
            _ => inner.window.len() - inner.window_failures,
        };

        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.window_failures,
            success_count,
            half_open_probe_count: inner.half_open_probe_count,
            window_len: inner.window.len(),
            open_for: inner
                .opened_at
                .map(|opened| now.saturating_duration_since(opened)),
        }
    }
}
