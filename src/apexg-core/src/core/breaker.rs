use crate::models::BreakerSpec;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    /// Open and past its open duration, the next request becomes the trial.
    pub probeable: bool,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-service breaker driven only by live request outcomes.
///
/// Every transition happens under one mutex, so the check for the
/// half-open trial slot and its reservation are a single step.
#[derive(Debug)]
pub struct CircuitBreaker {
    service_id: String,
    threshold: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
}

/// Returned when the breaker rejects a request without contacting the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOpen;

impl CircuitBreaker {
    pub fn new(service_id: &str, spec: &BreakerSpec) -> Arc<Self> {
        Arc::new(Self {
            service_id: service_id.to_string(),
            threshold: spec.failure_threshold.max(1),
            open_duration: Duration::from_millis(spec.open_duration_ms),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failures,
            probeable: self.probeable(&inner, Instant::now()),
        }
    }

    fn probeable(&self, inner: &Inner, now: Instant) -> bool {
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => inner
                .opened_at
                .map(|at| now.saturating_duration_since(at) >= self.open_duration)
                .unwrap_or(true),
            BreakerState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Admit a request. While open and before the open duration elapses, or
    /// while another trial is outstanding, the request fails fast.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerOpen> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            BreakerState::Closed => Ok(BreakerPermit::new(self.clone(), false)),
            BreakerState::Open | BreakerState::HalfOpen => {
                if !self.probeable(&inner, Instant::now()) {
                    return Err(BreakerOpen);
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                info!(service = %self.service_id, "circuit half-open, admitting trial request");
                Ok(BreakerPermit::new(self.clone(), true))
            }
        }
    }

    pub fn record_success(&self) {
        self.on_success(false);
    }

    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial || inner.state == BreakerState::Closed {
            if inner.state != BreakerState::Closed {
                info!(service = %self.service_id, "circuit closed after successful trial");
            }
            inner.state = BreakerState::Closed;
            inner.failures = 0;
            inner.opened_at = None;
        }
        if trial {
            inner.trial_in_flight = false;
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(now);
        let state = inner.state;
        match state {
            _ if trial => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!(service = %self.service_id, "trial request failed, circuit re-opened");
            }
            BreakerState::Closed if inner.failures >= self.threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                warn!(
                    service = %self.service_id,
                    failures = inner.failures,
                    "failure threshold reached, circuit opened"
                );
            }
            // late outcome of a request admitted before the breaker opened
            BreakerState::Open => inner.opened_at = Some(now),
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

/// Admission ticket for one request. Report exactly one outcome through it.
///
/// A trial permit dropped without an outcome (the request was cancelled)
/// frees the trial slot and records nothing.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self { breaker, trial, settled: false }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn success(mut self) {
        self.breaker.on_success(self.trial);
        self.settled = true;
    }

    pub fn failure(mut self) {
        self.breaker.on_failure(self.trial);
        self.settled = true;
    }

    /// Counts one failed attempt while the request may still retry.
    /// Returns whether another attempt may go through.
    pub fn attempt_failed(&mut self) -> bool {
        if self.settled {
            return false;
        }
        self.breaker.on_failure(self.trial);
        if self.trial {
            self.settled = true;
            return false;
        }
        self.breaker.state() == BreakerState::Closed
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
