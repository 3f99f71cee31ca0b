//! Circuit breaker guarding the detection service.
//!
//! - **Closed**: fewer than `threshold` consecutive failures; requests flow.
//! - **Open**: `threshold` reached; requests are rejected until
//!   `reset_timeout` has passed since the last failure.
//! - **Half-open**: the timeout has passed; exactly one trial request is
//!   admitted. Its success closes the breaker, its failure re-opens it.
//!
//! The failure counter is atomic so the worker pool can record outcomes
//! concurrently; the last-failure time and the trial flag share one lock.

use bridge_traits::time::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Timing {
    last_failure: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
    failures: AtomicU32,
    timing: Mutex<Timing>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout,
            clock,
            failures: AtomicU32::new(0),
            timing: Mutex::new(Timing::default()),
        }
    }

    /// Whether a request may proceed. In the half-open state only the first
    /// caller gets `true` until an outcome is recorded.
    pub fn allow_request(&self) -> bool {
        if self.failures.load(Ordering::SeqCst) < self.threshold {
            return true;
        }

        let mut timing = self.timing();
        if timing.trial_in_flight || !self.cooled_down(&timing) {
            return false;
        }

        timing.trial_in_flight = true;
        debug!("Circuit breaker half-open, admitting trial request");
        true
    }

    pub fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        self.timing().trial_in_flight = false;
        if previous >= self.threshold {
            debug!("Circuit breaker closed");
        }
    }

    /// Give back a half-open trial that produced no outcome, so the next
    /// caller may try again.
    pub fn release_trial(&self) {
        self.timing().trial_in_flight = false;
    }

    /// Whether the request admitted last was the half-open trial.
    pub fn trial_in_flight(&self) -> bool {
        self.timing().trial_in_flight
    }

    pub fn record_failure(&self) {
        let mut timing = self.timing();
        let failures = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        timing.last_failure = Some(self.clock.now());
        timing.trial_in_flight = false;

        if failures == self.threshold {
            warn!(
                failures,
                reset_timeout_secs = self.reset_timeout.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        if self.failures.load(Ordering::SeqCst) < self.threshold {
            return BreakerState::Closed;
        }
        let timing = self.timing();
        if timing.trial_in_flight || self.cooled_down(&timing) {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn cooled_down(&self, timing: &Timing) -> bool {
        let Some(last_failure) = timing.last_failure else {
            return true;
        };
        let timeout = ChronoDuration::from_std(self.reset_timeout).unwrap_or(ChronoDuration::MAX);
        self.clock.now() - last_failure >= timeout
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("threshold", &self.threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("failures", &self.failures())
            .field("state", &self.state())
            .finish()
    }
}
