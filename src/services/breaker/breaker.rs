//! Per-backend circuit breaker.
//!
//! - **Closed**: calls pass; consecutive failures are counted.
//! - **Open**: calls are rejected without reaching the backend until the open timeout
//!   has elapsed since the circuit opened.
//! - **Half-open**: up to `max_half_open_requests` trial calls run concurrently. One
//!   failure reopens the circuit; `success_threshold` consecutive successes close it.
//!
//! Every transition bumps a generation counter. An outcome reported for an admission
//! taken under an older generation is ignored, so slow calls started before a
//! transition cannot skew the new state's counters.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::events::{EventSink, GatewayEvent};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time spent open before trial calls are admitted
    pub timeout: Duration,
    /// Concurrent trial calls allowed while half-open
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_half_open_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open for backend `{backend}`")]
    Open { backend: String },
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub backend: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub millis_since_state_change: u64,
    pub millis_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    half_open_in_flight: u32,
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_state_change: Instant::now(),
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    /// Move to `to`, resetting the counters that belong to the new state.
    fn transition(&mut self, to: CircuitState, now: Instant) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.generation += 1;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
        (from, to)
    }
}

/// Permission to make one call. Dropping it unsettled (the caller was cancelled)
/// frees its half-open slot without counting an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(
        backend: impl Into<String>,
        config: CircuitBreakerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend: backend.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            events,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.lock();
        CircuitBreakerSnapshot {
            backend: self.backend.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            half_open_in_flight: state.half_open_in_flight,
            millis_since_state_change: state.last_state_change.elapsed().as_millis() as u64,
            millis_since_last_failure: state
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the circuit closed and clear every counter.
    pub fn reset(&self) {
        let change = {
            let mut state = self.lock();
            let from = state.state;
            state.transition(CircuitState::Closed, Instant::now());
            state.last_failure = None;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        if let Some((from, to)) = change {
            self.announce(from, to);
        }
    }

    /// Run `operation` if the circuit admits it, recording its outcome.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().ok_or_else(|| BreakerError::Open {
            backend: self.backend.clone(),
        })?;

        let result = operation().await;
        admission.settle(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let now = Instant::now();
        let mut change = None;

        let admitted = {
            let mut state = self.lock();

            if state.state == CircuitState::Open
                && now.duration_since(state.last_state_change) >= self.config.timeout
            {
                change = Some(state.transition(CircuitState::HalfOpen, now));
            }

            match state.state {
                CircuitState::Closed => Some((state.generation, false)),
                CircuitState::Open => None,
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < self.config.max_half_open_requests {
                        state.half_open_in_flight += 1;
                        Some((state.generation, true))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((from, to)) = change {
            self.announce(from, to);
        }

        admitted.map(|(generation, trial)| Admission {
            breaker: self,
            generation,
            trial,
            settled: false,
        })
    }

    fn record(&self, generation: u64, trial: bool, success: bool) {
        let now = Instant::now();

        let change = {
            let mut state = self.lock();
            if state.generation != generation {
                tracing::debug!(backend = %self.backend, "ignoring outcome from an earlier circuit state");
                return;
            }
            if trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match (state.state, success) {
                (CircuitState::Closed, true) => {
                    state.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, false) => {
                    state.consecutive_failures += 1;
                    state.last_failure = Some(now);
                    (state.consecutive_failures >= self.config.failure_threshold)
                        .then(|| state.transition(CircuitState::Open, now))
                }
                (CircuitState::HalfOpen, true) => {
                    state.consecutive_successes += 1;
                    (state.consecutive_successes >= self.config.success_threshold)
                        .then(|| state.transition(CircuitState::Closed, now))
                }
                (CircuitState::HalfOpen, false) => {
                    state.consecutive_failures += 1;
                    state.last_failure = Some(now);
                    Some(state.transition(CircuitState::Open, now))
                }
                (CircuitState::Open, _) => None,
            }
        };

        if let Some((from, to)) = change {
            self.announce(from, to);
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        self.events.emit(GatewayEvent::CircuitTransition {
            backend: self.backend.clone(),
            from,
            to,
        });
    }
}
