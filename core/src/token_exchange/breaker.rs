//! Three-state circuit breaker (`CLOSED → OPEN → HALF_OPEN`) guarding the
//! token-exchange fetch (spec §4.3).

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    recovery_timeout: std::time::Duration,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: std::time::Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            failure_threshold,
            recovery_timeout,
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Call before attempting a fetch. Transitions `OPEN → HALF_OPEN` once the
    /// recovery timeout has elapsed, allowing exactly one trial request
    /// through (callers that lose the single-flight race just wait for the
    /// cache, so over-admission during half-open is harmless here).
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed_enough = self
                    .opened_at
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed_enough {
                    self.state.store(CircuitState::HalfOpen.as_u8(), Ordering::SeqCst);
                    tracing::info!("token exchange breaker: OPEN -> HALF_OPEN");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state() != CircuitState::Closed {
            tracing::info!("token exchange breaker: -> CLOSED");
        }
        self.state.store(CircuitState::Closed.as_u8(), Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state() == CircuitState::HalfOpen || failures >= self.failure_threshold {
            *self.opened_at.lock().unwrap() = Some(Instant::now());
            self.state.store(CircuitState::Open.as_u8(), Ordering::SeqCst);
            tracing::warn!(failures, "token exchange breaker: -> OPEN");
        }
    }

    /// Admin reset operation (spec §4.3).
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.lock().unwrap() = None;
        self.state.store(CircuitState::Closed.as_u8(), Ordering::SeqCst);
    }
}
