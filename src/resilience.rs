//! Resilience patterns for outbound provider calls.
//!
//! Provides a per-dependency circuit breaker with bounded half-open probing,
//! and a timeout wrapper that turns a hung call into an ordinary failure.

use crate::error::{CacheMeshError, Result};
use crate::observability;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, allowing a bounded number of probes.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing.
    #[serde(with = "crate::config::humantime_serde")]
    pub recovery_timeout: Duration,
    /// Maximum concurrent probes in half-open state. The circuit closes once
    /// this many probes have all succeeded.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Aggressive circuit breaker (opens quickly).
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 5,
        }
    }

    /// Lenient circuit breaker (more tolerant of failures).
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(15),
            half_open_max_calls: 1,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "circuit_breaker.failure_threshold".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.half_open_max_calls == 0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "circuit_breaker.half_open_max_calls".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

/// How a call was admitted, so its outcome is booked against the right state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker for protecting against cascading failures.
///
/// One instance guards one dependency; the edge manager keeps one per provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    /// Name for logging.
    name: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
            name: name.into(),
        })
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state, applying the OPEN -> HALF_OPEN timeout if due.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// Execute a function with circuit breaker protection.
    ///
    /// Rejected calls return [`CacheMeshError::CircuitOpen`] without running
    /// `f`. Errors for which [`CacheMeshError::trips_breaker`] is false are
    /// passed through without being counted.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let guard = ProbeGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = f().await;
        match &result {
            Ok(_) => guard.settle(Some(true)),
            Err(e) if e.trips_breaker() => guard.settle(Some(false)),
            Err(_) => guard.settle(None),
        }
        result
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_probes_in_flight: state.half_open_in_flight,
            open_for_ms: state
                .opened_at
                .filter(|_| state.state == CircuitState::Open)
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);

        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => Err(CacheMeshError::CircuitOpen(self.name.clone())),
            CircuitState::HalfOpen => {
                let used = state.half_open_in_flight + state.half_open_successes;
                if used >= self.config.half_open_max_calls {
                    return Err(CacheMeshError::CircuitOpen(self.name.clone()));
                }
                state.half_open_in_flight += 1;
                Ok(Admission::Probe)
            }
        }
    }

    /// `success == None` means the call neither succeeded nor failed in a way
    /// that counts (cancelled, or a non-tripping error).
    fn on_outcome(&self, admission: Admission, success: Option<bool>) {
        let mut state = self.state.lock();

        if admission == Admission::Probe {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            if state.state != CircuitState::HalfOpen {
                // A sibling probe already decided the outcome
                return;
            }
            match success {
                Some(true) => {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= self.config.half_open_max_calls {
                        state.state = CircuitState::Closed;
                        state.consecutive_failures = 0;
                        state.half_open_successes = 0;
                        state.opened_at = None;
                        observability::record_circuit_state(&self.name, CircuitState::Closed);
                        tracing::info!(circuit = %self.name, "Circuit closed after successful recovery");
                    }
                }
                Some(false) => {
                    self.trip(&mut state);
                    tracing::warn!(circuit = %self.name, "Circuit re-opened after half-open failure");
                }
                None => {}
            }
            return;
        }

        match (state.state, success) {
            (CircuitState::Closed, Some(true)) => {
                state.consecutive_failures = 0;
            }
            (CircuitState::Closed, Some(false)) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    let failures = state.consecutive_failures;
                    self.trip(&mut state);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = failures,
                        "Circuit opened due to failures"
                    );
                }
            }
            (CircuitState::HalfOpen, Some(false)) => {
                self.trip(&mut state);
            }
            _ => {}
        }
    }

    fn trip(&self, state: &mut BreakerState) {
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.half_open_successes = 0;
        observability::record_circuit_state(&self.name, CircuitState::Open);
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() >= self.config.recovery_timeout {
                state.state = CircuitState::HalfOpen;
                state.half_open_successes = 0;
                observability::record_circuit_state(&self.name, CircuitState::HalfOpen);
                tracing::info!(circuit = %self.name, "Circuit transitioning to half-open");
            }
        }
    }
}

/// Books the outcome of an admitted call exactly once, including when the
/// future running it is dropped mid-flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl ProbeGuard<'_> {
    fn settle(mut self, success: Option<bool>) {
        self.settled = true;
        self.breaker.on_outcome(self.admission, success);
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_outcome(self.admission, None);
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
    /// Probes currently running in half-open state.
    pub half_open_probes_in_flight: u32,
    /// How long the circuit has been open.
    pub open_for_ms: Option<u64>,
}

// ============================================================================
// Timeout Wrapper
// ============================================================================

/// Execute an operation with a timeout.
pub async fn with_timeout<F, Fut, T>(timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, f())
        .await
        .map_err(|_| CacheMeshError::Timeout(timeout.as_millis() as u64))?
}
