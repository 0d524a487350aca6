//! Circuit breaker keyed per (instance, operation).
//!
//! A count-based sliding window of call outcomes drives the state machine:
//! CLOSED records every outcome and opens once the window holds at least
//! `minimum_calls` with a failure rate at or above the threshold; OPEN
//! rejects without invoking the transport until `open_duration` elapses, then
//! admits a bounded number of HALF_OPEN trials; a trial success closes the
//! circuit, a trial failure reopens it and restarts the timer. The breaker
//! cycles indefinitely; there is no terminal state.

use crate::clock::{Clock, MonotonicClock};
use crate::error::AttemptFailure;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open duration elapses.
    Open,
    /// Probe mode admitting a limited number of trial calls.
    HalfOpen,
}

impl CircuitState {
    #[allow(dead_code)]
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> CircuitState {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerError {
    /// Window capacity must be > 0.
    InvalidWindowSize { provided: usize },
    /// Minimum call count must be > 0 and <= window size.
    InvalidMinimumCalls { provided: usize, window_size: usize },
    /// Failure rate threshold must be within (0.0, 1.0].
    InvalidFailureRateThreshold { provided: f64 },
    /// Open duration must be > 0.
    InvalidOpenDuration(Duration),
    /// Half-open trial limit must be > 0.
    InvalidHalfOpenTrials { provided: usize },
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidWindowSize { provided } => {
                write!(f, "window_size must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidMinimumCalls { provided, window_size } => {
                write!(
                    f,
                    "minimum_calls must be > 0 and <= window_size {} (got {})",
                    window_size, provided
                )
            }
            CircuitBreakerError::InvalidFailureRateThreshold { provided } => {
                write!(f, "failure_rate_threshold must be in (0.0, 1.0] (got {})", provided)
            }
            CircuitBreakerError::InvalidOpenDuration(d) => {
                write!(f, "open_duration must be > 0 (got {:?})", d)
            }
            CircuitBreakerError::InvalidHalfOpenTrials { provided } => {
                write!(f, "half_open_trials must be > 0 (got {})", provided)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Validated breaker configuration, shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    window_size: usize,
    minimum_calls: usize,
    failure_rate_threshold: f64,
    open_duration: Duration,
    half_open_trials: usize,
}

impl CircuitBreakerConfig {
    pub fn new(
        window_size: usize,
        minimum_calls: usize,
        failure_rate_threshold: f64,
        open_duration: Duration,
        half_open_trials: usize,
    ) -> Result<Self, CircuitBreakerError> {
        if window_size == 0 {
            return Err(CircuitBreakerError::InvalidWindowSize { provided: window_size });
        }
        if minimum_calls == 0 || minimum_calls > window_size {
            return Err(CircuitBreakerError::InvalidMinimumCalls {
                provided: minimum_calls,
                window_size,
            });
        }
        if !(failure_rate_threshold > 0.0 && failure_rate_threshold <= 1.0) {
            return Err(CircuitBreakerError::InvalidFailureRateThreshold {
                provided: failure_rate_threshold,
            });
        }
        if open_duration.is_zero() {
            return Err(CircuitBreakerError::InvalidOpenDuration(open_duration));
        }
        if half_open_trials == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenTrials { provided: half_open_trials });
        }
        Ok(Self {
            window_size,
            minimum_calls,
            failure_rate_threshold,
            open_duration,
            half_open_trials,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    pub fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    pub fn open_duration(&self) -> Duration {
        self.open_duration
    }

    pub fn half_open_trials(&self) -> usize {
        self.half_open_trials
    }
}

impl Default for CircuitBreakerConfig {
    /// Window of 10 outcomes, open at >= 50% failures once 10 calls are
    /// recorded, stay open 10s, admit one half-open trial.
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_secs(10),
            half_open_trials: 1,
        }
    }
}

/// Count-based ring of recent call outcomes.
#[derive(Debug)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    failures: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity), capacity, failures: 0 }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if !evicted {
                    self.failures -= 1;
                }
            }
        }
        self.outcomes.push_back(success);
        if !success {
            self.failures += 1;
        }
    }

    fn calls(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.outcomes.len() as f64
        }
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[derive(Debug)]
struct BreakerShared {
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicUsize,
    window: Mutex<OutcomeWindow>,
}

/// Circuit breaker guarding calls to one (instance, operation) pair.
///
/// Clones share state via `Arc`, so every handle observes the same circuit
/// lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    shared: Arc<BreakerShared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(STATE_CLOSED),
                opened_at_millis: AtomicU64::new(0),
                half_open_in_flight: AtomicUsize::new(0),
                window: Mutex::new(OutcomeWindow::new(config.window_size)),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current state, for observability and registry snapshots.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Execute the operation under breaker protection.
    ///
    /// Every `Err` the operation returns is recorded against the sliding
    /// window as a failure (including non-success statuses the executor
    /// surfaces as [`AttemptFailure::Status`]), and every `Ok` as a success.
    /// Rejections return [`AttemptFailure::CircuitOpen`] without invoking the
    /// operation.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, AttemptFailure>
    where
        T: Send,
        Fut: Future<Output = Result<T, AttemptFailure>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        // Releases the half-open slot on every exit path, panics included.
        struct TrialGuard<'a> {
            shared: &'a BreakerShared,
            active: bool,
        }
        impl Drop for TrialGuard<'_> {
            fn drop(&mut self) {
                if self.active {
                    self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
                }
            }
        }
        // A call abandoned mid-flight has an unknown outcome; record it as a
        // failure when the future is dropped before completion.
        struct OutcomeGuard<'a> {
            breaker: &'a CircuitBreakerPolicy,
            armed: bool,
        }
        impl Drop for OutcomeGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.breaker.on_failure();
                }
            }
        }
        let mut trial: Option<TrialGuard<'_>> = None;

        loop {
            match CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)) {
                CircuitState::Open => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let open_millis = self.config.open_duration.as_millis() as u64;

                    if elapsed < open_millis {
                        return Err(AttemptFailure::CircuitOpen {
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    if self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!("circuit breaker open -> half-open");
                    }
                    // Winner or loser, re-evaluate: admission runs through the
                    // half-open path so the in-flight count stays balanced
                    // against the trial guards.
                    continue;
                }
                CircuitState::HalfOpen => {
                    let admitted =
                        self.shared.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if admitted >= self.config.half_open_trials {
                        self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
                        let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        return Err(AttemptFailure::CircuitOpen {
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    debug!(
                        in_flight = admitted + 1,
                        max = self.config.half_open_trials,
                        "circuit breaker half-open trial"
                    );
                    trial = Some(TrialGuard { shared: &self.shared, active: true });
                    break;
                }
                CircuitState::Closed => break,
            }
        }

        let mut outcome = OutcomeGuard { breaker: self, armed: true };
        let result = operation().await;
        outcome.armed = false;
        drop(outcome);
        drop(trial);

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn on_success(&self) {
        match CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.window.lock().expect("breaker window poisoned").clear();
                    self.shared.opened_at_millis.store(0, Ordering::Release);
                    info!("circuit breaker half-open -> closed");
                }
            }
            CircuitState::Closed => {
                self.shared.window.lock().expect("breaker window poisoned").record(true);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        match CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.window.lock().expect("breaker window poisoned").clear();
                    self.shared
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    warn!("circuit breaker trial failed, half-open -> open");
                }
            }
            CircuitState::Closed => {
                let (calls, rate) = {
                    let mut window =
                        self.shared.window.lock().expect("breaker window poisoned");
                    window.record(false);
                    (window.calls(), window.failure_rate())
                };
                if calls >= self.config.minimum_calls
                    && rate >= self.config.failure_rate_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.window.lock().expect("breaker window poisoned").clear();
                    self.shared
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    warn!(
                        calls,
                        failure_rate = rate,
                        threshold = self.config.failure_rate_threshold,
                        "circuit breaker closed -> open"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}
