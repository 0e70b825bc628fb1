//! Circuit breaker implementation with lock-free atomics.
//!
//! `Closed → Open` after `failure_threshold` consecutive failures. While open every call is
//! rejected with [`ResilienceError::CircuitOpen`] without running the operation. Once the cooldown
//! has elapsed the first caller flips the breaker to half-open and is the single trial call;
//! concurrent callers keep being rejected until the trial settles. Success closes the breaker and
//! resets the counter, failure reopens it and restarts the cooldown.
//!
//! [`execute_classified`](CircuitBreakerPolicy::execute_classified) lets the caller mark an
//! outcome as [`Verdict::Ignored`]: the call never reached the guarded service, so the streak is
//! left alone and a trial hands the breaker back to open without restarting the cooldown.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::ResilienceError;
use crate::telemetry::{CircuitBreakerEvent, ClientEvent, EventEmitter};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// How one call's outcome counts against the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
    /// Neither: the guarded service was never asked.
    Ignored,
}

/// Errors produced when validating breaker configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("cooldown must be > 0 unless breaker is disabled (got {0:?})")]
    InvalidCooldown(Duration),
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    cooldown: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if cooldown.is_zero() {
            return Err(CircuitBreakerError::InvalidCooldown(cooldown));
        }
        Ok(Self { failure_threshold, cooldown })
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, cooldown: Duration::MAX }
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
}

/// Circuit breaker guarding an async operation.
///
/// Clones share the same state, so every handle observes one circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
}

impl CircuitBreakerPolicy {
    /// ```
    /// use authwire::resilience::CircuitBreakerPolicy;
    /// use std::time::Duration;
    /// let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30)).unwrap();
    /// ```
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        Ok(Self::with_config(CircuitBreakerConfig::new(failure_threshold, cooldown)?))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            events: EventEmitter::none(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `operation` under breaker protection.
    ///
    /// Returns `ResilienceError::CircuitOpen` when the call was short-circuited; the operation's
    /// own error otherwise passes through and counts as a failure.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        self.execute_classified(operation, |result| match result {
            Ok(_) => Verdict::Success,
            Err(ResilienceError::CircuitOpen { .. }) => Verdict::Ignored,
            Err(_) => Verdict::Failure,
        })
        .await
    }

    /// Like [`execute`](Self::execute), with `classify` deciding how the outcome counts.
    pub async fn execute_classified<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        classify: C,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
        C: FnOnce(&Result<T, ResilienceError<E>>) -> Verdict,
    {
        // A trial dropped before it settles (caller cancelled) puts the breaker back to open.
        struct TrialGuard<'a> {
            policy: &'a CircuitBreakerPolicy,
            settled: bool,
        }
        impl Drop for TrialGuard<'_> {
            fn drop(&mut self) {
                if self.settled {
                    return;
                }
                let state = &self.policy.state;
                if state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    state.opened_at_millis.store(self.policy.clock.now_millis(), Ordering::Release);
                }
            }
        }

        let mut guard: Option<TrialGuard<'_>> = None;

        match self.state() {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                let cooldown = u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX);
                let won_trial = elapsed >= cooldown
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                if !won_trial {
                    return Err(self.reject(elapsed).await);
                }
                guard = Some(TrialGuard { policy: self, settled: false });
                tracing::info!("Circuit breaker → half-open");
                self.events.emit(ClientEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen)).await;
            }
            CircuitState::HalfOpen => {
                let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                return Err(self.reject(elapsed).await);
            }
        }

        let result = operation().await;
        let transition = match classify(&result) {
            Verdict::Success => self.on_success(),
            Verdict::Failure => self.on_failure(),
            Verdict::Ignored => {
                if guard.is_some() {
                    self.abandon_trial();
                }
                None
            }
        };
        if let Some(guard) = guard.as_mut() {
            guard.settled = true;
        }
        drop(guard);

        if let Some(event) = transition {
            self.events.emit(ClientEvent::CircuitBreaker(event)).await;
        }
        result
    }

    async fn reject<E>(&self, elapsed_millis: u64) -> ResilienceError<E> {
        let failure_count = self.state.failure_count.load(Ordering::Acquire);
        tracing::debug!(failure_count, "Circuit breaker: call short-circuited");
        self.events.emit(ClientEvent::CircuitBreaker(CircuitBreakerEvent::Rejected)).await;
        ResilienceError::CircuitOpen {
            failure_count,
            open_duration: Duration::from_millis(elapsed_millis),
        }
    }

    /// Back to open with the original `opened_at`, so the next caller may trial at once.
    fn abandon_trial(&self) {
        if self
            .state
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("Circuit breaker: trial never reached the service → open");
        }
    }

    /// Any success resets the streak, so only consecutive failures trip the breaker.
    fn on_success(&self) -> Option<CircuitBreakerEvent> {
        match self.state() {
            CircuitState::HalfOpen => {
                let closed = self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if !closed {
                    return None;
                }
                self.state.failure_count.store(0, Ordering::Release);
                self.state.opened_at_millis.store(0, Ordering::Release);
                tracing::info!("Circuit breaker → closed");
                Some(CircuitBreakerEvent::Closed)
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
                None
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self) -> Option<CircuitBreakerEvent> {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        match self.state() {
            CircuitState::HalfOpen => {
                let reopened = self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if !reopened {
                    return None;
                }
                self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                tracing::warn!(failures, "Circuit breaker: test failed → open");
                Some(CircuitBreakerEvent::Opened { failure_count: failures })
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                let opened = self
                    .state
                    .state
                    .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if !opened {
                    return None;
                }
                self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                tracing::error!(
                    failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker → open"
                );
                Some(CircuitBreakerEvent::Opened { failure_count: failures })
            }
            _ => None,
        }
    }
}
