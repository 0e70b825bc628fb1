//! Failure handling around transport calls.
//!
//! [`Resilience`] stacks the primitives the same way for every transport:
//! `retry(breaker(call))`. The breaker counts every failed attempt, the retry loop only re-runs
//! transport-class failures, and an open circuit goes straight to the fallback. Configuration
//! errors never reached the authority: the breaker ignores them and they are not retried.

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;
pub mod sleeper;

use std::future::Future;
use std::time::Duration;

pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy, CircuitState, Verdict,
};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CircuitBreakerSettings, RetrySettings};
use crate::error::{ConfigError, ResilienceError, TransportError};
use crate::model::{AuthenticationInformation, Information};
use crate::telemetry::EventEmitter;

/// Breaker + retry + fallback, shared by all operations of one client.
#[derive(Debug, Clone)]
pub struct Resilience {
    breaker: Option<CircuitBreakerPolicy>,
    retry: Option<RetryPolicy<TransportError>>,
    fallback_message: String,
}

impl Resilience {
    pub fn new(
        breaker: Option<CircuitBreakerPolicy>,
        retry: Option<RetryPolicy<TransportError>>,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self { breaker, retry, fallback_message: fallback_message.into() }
    }

    /// No breaker, no retry. Calls run once and failures map straight to their status.
    pub fn passthrough() -> Self {
        Self::new(None, None, CircuitBreakerSettings::default().fallback_message)
    }

    pub fn from_settings(
        breaker: &CircuitBreakerSettings,
        retry: &RetrySettings,
        events: EventEmitter,
    ) -> Result<Self, ConfigError> {
        Self::from_settings_with_clock(breaker, retry, events, MonotonicClock::default())
    }

    pub fn from_settings_with_clock<C: Clock + 'static>(
        breaker: &CircuitBreakerSettings,
        retry: &RetrySettings,
        events: EventEmitter,
        clock: C,
    ) -> Result<Self, ConfigError> {
        let breaker_policy = if breaker.enabled {
            let config = CircuitBreakerConfig::new(
                breaker.failure_threshold,
                Duration::from_millis(breaker.cooldown_ms),
            )
            .map_err(|e| ConfigError::Invalid {
                field: "circuit_breaker",
                reason: e.to_string(),
            })?;
            Some(
                CircuitBreakerPolicy::with_config(config)
                    .with_clock(clock)
                    .with_events(events.clone()),
            )
        } else {
            None
        };

        let retry_policy = if retry.enabled && retry.max_attempts > 1 {
            let invalid = |reason: String| ConfigError::Invalid { field: "retry", reason };
            let backoff =
                Backoff::exponential(Duration::from_millis(retry.delay_ms), retry.multiplier)
                    .and_then(|b| b.with_max(Duration::from_millis(retry.max_delay_ms)))
                    .map_err(|e| invalid(e.to_string()))?;
            let policy = RetryPolicy::builder()
                .max_attempts(retry.max_attempts)
                .backoff(backoff)
                .should_retry(|e: &TransportError| !e.is_config())
                .with_events(events)
                .build()
                .map_err(|e| invalid(e.to_string()))?;
            Some(policy)
        } else {
            None
        };

        Ok(Self::new(breaker_policy, retry_policy, breaker.fallback_message.clone()))
    }

    pub fn breaker(&self) -> Option<&CircuitBreakerPolicy> {
        self.breaker.as_ref()
    }

    /// Fail-closed result used while the circuit is open.
    pub fn fallback(&self) -> AuthenticationInformation {
        AuthenticationInformation::failure().with_message(self.fallback_message.clone())
    }

    /// Runs `call` under retry and breaker and hands back the raw outcome.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, ResilienceError<TransportError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let call = &call;
        let breaker = self.breaker.as_ref();
        let attempt = move || async move { call().await.map_err(ResilienceError::Inner) };
        let guarded = move || async move {
            match breaker {
                Some(breaker) => breaker.execute_classified(attempt, verdict).await,
                None => attempt().await,
            }
        };

        match &self.retry {
            Some(retry) => retry.execute(guarded).await,
            None => guarded().await,
        }
    }

    /// Like [`execute`](Self::execute) but never fails: an open circuit yields `fallback()`,
    /// exhausted or non-retryable transport errors yield their status.
    pub async fn call<F, Fut, Fb>(&self, call: F, fallback: Fb) -> AuthenticationInformation
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<AuthenticationInformation, TransportError>>,
        Fb: FnOnce() -> AuthenticationInformation,
    {
        match self.execute(call).await {
            Ok(info) => info,
            Err(ResilienceError::CircuitOpen { .. }) => fallback(),
            Err(err) => Self::failure_of(&err),
        }
    }

    /// Result reported for a call that ended in `err`.
    pub fn failure_of(err: &ResilienceError<TransportError>) -> AuthenticationInformation {
        let status =
            err.last_failure().map(TransportError::status).unwrap_or(Information::ServerError);
        tracing::warn!(error = %err, ?status, "authority call failed");
        AuthenticationInformation::from_status(status).with_message(err.to_string())
    }
}

fn verdict<T>(result: &Result<T, ResilienceError<TransportError>>) -> Verdict {
    match result {
        Ok(_) => Verdict::Success,
        Err(ResilienceError::Inner(err)) if err.is_config() => Verdict::Ignored,
        Err(ResilienceError::CircuitOpen { .. }) => Verdict::Ignored,
        Err(_) => Verdict::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::UserPrincipal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(threshold: usize, attempts: usize) -> (CircuitBreakerSettings, RetrySettings) {
        let breaker = CircuitBreakerSettings {
            failure_threshold: threshold,
            cooldown_ms: 1_000,
            fallback_message: "try later".into(),
            ..CircuitBreakerSettings::default()
        };
        let retry = RetrySettings {
            max_attempts: attempts,
            delay_ms: 0,
            max_delay_ms: 0,
            ..RetrySettings::default()
        };
        (breaker, retry)
    }

    #[tokio::test]
    async fn success_passes_through() {
        let resilience = Resilience::passthrough();
        let info = resilience
            .call(
                || async { Ok(AuthenticationInformation::ok(UserPrincipal::new("1", "ada"))) },
                || resilience.fallback(),
            )
            .await;
        assert!(info.is_ok());
    }

    #[tokio::test]
    async fn transport_failures_are_retried_then_mapped() {
        let (breaker, retry) = settings(10, 3);
        let resilience = Resilience::from_settings(&breaker, &retry, EventEmitter::none()).unwrap();
        let calls = AtomicUsize::new(0);

        let info = resilience
            .call(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Unreachable("refused".into())) }
                },
                || resilience.fallback(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(info.status(), Information::ServerNotFound);
    }

    #[tokio::test]
    async fn config_errors_are_not_retried() {
        let (breaker, retry) = settings(10, 3);
        let resilience = Resilience::from_settings(&breaker, &retry, EventEmitter::none()).unwrap();
        let calls = AtomicUsize::new(0);

        let info = resilience
            .call(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Config(ConfigError::NoAuthority)) }
                },
                || resilience.fallback(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(info.status(), Information::ServerError);
        assert_eq!(resilience.breaker().unwrap().failure_count(), 0);
    }

    #[tokio::test]
    async fn open_circuit_returns_fallback_without_calling() {
        let (breaker, retry) = settings(2, 1);
        let clock = ManualClock::new();
        let resilience = Resilience::from_settings_with_clock(
            &breaker,
            &retry,
            EventEmitter::none(),
            clock.clone(),
        )
        .unwrap();
        let calls = AtomicUsize::new(0);
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Closed) }
        };

        for _ in 0..2 {
            resilience.call(failing, || resilience.fallback()).await;
        }
        assert_eq!(resilience.breaker().unwrap().state(), CircuitState::Open);

        let info = resilience.call(failing, || resilience.fallback()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(info.status(), Information::AuthenticationFailure);
        assert_eq!(info.message(), "try later");

        clock.advance(1_000);
        let info = resilience
            .call(
                || async { Ok(AuthenticationInformation::ok(UserPrincipal::new("1", "ada"))) },
                || resilience.fallback(),
            )
            .await;
        assert!(info.is_ok());
        assert_eq!(resilience.breaker().unwrap().state(), CircuitState::Closed);
    }
}
