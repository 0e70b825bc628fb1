//! Retry policy for fallible async operations.
//!
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible; a short-circuited breaker is returned
//!   as-is.
//! - `should_retry` decides whether an inner error is worth another attempt. The client only
//!   retries transport-class failures, never a credential verdict.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::sleeper::{Sleeper, TokioSleeper};
use crate::error::ResilienceError;
use crate::telemetry::{ClientEvent, EventEmitter, RetryEvent};

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    should_retry: Predicate<E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventEmitter,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("sleeper", &self.sleeper)
            .finish_non_exhaustive()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicy<E> {
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let started = Instant::now();
        let mut failures: Vec<E> = Vec::new();
        let mut attempt = 0;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) if (self.should_retry)(&e) => e,
                Err(other) => return Err(other),
            };
            failures.push(error);
            attempt += 1;

            if attempt >= self.max_attempts {
                tracing::warn!(attempts = attempt, "retry exhausted");
                self.events
                    .emit(ClientEvent::Retry(RetryEvent::Exhausted {
                        total_attempts: attempt,
                        total_duration: started.elapsed(),
                    }))
                    .await;
                return Err(ResilienceError::retry_exhausted(attempt, failures));
            }

            let delay = self.backoff.delay(attempt);
            tracing::debug!(attempt, ?delay, "retrying after transport failure");
            self.events.emit(ClientEvent::Retry(RetryEvent::Attempt { attempt, delay })).await;
            self.sleeper.sleep(delay).await;
        }
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    should_retry: Predicate<E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventEmitter,
}

impl<E> RetryPolicyBuilder<E> {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::constant(Duration::from_millis(100)),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
            events: EventEmitter::none(),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            events: self.events,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::sleeper::{InstantSleeper, TrackingSleeper};
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    fn counting_failure(
        calls: &Arc<AtomicUsize>,
        error: TestError,
    ) -> impl FnMut() -> futures::future::Ready<Result<(), ResilienceError<TestError>>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err(ResilienceError::Inner(error.clone())))
        }
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = RetryPolicy::<TestError>::builder().max_attempts(0).build().unwrap_err();
        assert_eq!(err, BuildError::InvalidMaxAttempts(0));
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts_and_waits_between() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::<TestError>::builder()
            .max_attempts(3)
            .backoff(Backoff::exponential(Duration::from_millis(100), 2.0).unwrap())
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = policy.execute(counting_failure(&calls, TestError("down"))).await.unwrap_err();

        assert!(err.is_retry_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_at_once() {
        let policy = RetryPolicy::<TestError>::builder()
            .max_attempts(5)
            .should_retry(|e: &TestError| e.0 != "rejected")
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err =
            policy.execute(counting_failure(&calls, TestError("rejected"))).await.unwrap_err();

        assert_eq!(err.as_inner(), Some(&TestError("rejected")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_circuit_is_not_retried() {
        let policy =
            RetryPolicy::<TestError>::builder().with_sleeper(InstantSleeper).build().unwrap();
        let calls = AtomicUsize::new(0);
        let err = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ResilienceError::<TestError>::CircuitOpen {
                        failure_count: 3,
                        open_duration: Duration::ZERO,
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_and_reports_attempts() {
        let sink = MemorySink::new();
        let policy = RetryPolicy::<TestError>::builder()
            .max_attempts(4)
            .with_sleeper(InstantSleeper)
            .with_events(EventEmitter::new(sink.clone()))
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);

        let value = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ResilienceError::Inner(TestError("flaky")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        let attempts = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::Retry(RetryEvent::Attempt { .. })))
            .count();
        assert_eq!(attempts, 2);
    }
}
