//! Telemetry events emitted by the client.
//!
//! The breaker, the retry loop, the result cache and the client itself report what they do as
//! [`ClientEvent`]s. Events flow into a [`TelemetrySink`], which is just a
//! `tower::Service<ClientEvent>`, so sinks compose with ordinary tower middleware.
//!
//! ```rust
//! use authwire::telemetry::{CacheEvent, ClientEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(ClientEvent::Cache(CacheEvent::Miss)).await.unwrap();
//! assert_eq!(sink.events().len(), 1);
//! # }
//! ```
//!
//! Emission is best-effort: a sink that errors or is not ready never affects the call being
//! reported.

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

use crate::model::Information;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `tower::Service<ClientEvent>` that can be cloned into the client.
pub trait TelemetrySink:
    Service<ClientEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Sends an event, ignoring readiness and call failures.
pub async fn emit_best_effort<S>(sink: S, event: ClientEvent)
where
    S: Service<ClientEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    CircuitBreaker(CircuitBreakerEvent),
    Retry(RetryEvent),
    Cache(CacheEvent),
    Request(RequestOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Consecutive failures reached the threshold.
    Opened { failure_count: usize },
    /// Cooldown elapsed; one trial call is admitted.
    HalfOpen,
    /// The trial call succeeded.
    Closed,
    /// A call was short-circuited to the fallback.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    Attempt { attempt: usize, delay: Duration },
    Exhausted { total_attempts: usize, total_duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit,
    Miss,
    /// A non-`OK` entry was dropped by the read that found it.
    Evicted { status: Information },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success { transport: &'static str, duration: Duration },
    Failure { transport: &'static str, status: Information, duration: Duration },
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            ClientEvent::Retry(event) => write!(f, "Retry::{}", event),
            ClientEvent::Cache(event) => write!(f, "Cache::{}", event),
            ClientEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Rejected => write!(f, "Rejected"),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit => write!(f, "Hit"),
            CacheEvent::Miss => write!(f, "Miss"),
            CacheEvent::Evicted { status } => write!(f, "Evicted(status={:?})", status),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { transport, duration } => {
                write!(f, "Success(transport={}, duration={:?})", transport, duration)
            }
            RequestOutcome::Failure { transport, status, duration } => write!(
                f,
                "Failure(transport={}, status={:?}, duration={:?})",
                transport, status, duration
            ),
        }
    }
}

/// Type-erased, shareable handle to a sink. Cheap to clone; `none()` discards everything.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<Arc<Mutex<BoxCloneService<ClientEvent, (), BoxError>>>>,
}

impl EventEmitter {
    pub fn none() -> Self {
        Self { sink: None }
    }

    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let boxed = BoxCloneService::new(sink.map_err(|e: S::SinkError| -> BoxError { Box::new(e) }));
        Self { sink: Some(Arc::new(Mutex::new(boxed))) }
    }

    pub async fn emit(&self, event: ClientEvent) {
        let Some(shared) = &self.sink else { return };
        let service = match shared.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        emit_best_effort(service, event).await;
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").field("attached", &self.sink.is_some()).finish()
    }
}

type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ClientEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ClientEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ClientEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        tracing::info!(event = %event, "client_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(Vec::new())), capacity: capacity.max(1) }
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ClientEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.remove(0);
            }
            events.push(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
