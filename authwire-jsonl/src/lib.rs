//! JSONL sink for `authwire`. Writes one client event per line.
//! Always appends; bring your own path.

use authwire::telemetry::{ClientEvent, TelemetrySink};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<ClientEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::warn!(target: "authwire::jsonl", path = %path.display(), error = %e, "event dropped");
                return Err(e);
            }
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

fn event_to_json(event: &ClientEvent) -> serde_json::Value {
    use authwire::telemetry::{CacheEvent, CircuitBreakerEvent, RequestOutcome, RetryEvent};
    match event {
        ClientEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => {
                json!({ "kind": "retry_attempt", "attempt": attempt, "delay_ms": delay.as_millis() as u64 })
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                json!({ "kind": "retry_exhausted", "attempts": total_attempts, "duration_ms": total_duration.as_millis() as u64 })
            }
        },
        ClientEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
            CircuitBreakerEvent::Rejected => json!({ "kind": "circuit_rejected" }),
        },
        ClientEvent::Cache(c) => match c {
            CacheEvent::Hit => json!({ "kind": "cache_hit" }),
            CacheEvent::Miss => json!({ "kind": "cache_miss" }),
            CacheEvent::Evicted { status } => {
                json!({ "kind": "cache_evicted", "status": status, "code": status.code() })
            }
        },
        ClientEvent::Request(r) => match r {
            RequestOutcome::Success { transport, duration } => {
                json!({ "kind": "request_success", "transport": transport, "duration_ms": duration.as_millis() as u64 })
            }
            RequestOutcome::Failure { transport, status, duration } => {
                json!({
                    "kind": "request_failure",
                    "transport": transport,
                    "status": status,
                    "code": status.code(),
                    "duration_ms": duration.as_millis() as u64,
                })
            }
        },
    }
}
