//! The HTTP binding over a pooled HTTP/2 client.
//!
//! Same envelope, same paths, same status handling as [`super::http`]. The client speaks
//! HTTP/2 with prior knowledge (h2c for plain `http://`), keeps idle connections pinged and
//! multiplexes concurrent calls over one connection per authority.

use std::time::Duration;

use super::http::{client_error, HttpTransport};
use super::TransportSettings;
use crate::error::ConfigError;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub fn http2_transport(settings: &TransportSettings) -> Result<HttpTransport, ConfigError> {
    let client = reqwest::Client::builder()
        .http2_prior_knowledge()
        .http2_adaptive_window(true)
        .http2_keep_alive_interval(settings.timeouts.heartbeat())
        .http2_keep_alive_while_idle(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .connect_timeout(settings.timeouts.connect())
        .timeout(settings.timeouts.read())
        .build()
        .map_err(|e| client_error("http2", e))?;
    Ok(HttpTransport::with_client("http2", client, settings))
}
