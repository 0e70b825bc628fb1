//! Lightweight HTTP binding for trusted networks.
//!
//! The field map is posted as plain JSON to the configured path. No envelope, no sidecar
//! headers; the reply is read as plaintext.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::http::{client_error, post_plain};
use super::{OutboundRequest, Received, Transport, TransportSettings};
use crate::config::PathSettings;
use crate::error::{ConfigError, TransportError};
use crate::selector::Endpoint;

#[derive(Debug, Clone)]
pub struct LiteTransport {
    client: reqwest::Client,
    paths: PathSettings,
    read_timeout: Duration,
}

impl LiteTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeouts.connect())
            .timeout(settings.timeouts.read())
            .build()
            .map_err(|e| client_error("lite", e))?;
        Ok(Self { client, paths: settings.paths.clone(), read_timeout: settings.timeouts.read() })
    }
}

#[async_trait]
impl Transport for LiteTransport {
    fn name(&self) -> &'static str {
        "lite"
    }

    fn seals_requests(&self) -> bool {
        false
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let url = endpoint.join(request.operation.path(&self.paths));
        let body = Value::Object(request.fields.clone().into_iter().collect());
        tracing::debug!(target: "authwire::lite", %url, operation = %request.operation, "sending");
        post_plain(&self.client, &url, &body, self.read_timeout).await.map(Received::Plain)
    }
}
