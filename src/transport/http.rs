//! Request/response over HTTP/1.1.
//!
//! `POST {endpoint}{path}` with body `{"data": ciphertext}` and the sidecar as `x-oauth-*`
//! headers. The authority may echo `x-oauth-response-serial`; when it does, the value must match
//! the serial of the request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{OutboundRequest, Received, Transport, TransportSettings};
use crate::codec::headers;
use crate::config::PathSettings;
use crate::error::{CodecError, ConfigError, TransportError};
use crate::model::Reply;
use crate::selector::Endpoint;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    name: &'static str,
    client: reqwest::Client,
    paths: PathSettings,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeouts.connect())
            .timeout(settings.timeouts.read())
            .build()
            .map_err(|e| client_error("http", e))?;
        Ok(Self::with_client("http", client, settings))
    }

    /// Shares the request logic with other HTTP flavours.
    pub fn with_client(
        name: &'static str,
        client: reqwest::Client,
        settings: &TransportSettings,
    ) -> Self {
        Self { name, client, paths: settings.paths.clone(), read_timeout: settings.timeouts.read() }
    }

    pub(crate) fn url(&self, endpoint: &Endpoint, request: &OutboundRequest) -> String {
        endpoint.join(request.operation.path(&self.paths))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let sealed = request.sealed()?;
        let mut header_map = HeaderMap::new();
        for (name, value) in sealed.headers() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| CodecError::Malformed(format!("header {}: {}", name, e)))?;
            header_map.insert(HeaderName::from_static(name), value);
        }
        let body = json!({ "data": sealed.envelope.ciphertext });
        let url = self.url(endpoint, request);
        tracing::debug!(target: "authwire::http", %url, operation = %request.operation, "sending");

        let response = self
            .client
            .post(&url)
            .headers(header_map)
            .json(&body)
            .send()
            .await
            .map_err(|e| with_timeout(e, self.read_timeout))?;

        let echoed = response
            .headers()
            .get(headers::RESPONSE_SERIAL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let reply = read_reply(response, self.read_timeout).await?;

        if let Some(actual) = echoed {
            let expected = sealed.reply_key().serial();
            if actual != expected {
                return Err(CodecError::SerialMismatch { expected: expected.to_string(), actual }
                    .into());
            }
        }
        Ok(Received::Sealed(reply))
    }
}

/// Status check, then body into [`Reply`].
///
/// 4xx and 5xx are failures, as is any success other than 200. An empty 200 is
/// [`TransportError::EmptyReply`].
pub(crate) async fn read_reply(
    response: reqwest::Response,
    read_timeout: Duration,
) -> Result<Reply, TransportError> {
    let status = response.status();
    if status != StatusCode::OK {
        tracing::debug!(target: "authwire::http", %status, "authority answered with an error status");
        return Err(TransportError::Status(status.as_u16()));
    }
    let body = response.bytes().await.map_err(|e| with_timeout(e, read_timeout))?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(TransportError::EmptyReply);
    }
    serde_json::from_slice::<Reply>(&body)
        .map_err(|e| TransportError::Codec(CodecError::Malformed(e.to_string())))
}

/// Plain JSON POST; used by the bindings that do not seal.
pub(crate) async fn post_plain(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    read_timeout: Duration,
) -> Result<Reply, TransportError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| with_timeout(e, read_timeout))?;
    read_reply(response, read_timeout).await
}

pub(crate) fn client_error(transport: &'static str, err: reqwest::Error) -> ConfigError {
    ConfigError::Invalid { field: transport, reason: format!("cannot build HTTP client: {}", err) }
}

/// Fills in the configured limit, which reqwest does not report.
pub(crate) fn with_timeout(err: reqwest::Error, limit: Duration) -> TransportError {
    match TransportError::from(err) {
        TransportError::Timeout { phase, .. } => TransportError::Timeout { phase, timeout: limit },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EnvelopeCodec, FieldMap};
    use crate::config::KeySettings;
    use crate::transport::Operation;

    fn request(operation: Operation) -> OutboundRequest {
        let keys = KeySettings {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            service_key: "svc".into(),
            ..KeySettings::default()
        };
        let codec = EnvelopeCodec::new(&keys, true).unwrap();
        let fields = FieldMap::new();
        let sealed = codec.encode(&fields, None).unwrap();
        OutboundRequest { operation, fields, sealed: Some(sealed) }
    }

    #[test]
    fn urls_follow_the_configured_paths() {
        let transport = HttpTransport::new(&TransportSettings::default()).unwrap();
        let endpoint = Endpoint::parse("10.0.0.1:8080").unwrap();
        assert_eq!(
            transport.url(&endpoint, &request(Operation::Approve)),
            "http://10.0.0.1:8080/oauth"
        );
        assert_eq!(
            transport.url(&endpoint, &request(Operation::Logout)),
            "http://10.0.0.1:8080/logout"
        );
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(&TransportSettings::default()).unwrap();
        let endpoint = Endpoint::parse(&format!("127.0.0.1:{}", port)).unwrap();
        let err = transport.exchange(&endpoint, &request(Operation::Approve)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)), "{:?}", err);
    }
}
