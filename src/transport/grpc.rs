//! RPC binding: unary calls on `authwire.AuthService` over HTTP/2.
//!
//! ```text
//! service AuthService {
//!   rpc Approve (AuthRequest) returns (AuthReply);
//!   rpc Login   (AuthRequest) returns (AuthReply);
//!   rpc Logout  (AuthRequest) returns (AuthReply);
//!   rpc Upgrade (AuthRequest) returns (AuthReply);
//! }
//! message AuthRequest { string data = 1; map<string, string> metadata = 2; }
//! message AuthReply { string code = 1; optional string message = 2; optional string data = 3; }
//! ```
//!
//! `AuthReply.data` is the JSON text of the reply data. The sidecar travels both in
//! `AuthRequest.metadata` and as call metadata.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;

use super::{
    Connection, ConnectionPool, ConnectionState, Operation, OutboundRequest, Received, Transport,
    TransportSettings,
};
use crate::error::{CodecError, TransportError};
use crate::model::Reply;
use crate::selector::Endpoint;

pub const SERVICE: &str = "authwire.AuthService";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub data: String,
    #[prost(map = "string, string", tag = "2")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthReply {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub data: Option<String>,
}

impl TryFrom<AuthReply> for Reply {
    type Error = CodecError;

    fn try_from(reply: AuthReply) -> Result<Self, CodecError> {
        let data = reply
            .data
            .filter(|d| !d.is_empty())
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Reply { code: reply.code, message: reply.message, data })
    }
}

impl TryFrom<&Reply> for AuthReply {
    type Error = CodecError;

    fn try_from(reply: &Reply) -> Result<Self, CodecError> {
        let data = reply
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(AuthReply { code: reply.code.clone(), message: reply.message.clone(), data })
    }
}

/// Method path for `operation`, if the service has one.
pub fn method_path(operation: Operation) -> Option<&'static str> {
    match operation {
        Operation::Approve => Some("/authwire.AuthService/Approve"),
        Operation::Login => Some("/authwire.AuthService/Login"),
        Operation::Logout => Some("/authwire.AuthService/Logout"),
        Operation::Upgrade => Some("/authwire.AuthService/Upgrade"),
        _ => None,
    }
}

fn status_error(status: tonic::Status, timeout: Duration) -> TransportError {
    match status.code() {
        tonic::Code::Unavailable => TransportError::Unreachable(status.message().to_string()),
        tonic::Code::DeadlineExceeded => TransportError::Timeout { phase: "grpc call", timeout },
        code => TransportError::Io(format!("{:?}: {}", code, status.message())),
    }
}

/// Tonic channels reconnect on their own; the pool only avoids dialing twice.
pub struct GrpcConnection {
    channel: Channel,
}

impl Connection for GrpcConnection {
    fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }
}

#[derive(Debug)]
pub struct GrpcTransport {
    pool: ConnectionPool<GrpcConnection>,
    connect_timeout: Duration,
    read_timeout: Duration,
    keep_alive: Duration,
}

impl GrpcTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            pool: ConnectionPool::new(),
            connect_timeout: settings.timeouts.connect(),
            read_timeout: settings.timeouts.read(),
            keep_alive: settings.timeouts.heartbeat(),
        }
    }

    async fn connect(&self, base_url: &str) -> Result<GrpcConnection, TransportError> {
        let channel = tonic::transport::Endpoint::from_shared(base_url.to_string())
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", base_url, e)))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .http2_keep_alive_interval(self.keep_alive)
            .keep_alive_timeout(Duration::from_secs(5))
            .keep_alive_while_idle(true)
            .connect()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", base_url, e)))?;
        tracing::debug!(target: "authwire::grpc", base_url, "channel established");
        Ok(GrpcConnection { channel })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn supports(&self, operation: Operation) -> bool {
        method_path(operation).is_some()
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let path = method_path(request.operation).ok_or_else(|| {
            TransportError::Frame(format!("{} has no {} method", request.operation, SERVICE))
        })?;
        let base_url = endpoint.base_url();
        let connection = self.pool.ensure_connected(&base_url, || self.connect(&base_url)).await?;

        let sealed = request.sealed()?;
        let headers = sealed.headers();
        let message = AuthRequest {
            data: sealed.envelope.ciphertext.clone(),
            metadata: headers.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        };
        let mut call = tonic::Request::new(message);
        for (name, value) in &headers {
            let value = MetadataValue::try_from(value.as_str())
                .map_err(|e| CodecError::Malformed(format!("metadata {}: {}", name, e)))?;
            call.metadata_mut().insert(*name, value);
        }

        let mut client = tonic::client::Grpc::new(connection.channel.clone());
        client
            .ready()
            .await
            .map_err(|e| TransportError::Unreachable(format!("channel not ready: {}", e)))?;
        let response: tonic::Response<AuthReply> = client
            .unary(call, PathAndQuery::from_static(path), tonic_prost::ProstCodec::default())
            .await
            .map_err(|status| status_error(status, self.read_timeout))?;
        let reply = Reply::try_from(response.into_inner())?;
        Ok(Received::Sealed(reply))
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}
