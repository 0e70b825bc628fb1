//! Framed binary binding over a persistent TCP connection.
//!
//! Frame: `[version: u8 = 1][type: u8][length: u32 BE][payload]`. The payload is the gzipped
//! envelope with TCP-style short names. Replies use type `0x10` (success) or `0x11` (error) and
//! carry the gzipped [`Reply`](crate::model::Reply) JSON.
//!
//! The port is the HTTP port + 1 (8081 when the address has none). One connection is kept per
//! authority and dropped on any I/O failure; the next call reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{
    within, Connection, ConnectionPool, ConnectionState, Operation, OutboundRequest, Received,
    Transport, TransportSettings,
};
use crate::codec::compact::{self, FieldStyle};
use crate::error::TransportError;
use crate::model::{codes, Reply};
use crate::selector::Endpoint;

pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 6;
/// Replies larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub mod frame_type {
    pub const LOGIN: u8 = 0x01;
    pub const LOGOUT: u8 = 0x02;
    pub const APPROVE: u8 = 0x03;
    pub const UPGRADE: u8 = 0x04;
    pub const SUCCESS: u8 = 0x10;
    pub const ERROR: u8 = 0x11;
}

/// Request frame type for `operation`, for the four operations the socket bindings speak.
pub fn request_type(operation: Operation) -> Option<u8> {
    match operation {
        Operation::Login => Some(frame_type::LOGIN),
        Operation::Logout => Some(frame_type::LOGOUT),
        Operation::Approve => Some(frame_type::APPROVE),
        Operation::Upgrade => Some(frame_type::UPGRADE),
        _ => None,
    }
}

/// Turns a reply frame into a [`Reply`]. An error frame claiming success is rejected.
pub fn read_reply_frame(kind: u8, payload: &[u8]) -> Result<Reply, TransportError> {
    if kind != frame_type::SUCCESS && kind != frame_type::ERROR {
        return Err(TransportError::Frame(format!("unexpected reply type 0x{:02x}", kind)));
    }
    let reply = compact::unpack_reply(payload)?;
    if kind == frame_type::ERROR && reply.code == codes::OK {
        return Err(TransportError::Frame("error frame carries an OK code".into()));
    }
    Ok(reply)
}

pub fn encode_frame(kind: u8, payload: &[u8]) -> Result<BytesMut, TransportError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Frame("payload exceeds u32 length".into()))?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(VERSION);
    frame.put_u8(kind);
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame)
}

pub struct TcpConnection {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
}

impl Connection for TcpConnection {
    fn state(&self) -> ConnectionState {
        if self.open.load(Ordering::Acquire) {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl TcpConnection {
    async fn round_trip(
        &self,
        frame: &[u8],
        read_timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let mut stream = self.stream.lock().await;
        let result = within("tcp read", read_timeout, async {
            stream.write_all(frame).await?;
            stream.flush().await?;

            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).await?;
            if header[0] != VERSION {
                return Err(TransportError::Frame(format!(
                    "unsupported protocol version {}",
                    header[0]
                )));
            }
            let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(TransportError::Frame(format!("reply of {} bytes", len)));
            }
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;
            read_reply_frame(header[1], &payload)
        })
        .await;

        // A failed exchange leaves the stream at an unknown offset.
        if result.is_err() {
            self.shutdown();
        }
        result
    }
}

#[derive(Debug)]
pub struct TcpTransport {
    pool: ConnectionPool<TcpConnection>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            pool: ConnectionPool::new(),
            connect_timeout: settings.timeouts.connect(),
            read_timeout: settings.timeouts.read(),
        }
    }

    pub async fn open_connections(&self) -> usize {
        self.pool.len().await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn supports(&self, operation: Operation) -> bool {
        request_type(operation).is_some()
    }

    fn field_style(&self) -> FieldStyle {
        FieldStyle::Tcp
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let kind = request_type(request.operation).ok_or_else(|| {
            TransportError::Frame(format!("{} has no tcp frame type", request.operation))
        })?;
        let payload = compact::pack_request(FieldStyle::Tcp, request.sealed()?)?;
        let frame = encode_frame(kind, &payload)?;

        let address = format!("{}:{}", endpoint.host(), endpoint.tcp_port());
        let target = address.as_str();
        let connect_timeout = self.connect_timeout;
        let connection = self
            .pool
            .ensure_connected(target, move || async move {
                let stream = within("tcp connect", connect_timeout, async move {
                    Ok(TcpStream::connect(target).await?)
                })
                .await?;
                stream.set_nodelay(true)?;
                tracing::debug!(target: "authwire::tcp", address = target, "connected");
                Ok(TcpConnection { stream: Mutex::new(stream), open: AtomicBool::new(true) })
            })
            .await?;

        match connection.round_trip(&frame, self.read_timeout).await {
            Ok(reply) => Ok(Received::Sealed(reply)),
            Err(err) => {
                tracing::warn!(target: "authwire::tcp", %address, error = %err, "dropping connection");
                self.pool.discard(&address).await;
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_carry_version_type_and_length() {
        let frame = encode_frame(frame_type::APPROVE, b"abc").unwrap();
        assert_eq!(&frame[..], &[1, 0x03, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn error_frames_cannot_claim_success() {
        let ok = compact::pack_reply(&Reply::ok(json!({"userId": "1"}))).unwrap();
        assert!(read_reply_frame(frame_type::SUCCESS, &ok).is_ok());
        assert!(matches!(
            read_reply_frame(frame_type::ERROR, &ok),
            Err(TransportError::Frame(_))
        ));

        let rejected =
            compact::pack_reply(&Reply::with_code(codes::RESOURCE_OAUTH_ERROR, "no")).unwrap();
        let reply = read_reply_frame(frame_type::ERROR, &rejected).unwrap();
        assert_eq!(reply.code, codes::RESOURCE_OAUTH_ERROR);
        assert!(read_reply_frame(0x42, &rejected).is_err());
    }

    #[test]
    fn only_core_operations_have_frame_types() {
        assert_eq!(request_type(Operation::Upgrade), Some(frame_type::UPGRADE));
        assert_eq!(request_type(Operation::AppKey), None);
        assert_eq!(request_type(Operation::OnlineUsers), None);
    }
}
