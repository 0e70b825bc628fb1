//! Reactive request-response binding (RSocket framing over TCP).
//!
//! Frames are prefixed with a 24-bit length and carry `[stream id: u32][type << 10 | flags: u16]`.
//! The client sends `SETUP` once per connection, then one `REQUEST_RESPONSE` per call on its own
//! odd stream id. Metadata is JSON `{route, x-oauth-*...}`, data is JSON `{"data": ciphertext}`.
//! The authority answers with a `PAYLOAD` (reply JSON) or an `ERROR` frame on the same stream.
//!
//! Calls are multiplexed over one connection per authority. The port is the one in the address
//! (7000 when it has none). The reader task answers keepalives; a second task sends them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use super::{
    within, Connection, ConnectionPool, ConnectionState, Operation, OutboundRequest, Received,
    Transport, TransportSettings,
};
use crate::error::{CodecError, TransportError};
use crate::model::Reply;
use crate::selector::Endpoint;

pub const DEFAULT_PORT: u16 = 7000;
pub const MIME_JSON: &str = "application/json";
/// Largest frame a 24-bit length can describe.
pub const MAX_FRAME_LEN: usize = 0xFF_FFFF;
/// Connection lifetime advertised in `SETUP`, as a multiple of the keepalive interval.
const LIFETIME_FACTOR: u32 = 3;

pub mod kind {
    pub const SETUP: u8 = 0x01;
    pub const KEEPALIVE: u8 = 0x03;
    pub const REQUEST_RESPONSE: u8 = 0x04;
    pub const PAYLOAD: u8 = 0x0A;
    pub const ERROR: u8 = 0x0B;
}

pub mod flags {
    pub const METADATA: u16 = 0x100;
    /// `KEEPALIVE`: the peer must answer.
    pub const RESPOND: u16 = 0x80;
    pub const COMPLETE: u16 = 0x40;
    pub const NEXT: u16 = 0x20;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Setup { keepalive_ms: u32, lifetime_ms: u32 },
    Keepalive { respond: bool, position: u64, data: Bytes },
    RequestResponse { stream_id: u32, metadata: Bytes, data: Bytes },
    Payload { stream_id: u32, metadata: Option<Bytes>, data: Bytes, complete: bool, next: bool },
    Error { stream_id: u32, code: u32, message: String },
    /// Anything this client does not act on (LEASE, CANCEL, ...).
    Other { stream_id: u32, kind: u8 },
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        match self {
            Frame::Setup { keepalive_ms, lifetime_ms } => {
                put_header(&mut buf, 0, kind::SETUP, 0);
                buf.put_u16(1);
                buf.put_u16(0);
                buf.put_u32(*keepalive_ms);
                buf.put_u32(*lifetime_ms);
                for mime in [MIME_JSON, MIME_JSON] {
                    buf.put_u8(mime.len() as u8);
                    buf.put_slice(mime.as_bytes());
                }
            }
            Frame::Keepalive { respond, position, data } => {
                let flags = if *respond { flags::RESPOND } else { 0 };
                put_header(&mut buf, 0, kind::KEEPALIVE, flags);
                buf.put_u64(*position);
                buf.put_slice(data);
            }
            Frame::RequestResponse { stream_id, metadata, data } => {
                put_header(&mut buf, *stream_id, kind::REQUEST_RESPONSE, flags::METADATA);
                put_metadata(&mut buf, metadata)?;
                buf.put_slice(data);
            }
            Frame::Payload { stream_id, metadata, data, complete, next } => {
                let mut bits = 0;
                if metadata.is_some() {
                    bits |= flags::METADATA;
                }
                if *complete {
                    bits |= flags::COMPLETE;
                }
                if *next {
                    bits |= flags::NEXT;
                }
                put_header(&mut buf, *stream_id, kind::PAYLOAD, bits);
                if let Some(metadata) = metadata {
                    put_metadata(&mut buf, metadata)?;
                }
                buf.put_slice(data);
            }
            Frame::Error { stream_id, code, message } => {
                put_header(&mut buf, *stream_id, kind::ERROR, 0);
                buf.put_u32(*code);
                buf.put_slice(message.as_bytes());
            }
            Frame::Other { stream_id, kind } => put_header(&mut buf, *stream_id, *kind, 0),
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut src: Bytes) -> Result<Frame, TransportError> {
        need(&src, 6)?;
        let stream_id = src.get_u32() & 0x7FFF_FFFF;
        let header = src.get_u16();
        let frame_kind = (header >> 10) as u8;
        let bits = header & 0x3FF;
        let has_metadata = bits & flags::METADATA != 0;

        let frame = match frame_kind {
            kind::SETUP => {
                need(&src, 12)?;
                let _version = src.get_u32();
                let keepalive_ms = src.get_u32();
                let lifetime_ms = src.get_u32();
                for _ in 0..2 {
                    need(&src, 1)?;
                    let len = usize::from(src.get_u8());
                    need(&src, len)?;
                    src.advance(len);
                }
                Frame::Setup { keepalive_ms, lifetime_ms }
            }
            kind::KEEPALIVE => {
                need(&src, 8)?;
                let position = src.get_u64();
                Frame::Keepalive { respond: bits & flags::RESPOND != 0, position, data: src }
            }
            kind::REQUEST_RESPONSE => {
                let metadata = if has_metadata { take_metadata(&mut src)? } else { Bytes::new() };
                Frame::RequestResponse { stream_id, metadata, data: src }
            }
            kind::PAYLOAD => {
                let metadata = if has_metadata { Some(take_metadata(&mut src)?) } else { None };
                Frame::Payload {
                    stream_id,
                    metadata,
                    data: src,
                    complete: bits & flags::COMPLETE != 0,
                    next: bits & flags::NEXT != 0,
                }
            }
            kind::ERROR => {
                need(&src, 4)?;
                let code = src.get_u32();
                let message = String::from_utf8_lossy(&src).into_owned();
                Frame::Error { stream_id, code, message }
            }
            other => Frame::Other { stream_id, kind: other },
        };
        Ok(frame)
    }
}

fn put_header(buf: &mut BytesMut, stream_id: u32, frame_kind: u8, bits: u16) {
    buf.put_u32(stream_id & 0x7FFF_FFFF);
    buf.put_u16((u16::from(frame_kind) << 10) | (bits & 0x3FF));
}

fn put_metadata(buf: &mut BytesMut, metadata: &[u8]) -> Result<(), TransportError> {
    if metadata.len() > MAX_FRAME_LEN {
        return Err(TransportError::Frame("metadata exceeds 24-bit length".into()));
    }
    buf.put_uint(metadata.len() as u64, 3);
    buf.put_slice(metadata);
    Ok(())
}

fn take_metadata(src: &mut Bytes) -> Result<Bytes, TransportError> {
    need(src, 3)?;
    let len = src.get_uint(3) as usize;
    need(src, len)?;
    Ok(src.split_to(len))
}

fn need(src: &Bytes, len: usize) -> Result<(), TransportError> {
    if src.remaining() < len {
        return Err(TransportError::Frame(format!(
            "truncated frame: need {} bytes, have {}",
            len,
            src.remaining()
        )));
    }
    Ok(())
}

/// Length-prefixed [`Frame`] codec for [`Framed`] streams.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(3)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.inner.decode(src)? {
            Some(frame) => Frame::decode(frame.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        self.inner.encode(frame.encode()?, dst)?;
        Ok(())
    }
}

type Writer = Arc<Mutex<SplitSink<Framed<TcpStream, FrameCodec>, Frame>>>;
type Pending = Arc<DashMap<u32, oneshot::Sender<Result<Reply, TransportError>>>>;

pub struct RSocketConnection {
    writer: Writer,
    pending: Pending,
    next_stream: AtomicU32,
    open: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection for RSocketConnection {
    fn state(&self) -> ConnectionState {
        if self.open.load(Ordering::Acquire) {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        for task in &self.tasks {
            task.abort();
        }
        // Dropping the senders fails every waiting call with `Closed`.
        self.pending.clear();
    }
}

impl Drop for RSocketConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl RSocketConnection {
    async fn connect(
        address: &str,
        connect_timeout: Duration,
        keepalive: Duration,
    ) -> Result<Self, TransportError> {
        let stream = within("rsocket connect", connect_timeout, async {
            Ok(TcpStream::connect(address).await?)
        })
        .await?;
        stream.set_nodelay(true)?;
        let (mut sink, frames) = Framed::new(stream, FrameCodec::default()).split();

        let keepalive_ms = u32::try_from(keepalive.as_millis()).unwrap_or(u32::MAX);
        sink.send(Frame::Setup {
            keepalive_ms,
            lifetime_ms: keepalive_ms.saturating_mul(LIFETIME_FACTOR),
        })
        .await?;
        tracing::debug!(target: "authwire::rsocket", address, "connected");

        let writer: Writer = Arc::new(Mutex::new(sink));
        let pending: Pending = Arc::new(DashMap::new());
        let open = Arc::new(AtomicBool::new(true));
        let tasks = vec![
            tokio::spawn(read_loop(frames, Arc::clone(&writer), Arc::clone(&pending), Arc::clone(&open))),
            tokio::spawn(keepalive_loop(Arc::clone(&writer), Arc::clone(&open), keepalive)),
        ];
        Ok(Self { writer, pending, next_stream: AtomicU32::new(1), open, tasks })
    }

    async fn request(
        &self,
        metadata: Bytes,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let stream_id = self.next_stream.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(stream_id, tx);

        let sent =
            self.writer.lock().await.send(Frame::RequestResponse { stream_id, metadata, data }).await;
        if let Err(err) = sent {
            self.pending.remove(&stream_id);
            self.shutdown();
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&stream_id);
                Err(TransportError::Timeout { phase: "rsocket response", timeout })
            }
        }
    }
}

async fn read_loop(
    mut frames: SplitStream<Framed<TcpStream, FrameCodec>>,
    writer: Writer,
    pending: Pending,
    open: Arc<AtomicBool>,
) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Payload { stream_id, data, .. }) => {
                if let Some((_, tx)) = pending.remove(&stream_id) {
                    let _ = tx.send(parse_reply(&data));
                }
            }
            Ok(Frame::Error { stream_id: 0, code, message }) => {
                tracing::warn!(target: "authwire::rsocket", code, %message, "connection error");
                break;
            }
            Ok(Frame::Error { stream_id, code, message }) => {
                if let Some((_, tx)) = pending.remove(&stream_id) {
                    let _ = tx.send(Err(TransportError::Frame(format!(
                        "error 0x{:08x}: {}",
                        code, message
                    ))));
                }
            }
            Ok(Frame::Keepalive { respond: true, data, .. }) => {
                let answer = Frame::Keepalive { respond: false, position: 0, data };
                if writer.lock().await.send(answer).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "authwire::rsocket", error = %err, "read failed");
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
    pending.clear();
}

async fn keepalive_loop(writer: Writer, open: Arc<AtomicBool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !open.load(Ordering::Acquire) {
            break;
        }
        let ping = Frame::Keepalive { respond: true, position: 0, data: Bytes::new() };
        if writer.lock().await.send(ping).await.is_err() {
            open.store(false, Ordering::Release);
            break;
        }
    }
}

fn parse_reply(data: &[u8]) -> Result<Reply, TransportError> {
    if data.is_empty() {
        return Err(TransportError::EmptyReply);
    }
    serde_json::from_slice(data).map_err(|e| CodecError::Malformed(e.to_string()).into())
}

/// Metadata and data bodies for one call.
pub fn request_parts(request: &OutboundRequest) -> Result<(Bytes, Bytes), TransportError> {
    let sealed = request.sealed()?;
    let mut metadata = sealed.metadata();
    metadata.insert("route".into(), Value::String(request.operation.route()));
    let metadata = serde_json::to_vec(&metadata).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let data = serde_json::to_vec(&json!({ "data": sealed.envelope.ciphertext }))
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok((Bytes::from(metadata), Bytes::from(data)))
}

#[derive(Debug)]
pub struct RSocketTransport {
    pool: ConnectionPool<RSocketConnection>,
    connect_timeout: Duration,
    response_timeout: Duration,
    keepalive: Duration,
}

impl RSocketTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            pool: ConnectionPool::new(),
            connect_timeout: settings.timeouts.connect(),
            response_timeout: settings.timeouts.response(),
            keepalive: settings.timeouts.heartbeat(),
        }
    }
}

#[async_trait]
impl Transport for RSocketTransport {
    fn name(&self) -> &'static str {
        "rsocket"
    }

    fn supports(&self, operation: Operation) -> bool {
        operation.is_core() || operation == Operation::AppKey
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let (metadata, data) = request_parts(request)?;
        let address =
            format!("{}:{}", endpoint.host(), endpoint.http_port().unwrap_or(DEFAULT_PORT));
        let target = address.as_str();
        let (connect_timeout, keepalive) = (self.connect_timeout, self.keepalive);
        let connection = self
            .pool
            .ensure_connected(target, move || {
                RSocketConnection::connect(target, connect_timeout, keepalive)
            })
            .await?;

        let result = connection.request(metadata, data, self.response_timeout).await;
        if !connection.is_open() {
            self.pool.discard(&address).await;
        }
        result.map(Received::Sealed)
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}
