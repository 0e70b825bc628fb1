//! Full-duplex binding over a WebSocket at `/ws/oauth`.
//!
//! Requests are text frames `{"id", "type": <operation>, "payload": {"data", "headers"}}`;
//! replies echo the id with `"type": "response"` and a [`Reply`] payload, or `"type": "error"`
//! with `{"message"}`. One socket is shared per authority, pinged every heartbeat interval and
//! replaced when it closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::{
    within, Connection, ConnectionPool, ConnectionState, Operation, OutboundRequest, Received,
    Transport, TransportSettings,
};
use crate::error::{CodecError, TransportError};
use crate::model::Reply;
use crate::selector::Endpoint;

pub const PATH: &str = "/ws/oauth";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = Arc<Mutex<SplitSink<Socket, Message>>>;
type Pending = Arc<DashMap<String, oneshot::Sender<Result<Reply, TransportError>>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsRequest {
    pub data: String,
    pub headers: serde_json::Map<String, Value>,
}

impl WsFrame {
    pub fn request(id: impl Into<String>, request: &OutboundRequest) -> Result<Self, CodecError> {
        let sealed = request.sealed()?;
        let payload = WsRequest { data: sealed.envelope.ciphertext.clone(), headers: sealed.metadata() };
        Ok(Self {
            id: id.into(),
            kind: request.operation.as_str().to_string(),
            payload: serde_json::to_value(payload).map_err(|e| CodecError::Malformed(e.to_string()))?,
        })
    }

    pub fn response(id: impl Into<String>, reply: &Reply) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.into(),
            kind: "response".into(),
            payload: serde_json::to_value(reply).map_err(|e| CodecError::Malformed(e.to_string()))?,
        })
    }

    /// Outcome carried by a reply frame.
    pub fn into_reply(self) -> Result<Reply, TransportError> {
        match self.kind.as_str() {
            "response" => serde_json::from_value(self.payload)
                .map_err(|e| CodecError::Malformed(e.to_string()).into()),
            "error" => {
                let message = self
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("authority reported an error")
                    .to_string();
                Err(TransportError::Frame(message))
            }
            other => Err(TransportError::Frame(format!("unexpected frame type {}", other))),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => io.into(),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            tungstenite::Error::Http(response) => TransportError::Status(response.status().as_u16()),
            other => TransportError::Io(other.to_string()),
        }
    }
}

pub struct WebSocketConnection {
    writer: Writer,
    pending: Pending,
    open: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection for WebSocketConnection {
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
        self.pending.clear();
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl WebSocketConnection {
    async fn connect(
        url: &str,
        connect_timeout: Duration,
        heartbeat: Duration,
    ) -> Result<Self, TransportError> {
        let (socket, _) = within("websocket connect", connect_timeout, async {
            Ok(tokio_tungstenite::connect_async(url).await?)
        })
        .await?;
        tracing::debug!(target: "authwire::websocket", url, "connected");

        let (sink, stream) = socket.split();
        let writer: Writer = Arc::new(Mutex::new(sink));
        let pending: Pending = Arc::new(DashMap::new());
        let open = Arc::new(AtomicBool::new(true));
        let tasks = vec![
            tokio::spawn(read_loop(stream, Arc::clone(&pending), Arc::clone(&open))),
            tokio::spawn(heartbeat_loop(Arc::clone(&writer), Arc::clone(&open), heartbeat)),
        ];
        Ok(Self { writer, pending, open, tasks })
    }

    async fn request(
        &self,
        request: &OutboundRequest,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let id = Uuid::new_v4().to_string();
        let frame = WsFrame::request(id.clone(), request)?;
        let text = serde_json::to_string(&frame).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if let Err(err) = self.writer.lock().await.send(Message::Text(text)).await {
            self.pending.remove(&id);
            self.shutdown();
            return Err(err.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout { phase: "websocket response", timeout })
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, pending: Pending, open: Arc<AtomicBool>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsFrame>(&text) {
                Ok(frame) => {
                    if let Some((_, tx)) = pending.remove(&frame.id) {
                        let _ = tx.send(frame.into_reply());
                    } else {
                        tracing::debug!(target: "authwire::websocket", id = %frame.id, "reply for unknown request");
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "authwire::websocket", error = %err, "unreadable frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "authwire::websocket", error = %err, "read failed");
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
    pending.clear();
}

async fn heartbeat_loop(writer: Writer, open: Arc<AtomicBool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !open.load(Ordering::Acquire) {
            break;
        }
        if writer.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
            open.store(false, Ordering::Release);
            break;
        }
    }
}

#[derive(Debug)]
pub struct WebSocketTransport {
    pool: ConnectionPool<WebSocketConnection>,
    connect_timeout: Duration,
    response_timeout: Duration,
    heartbeat: Duration,
}

impl WebSocketTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            pool: ConnectionPool::new(),
            connect_timeout: settings.timeouts.connect(),
            response_timeout: settings.timeouts.response(),
            heartbeat: settings.timeouts.heartbeat(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn supports(&self, operation: Operation) -> bool {
        operation.is_core() || operation == Operation::AppKey
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let url = endpoint.websocket_url(PATH);
        let target = url.as_str();
        let (connect_timeout, heartbeat) = (self.connect_timeout, self.heartbeat);
        let connection = self
            .pool
            .ensure_connected(target, move || {
                WebSocketConnection::connect(target, connect_timeout, heartbeat)
            })
            .await?;

        let result = connection.request(request, self.response_timeout).await;
        if !connection.is_open() {
            self.pool.discard(&url).await;
        }
        result.map(Received::Sealed)
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}
