//! In-process fake authorities for the integration tests.
//!
//! Every server opens requests with the same keys the client seals with, hands the opened field
//! map to a handler and seals whatever the handler returns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use authwire::codec::compact::{self, FieldStyle};
use authwire::codec::{headers as wire, Envelope, EnvelopeCodec, FieldMap, SealedRequest};
use authwire::config::{AuthClientConfig, KeySettings};
use authwire::model::{codes, Reply, UserPrincipal};
use authwire::transport::{tcp, udp};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

pub fn keys() -> KeySettings {
    KeySettings {
        access_key: "ak-test".into(),
        secret_key: "sk-test".into(),
        service_key: "svc-test".into(),
        ..KeySettings::default()
    }
}

/// Test config: shared keys, no retries, short timeouts.
pub fn config(protocol: &str, address: impl Into<String>) -> AuthClientConfig {
    let mut config = AuthClientConfig {
        protocol: protocol.into(),
        address: address.into(),
        app_name: "integration".into(),
        keys: keys(),
        ..AuthClientConfig::default()
    };
    config.retry.enabled = false;
    config.timeouts.connect_ms = 1_000;
    config.timeouts.read_ms = 2_000;
    config.timeouts.response_ms = 2_000;
    config.timeouts.heartbeat_ms = 5_000;
    config
}

/// An address where nothing listens.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// `tracing` writer that keeps everything in memory.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Installs a subscriber writing here for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn principal_reply(user_id: &str, username: &str) -> Reply {
    Reply::ok(json!(UserPrincipal::new(user_id, username)))
}

pub fn rejected_reply() -> Reply {
    Reply::with_code(codes::RESOURCE_OAUTH_ERROR, "invalid token")
}

type Handler = Arc<dyn Fn(&str, &FieldMap) -> Reply + Send + Sync>;

/// Answers requests with `handler(operation, fields)` and counts them.
#[derive(Clone)]
pub struct Authority {
    codec: EnvelopeCodec,
    handler: Handler,
    calls: Arc<AtomicUsize>,
}

impl Authority {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &FieldMap) -> Reply + Send + Sync + 'static,
    {
        Self {
            codec: EnvelopeCodec::new(&keys(), true).unwrap(),
            handler: Arc::new(handler),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accepts every credential as `alice`.
    pub fn approving() -> Self {
        Self::new(|_, _| principal_reply("u-1", "alice"))
    }

    pub fn rejecting() -> Self {
        Self::new(|_, _| rejected_reply())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sealed reply plus the serial it is bound to.
    pub fn answer(&self, operation: &str, envelope: &Envelope) -> (Reply, Option<String>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.codec.open_request(envelope) {
            Ok(opened) => {
                let reply = (self.handler)(operation, &opened.fields);
                let serial = opened.reply_key.serial().to_string();
                match self.codec.seal_reply(reply, &opened.reply_key) {
                    Ok(sealed) => (sealed, Some(serial)),
                    Err(err) => (Reply::with_code("500", err.to_string()), None),
                }
            }
            Err(err) => (Reply::with_code(codes::RESOURCE_OAUTH_ERROR, err.to_string()), None),
        }
    }

    pub fn answer_plain(&self, operation: &str, fields: &FieldMap) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(operation, fields)
    }
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Envelope-over-HTTP authority. The operation handed to the handler is the request path.
pub async fn spawn_http(authority: Authority) -> SocketAddr {
    serve(Router::new().route("/{*path}", post(sealed_handler)).with_state(authority)).await
}

async fn sealed_handler(
    State(authority): State<Authority>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let ciphertext = body.get("data").and_then(Value::as_str).unwrap_or_default().to_string();
    let parts = SealedRequest::from_headers(ciphertext, |name: &str| {
        headers.get(name).and_then(|v| v.to_str().ok())
    });
    let Ok((envelope, _sidecar)) = parts else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let (reply, serial) = authority.answer(&path, &envelope);
    let mut response = Json(reply).into_response();
    if let Some(serial) = serial.and_then(|s| HeaderValue::from_str(&s).ok()) {
        response.headers_mut().insert(wire::RESPONSE_SERIAL, serial);
    }
    response
}

/// Answers every path with `status` and an empty body.
pub async fn spawn_http_status(status: u16) -> SocketAddr {
    let status = StatusCode::from_u16(status).unwrap();
    serve(Router::new().route("/{*path}", post(move || async move { status }))).await
}

/// Plain-JSON authority for the lite binding.
pub async fn spawn_lite(authority: Authority) -> SocketAddr {
    serve(Router::new().route("/{*path}", post(plain_handler)).with_state(authority)).await
}

async fn plain_handler(
    State(authority): State<Authority>,
    Path(path): Path<String>,
    Json(fields): Json<FieldMap>,
) -> Json<Reply> {
    Json(authority.answer_plain(&path, &fields))
}

fn frame_operation(kind: u8) -> &'static str {
    match kind {
        tcp::frame_type::LOGIN => "login",
        tcp::frame_type::LOGOUT => "logout",
        tcp::frame_type::APPROVE => "approve",
        tcp::frame_type::UPGRADE => "upgrade",
        _ => "unknown",
    }
}

fn reply_kind(reply: &Reply) -> u8 {
    if reply.code == codes::OK {
        tcp::frame_type::SUCCESS
    } else {
        tcp::frame_type::ERROR
    }
}

/// Framed TCP authority that stamps `version` on every reply frame.
pub async fn spawn_tcp(authority: Authority, version: u8) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let authority = authority.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; tcp::HEADER_LEN];
                    if socket.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
                    let mut payload = vec![0u8; len as usize];
                    if socket.read_exact(&mut payload).await.is_err() {
                        break;
                    }
                    let Ok((envelope, _)) = compact::unpack_request(FieldStyle::Tcp, &payload)
                    else {
                        break;
                    };
                    let (reply, _) = authority.answer(frame_operation(header[1]), &envelope);
                    let body = compact::pack_reply(&reply).unwrap();
                    let mut frame = tcp::encode_frame(reply_kind(&reply), &body).unwrap();
                    frame[0] = version;
                    if socket.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Client address whose derived TCP port is `addr`'s port.
pub fn tcp_address(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port() - 1)
}

pub async fn spawn_udp(authority: Authority) -> SocketAddr {
    spawn_udp_skewed(authority, 0).await
}

/// UDP authority that stamps `request sequence + skew` on its replies.
pub async fn spawn_udp_skewed(authority: Authority, skew: u16) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buffer = vec![0u8; 4096];
        while let Ok((received, peer)) = socket.recv_from(&mut buffer).await {
            let Ok((header, body)) = udp::decode_packet(&buffer[..received]) else { continue };
            let Ok((envelope, _)) = compact::unpack_request(FieldStyle::Udp, body) else {
                continue;
            };
            let (reply, _) = authority.answer(frame_operation(header.kind), &envelope);
            let body = compact::pack_reply(&reply).unwrap();
            let packet = udp::encode_packet(reply_kind(&reply), header.sequence.wrapping_add(skew), &body).unwrap();
            let _ = socket.send_to(&packet, peer).await;
        }
    });
    addr
}

/// Client address whose derived UDP port is `addr`'s port.
pub fn udp_address(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port() - 2)
}

#[cfg(feature = "websocket")]
pub async fn spawn_websocket(authority: Authority) -> SocketAddr {
    use authwire::transport::websocket::{WsFrame, WsRequest};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let authority = authority.clone();
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else { return };
                while let Some(Ok(message)) = socket.next().await {
                    let Message::Text(text) = message else { continue };
                    let Ok(frame) = serde_json::from_str::<WsFrame>(&text) else { continue };
                    let Ok(request) = serde_json::from_value::<WsRequest>(frame.payload) else {
                        continue;
                    };
                    let parts = SealedRequest::from_headers(request.data, |name: &str| {
                        request.headers.get(name).and_then(Value::as_str)
                    });
                    let Ok((envelope, _)) = parts else { continue };
                    let (reply, _) = authority.answer(&frame.kind, &envelope);
                    let response = WsFrame::response(frame.id, &reply).unwrap();
                    let text = serde_json::to_string(&response).unwrap();
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// RSocket authority; the operation handed to the handler is the metadata route.
pub async fn spawn_rsocket(authority: Authority) -> SocketAddr {
    use authwire::transport::rsocket::{Frame, FrameCodec};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let authority = authority.clone();
            tokio::spawn(async move {
                let mut frames = Framed::new(stream, FrameCodec::default());
                while let Some(Ok(frame)) = frames.next().await {
                    let answer = match frame {
                        Frame::Keepalive { respond: true, data, .. } => {
                            Frame::Keepalive { respond: false, position: 0, data }
                        }
                        Frame::RequestResponse { stream_id, metadata, data } => {
                            let metadata: serde_json::Map<String, Value> =
                                serde_json::from_slice(&metadata).unwrap_or_default();
                            let body: Value = serde_json::from_slice(&data).unwrap_or_default();
                            let ciphertext =
                                body.get("data").and_then(Value::as_str).unwrap_or_default();
                            let parts = SealedRequest::from_headers(ciphertext, |name: &str| {
                                metadata.get(name).and_then(Value::as_str)
                            });
                            match parts {
                                Ok((envelope, _)) => {
                                    let route = metadata
                                        .get("route")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default();
                                    let (reply, _) = authority.answer(route, &envelope);
                                    Frame::Payload {
                                        stream_id,
                                        metadata: None,
                                        data: Bytes::from(serde_json::to_vec(&reply).unwrap()),
                                        complete: true,
                                        next: true,
                                    }
                                }
                                Err(err) => Frame::Error { stream_id, code: 0x201, message: err.to_string() },
                            }
                        }
                        _ => continue,
                    };
                    if frames.send(answer).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// `authwire.AuthService` authority. The operation handed to the handler is the method name.
#[cfg(feature = "grpc")]
pub async fn spawn_grpc(authority: Authority) -> SocketAddr {
    use authwire::transport::grpc::{AuthReply, AuthRequest};
    use axum::body::Body;
    use axum::http::Request;

    async fn unary(
        State(authority): State<Authority>,
        Path(method): Path<String>,
        request: Request<Body>,
    ) -> Response {
        let method = AuthMethod { authority, method };
        let codec = tonic_prost::ProstCodec::<AuthReply, AuthRequest>::default();
        let mut grpc = tonic::server::Grpc::new(codec);
        grpc.unary(method, request).await.into_response()
    }

    serve(Router::new().route("/authwire.AuthService/{method}", post(unary)).with_state(authority))
        .await
}

#[cfg(feature = "grpc")]
struct AuthMethod {
    authority: Authority,
    method: String,
}

#[cfg(feature = "grpc")]
impl tonic::server::UnaryService<authwire::transport::grpc::AuthRequest> for AuthMethod {
    type Response = authwire::transport::grpc::AuthReply;
    type Future = std::future::Ready<Result<tonic::Response<Self::Response>, tonic::Status>>;

    fn call(
        &mut self,
        request: tonic::Request<authwire::transport::grpc::AuthRequest>,
    ) -> Self::Future {
        let has_call_metadata = request.metadata().contains_key(wire::ACCESS_KEY);
        let message = request.into_inner();
        let parts = SealedRequest::from_headers(message.data, |name: &str| {
            message.metadata.get(name).map(String::as_str)
        });
        let result = match parts {
            Ok(_) if !has_call_metadata => {
                Err(tonic::Status::invalid_argument("sidecar missing from call metadata"))
            }
            Ok((envelope, _)) => {
                let (reply, _) = self.authority.answer(&self.method.to_lowercase(), &envelope);
                authwire::transport::grpc::AuthReply::try_from(&reply)
                    .map(tonic::Response::new)
                    .map_err(|e| tonic::Status::internal(e.to_string()))
            }
            Err(err) => Err(tonic::Status::invalid_argument(err.to_string())),
        };
        std::future::ready(result)
    }
}
