//! Transport bindings.
//!
//! A [`Transport`] moves one sealed request to one authority endpoint and brings back the
//! authority's reply in the generic [`Reply`] shape. Everything else (endpoint choice, sealing,
//! reply opening, breaker, retry, cache, context updates) is done once by the client, so a
//! binding only has to know its wire.
//!
//! Bindings that keep a long-lived connection per authority share [`ConnectionPool`], which
//! guarantees at most one connection attempt per authority at a time and drops connections that
//! report themselves closed. Dialing one authority never blocks callers of another.

pub mod http;
pub mod http2;
pub mod lite;
pub mod oauth2;
pub mod rsocket;
pub mod tcp;
pub mod udp;

#[cfg(feature = "grpc")]
pub mod grpc;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::codec::{FieldMap, FieldStyle, SealedRequest};
use crate::config::{AuthClientConfig, KeySettings, PathSettings, TimeoutSettings};
use crate::error::{CodecError, TransportError};
use crate::model::Reply;
use crate::selector::Endpoint;

/// What a request asks the authority to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Approve,
    Login,
    Logout,
    Upgrade,
    AppKey,
    OnlineStatus,
    OnlineUsers,
    TemporaryToken,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Approve,
        Operation::Login,
        Operation::Logout,
        Operation::Upgrade,
        Operation::AppKey,
        Operation::OnlineStatus,
        Operation::OnlineUsers,
        Operation::TemporaryToken,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Approve => "approve",
            Operation::Login => "login",
            Operation::Logout => "logout",
            Operation::Upgrade => "upgrade",
            Operation::AppKey => "app-key",
            Operation::OnlineStatus => "online-status",
            Operation::OnlineUsers => "online-users",
            Operation::TemporaryToken => "temporary-token",
        }
    }

    /// Route name used by message-oriented bindings, e.g. `oauth.approve`.
    pub fn route(self) -> String {
        format!("oauth.{}", self.as_str())
    }

    /// HTTP path for this operation.
    pub fn path(self, paths: &PathSettings) -> &str {
        match self {
            Operation::Approve => &paths.approve,
            Operation::Login => &paths.login,
            Operation::Logout => &paths.logout,
            Operation::Upgrade => &paths.upgrade,
            Operation::AppKey => &paths.app_key,
            Operation::OnlineStatus => &paths.online_status,
            Operation::OnlineUsers => &paths.online_users,
            Operation::TemporaryToken => &paths.temporary_token,
        }
    }

    /// The four operations every socket binding speaks.
    pub const fn is_core(self) -> bool {
        matches!(
            self,
            Operation::Approve | Operation::Login | Operation::Logout | Operation::Upgrade
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request, ready for the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub operation: Operation,
    /// The plain field map, already named for the transport's [`FieldStyle`]. Only bindings that
    /// do not seal (lite, OAuth2) read it.
    pub fields: FieldMap,
    /// `None` when the binding opted out through [`Transport::seals_requests`].
    pub sealed: Option<SealedRequest>,
}

impl OutboundRequest {
    pub fn sealed(&self) -> Result<&SealedRequest, CodecError> {
        self.sealed.as_ref().ok_or(CodecError::Unsealed)
    }
}

/// A reply as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// Data may be sealed and must go through the envelope codec.
    Sealed(Reply),
    /// The binding already produced plaintext (it does not use the envelope).
    Plain(Reply),
}

/// Settings a binding is built from.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub timeouts: TimeoutSettings,
    pub paths: PathSettings,
    pub keys: KeySettings,
    pub app_name: String,
}

impl TransportSettings {
    pub fn from_config(config: &AuthClientConfig) -> Self {
        Self {
            timeouts: config.timeouts.clone(),
            paths: config.paths.clone(),
            keys: config.keys.clone(),
            app_name: config.app_name.clone(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from_config(&AuthClientConfig::default())
    }
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Registry name, also used in telemetry.
    fn name(&self) -> &'static str;

    /// Operations this binding cannot express get a neutral default from the client without I/O.
    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    /// Field naming applied before sealing.
    fn field_style(&self) -> FieldStyle {
        FieldStyle::Full
    }

    /// Whether the client should build an envelope for this binding at all.
    fn seals_requests(&self) -> bool {
        true
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError>;

    /// Drops any pooled connections.
    async fn close(&self) {}
}

/// Lifecycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

pub trait Connection: Send + Sync + 'static {
    fn state(&self) -> ConnectionState;

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Stops background work and marks the connection closed.
    fn shutdown(&self) {}
}

type Slot<C> = Arc<Mutex<Option<Arc<C>>>>;

/// At most one live connection per authority.
pub struct ConnectionPool<C> {
    slots: DashMap<String, Slot<C>>,
}

impl<C> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self { slots: DashMap::new() }
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, authority: &str) -> Slot<C> {
        Arc::clone(self.slots.entry(authority.to_string()).or_default().value())
    }

    fn all_slots(&self) -> Vec<Slot<C>> {
        self.slots.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Returns the open connection for `authority`, connecting if there is none.
    ///
    /// Only that authority's slot is locked while connecting: concurrent callers of the same
    /// authority wait for the one attempt, callers of other authorities go ahead.
    pub async fn ensure_connected<F, Fut>(
        &self,
        authority: &str,
        connect: F,
    ) -> Result<Arc<C>, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, TransportError>>,
    {
        let slot = self.slot(authority);
        let mut current = slot.lock().await;
        if let Some(existing) = current.take() {
            if existing.is_open() {
                *current = Some(Arc::clone(&existing));
                return Ok(existing);
            }
            tracing::debug!(authority, "replacing closed connection");
            existing.shutdown();
        }
        let connection = Arc::new(connect().await?);
        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Forgets the connection for `authority` after an I/O failure.
    pub async fn discard(&self, authority: &str) {
        let Some(slot) = self.slots.get(authority).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        if let Some(connection) = slot.lock().await.take() {
            connection.shutdown();
        };
    }

    pub async fn close_all(&self) {
        for slot in self.all_slots() {
            if let Some(connection) = slot.lock().await.take() {
                connection.shutdown();
            }
        }
    }

    /// Number of authorities with a live connection. Waits for dials in progress.
    pub async fn len(&self) -> usize {
        let mut live = 0;
        for slot in self.all_slots() {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }
}

/// Runs `future` under `limit`, reporting `phase` on expiry.
pub(crate) async fn within<T, Fut>(
    phase: &'static str,
    limit: Duration,
    future: Fut,
) -> Result<T, TransportError>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TransportError::Timeout { phase, timeout: limit })?
}
