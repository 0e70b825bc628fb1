//! The verification client.
//!
//! One [`AuthClient`] owns one transport plus the shared machinery every call goes through:
//!
//! ```text
//! credential ─▶ cache ─(miss)─▶ selector ─▶ codec.encode ─▶ retry(breaker(transport)) ─▶ codec.decode
//!                  ▲                                                                        │
//!                  └──────────────────────────────── put ◀────────────── from_reply ◀───────┘
//! ```
//!
//! Bindings only implement [`Transport::exchange`]; everything above is done here once.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::cache::ResultCache;
use crate::clock::{unix_millis, Clock, MonotonicClock};
use crate::codec::{fields, EnvelopeCodec, FieldMap};
use crate::config::AuthClientConfig;
use crate::context::CallerContext;
use crate::credential::Credential;
use crate::error::{ClientError, ConfigError, ResilienceError, TransportError};
use crate::model::{
    codes, AppKeySecret, AuthType, AuthenticationInformation, Information, LoginAuthResult,
    LoginResult, LogoutType, OnlineStatus, OnlineUserQuery, OnlineUserResult, Reply, UpgradeType,
    UserPrincipal,
};
use crate::protocol::Protocol;
use crate::registry::TransportRegistry;
use crate::resilience::Resilience;
use crate::selector::{BalanceStrategy, EndpointSelector};
use crate::telemetry::{ClientEvent, EventEmitter, RequestOutcome};
use crate::transport::{Operation, OutboundRequest, Received, Transport, TransportSettings};

/// Why a call produced no authority reply.
#[derive(Debug)]
enum CallFailure {
    /// The binding has no way to express the operation. No I/O happened.
    Unsupported,
    /// Nothing was sent because the settings are unusable.
    Misconfigured(ConfigError),
    /// The call went out (or the breaker refused it) and ended in this status.
    Failed(AuthenticationInformation),
}

impl CallFailure {
    fn into_information(self, operation: Operation) -> AuthenticationInformation {
        match self {
            CallFailure::Unsupported => AuthenticationInformation::from_status(Information::Other)
                .with_message(format!("{} is not supported by this transport", operation)),
            CallFailure::Misconfigured(err) => {
                AuthenticationInformation::server_error().with_message(err.to_string())
            }
            CallFailure::Failed(info) => info,
        }
    }

    fn into_client_error(self, operation: Operation) -> ClientError {
        match self {
            CallFailure::Misconfigured(err) => ClientError::Configuration(err),
            other => ClientError::from_information(&other.into_information(operation)),
        }
    }
}

#[derive(Debug)]
pub struct AuthClient {
    config: AuthClientConfig,
    transport: Arc<dyn Transport>,
    codec: EnvelopeCodec,
    cache: ResultCache,
    selector: EndpointSelector,
    resilience: Resilience,
    events: EventEmitter,
}

/// Builds an [`AuthClient`]. The transport comes from `config.protocol` unless one is injected.
pub struct AuthClientBuilder {
    config: AuthClientConfig,
    registry: TransportRegistry,
    transport: Option<Arc<dyn Transport>>,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
}

impl AuthClientBuilder {
    pub fn new(config: AuthClientConfig) -> Self {
        Self {
            config,
            registry: TransportRegistry::with_defaults(),
            transport: None,
            events: EventEmitter::none(),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Resolve `config.protocol` in `registry` instead of the built-in one.
    pub fn registry(mut self, registry: TransportRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use `transport` as is; `config.protocol` is ignored.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Time source for breaker cooldowns and cache TTLs.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<AuthClient, ConfigError> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => self.registry.create(&config.protocol, &TransportSettings::from_config(&config))?,
        };
        let codec = EnvelopeCodec::new(&config.keys, config.encode)?;
        let selector =
            EndpointSelector::new(&config.address, BalanceStrategy::from_name(&config.balance)?)?;
        let cache = ResultCache::from_settings(&config.cache)
            .with_clock(Arc::clone(&self.clock))
            .with_events(self.events.clone());
        let resilience = Resilience::from_settings_with_clock(
            &config.circuit_breaker,
            &config.retry,
            self.events.clone(),
            Arc::clone(&self.clock),
        )?;

        tracing::info!(
            target: "authwire::client",
            transport = transport.name(),
            endpoints = selector.endpoints().len(),
            strategy = ?selector.strategy(),
            "client ready"
        );
        Ok(AuthClient {
            config,
            transport,
            codec,
            cache,
            selector,
            resilience,
            events: self.events,
        })
    }
}

impl AuthClient {
    pub fn builder(config: AuthClientConfig) -> AuthClientBuilder {
        AuthClientBuilder::new(config)
    }

    /// Client with the built-in registry and no telemetry.
    pub fn new(config: AuthClientConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &AuthClientConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    /// Swaps the authority list at runtime.
    pub fn refresh_addresses(&self, address: &str) -> Result<(), ConfigError> {
        self.selector.refresh(address)
    }

    /// Closes pooled connections. The client stays usable and reconnects on demand.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    fn base_fields(&self, credential: Option<&Credential>, ctx: Option<&CallerContext>) -> FieldMap {
        let mut map = FieldMap::new();
        if let Some(credential) = credential {
            if let Some(cookie) = credential.cookie(&self.config.cookie_name) {
                map.insert(fields::COOKIE.into(), json!(cookie));
            }
            if let Some(token) = credential.token() {
                map.insert(fields::TOKEN.into(), json!(token));
            }
        }
        map.insert(fields::ACCESS_KEY.into(), json!(self.codec.access_key()));
        map.insert(fields::SUB_PROTOCOL.into(), json!(self.config.sub_protocol.to_uppercase()));
        map.insert(fields::PARAM_APP_NAME.into(), json!(self.config.app_name));
        map.insert(fields::EXT_TIMESTAMP.into(), json!(unix_millis()));

        if let Some(ctx) = ctx {
            if let Some(address) = ctx.remote_address() {
                map.insert(fields::PARAM_ADDRESS.into(), json!(address));
            }
            let mut ext = Map::new();
            let parts = [
                ("address", ctx.remote_address()),
                ("fingerprint", ctx.device_fingerprint()),
                ("ua", ctx.user_agent()),
                ("timezone", ctx.timezone()),
            ];
            for (key, value) in parts {
                if let Some(value) = value {
                    ext.insert(key.into(), json!(value));
                }
            }
            if !ext.is_empty() {
                map.insert(fields::EXT.into(), Value::Object(ext));
            }
        }
        map
    }

    async fn exchange(
        &self,
        operation: Operation,
        field_map: FieldMap,
        upgrade_type: Option<UpgradeType>,
    ) -> Result<Reply, CallFailure> {
        if !self.transport.supports(operation) {
            tracing::debug!(target: "authwire::client", %operation, transport = self.transport.name(), "operation not supported");
            return Err(CallFailure::Unsupported);
        }
        let Some(endpoint) = self.selector.select() else {
            tracing::error!(target: "authwire::client", %operation, "no authority address configured");
            return Err(CallFailure::Misconfigured(ConfigError::NoAuthority));
        };

        let field_map = self.transport.field_style().abbreviate(&field_map);
        let (codec, transport, endpoint_ref, field_ref) =
            (&self.codec, &self.transport, &endpoint, &field_map);
        let seals = self.transport.seals_requests();
        let attempt = move || async move {
            let sealed = if seals { Some(codec.encode(field_ref, upgrade_type)?) } else { None };
            let request = OutboundRequest { operation, fields: field_ref.clone(), sealed };
            let reply = match transport.exchange(endpoint_ref, &request).await? {
                Received::Sealed(reply) => codec.decode_reply(reply, request.sealed()?.reply_key())?,
                Received::Plain(reply) => reply,
            };
            Ok::<_, TransportError>(reply)
        };

        let started = Instant::now();
        let outcome = self.resilience.execute(attempt).await;
        let duration = started.elapsed();
        let name = self.transport.name();

        let result = match outcome {
            Ok(reply) => {
                tracing::debug!(target: "authwire::client", %operation, %endpoint, code = %reply.code, ?duration, "authority replied");
                Ok(reply)
            }
            Err(ResilienceError::Inner(TransportError::Config(err))) => {
                tracing::error!(target: "authwire::client", %operation, error = %err, "configuration error");
                Err(CallFailure::Misconfigured(err))
            }
            Err(ResilienceError::CircuitOpen { .. }) => {
                tracing::warn!(target: "authwire::client", %operation, "circuit open; using fallback");
                Err(CallFailure::Failed(self.resilience.fallback()))
            }
            Err(err) => Err(CallFailure::Failed(Resilience::failure_of(&err))),
        };

        let event = match &result {
            Ok(_) => RequestOutcome::Success { transport: name, duration },
            Err(CallFailure::Failed(info)) => {
                RequestOutcome::Failure { transport: name, status: info.status(), duration }
            }
            Err(_) => {
                RequestOutcome::Failure { transport: name, status: Information::ServerError, duration }
            }
        };
        self.events.emit(ClientEvent::Request(event)).await;
        result
    }

    /// Context side effects of a verification result.
    ///
    /// A rejected credential and an `OK` reply without a principal both unregister the caller;
    /// transport failures leave the context alone.
    fn apply(&self, info: &AuthenticationInformation, ctx: &CallerContext) {
        if let Some(principal) = info.principal() {
            ctx.apply(principal);
            return;
        }
        if matches!(
            info.status(),
            Information::AuthenticationFailure | Information::AuthenticationServerException
        ) {
            ctx.clear_user();
            ctx.remove_cookie(&self.config.cookie_name);
        }
    }
}

fn reply_data<T: DeserializeOwned>(reply: Reply, what: &str) -> Option<T> {
    if reply.code != codes::OK {
        tracing::debug!(target: "authwire::client", code = %reply.code, what, "authority declined");
        return None;
    }
    let data = reply.data?;
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(target: "authwire::client", error = %err, what, "unreadable reply data");
            None
        }
    }
}

#[async_trait]
impl Protocol for AuthClient {
    async fn approve(
        &self,
        credential: &Credential,
        ctx: &CallerContext,
    ) -> AuthenticationInformation {
        let Some(fingerprint) = credential.fingerprint(&self.config.cookie_name) else {
            tracing::debug!(target: "authwire::client", "no credential presented");
            return AuthenticationInformation::no_auth();
        };
        if let Some(cached) = self.cache.get(fingerprint).await {
            self.apply(&cached, ctx);
            return cached;
        }

        let field_map = self.base_fields(Some(credential), Some(ctx));
        let info = match self.exchange(Operation::Approve, field_map, None).await {
            Ok(reply) => AuthenticationInformation::from_reply(reply),
            Err(failure) => failure.into_information(Operation::Approve),
        };
        self.apply(&info, ctx);
        self.cache.put(fingerprint, info.clone());
        info
    }

    async fn authenticate_app_key(
        &self,
        secret: &AppKeySecret,
        ctx: &CallerContext,
    ) -> AuthenticationInformation {
        let mut field_map = self.base_fields(None, Some(ctx));
        field_map.insert(fields::USER_CODE.into(), json!(secret));
        let info = match self.exchange(Operation::AppKey, field_map, None).await {
            Ok(reply) => AuthenticationInformation::from_reply(reply),
            Err(failure) => failure.into_information(Operation::AppKey),
        };
        if let Some(principal) = info.principal() {
            ctx.apply(principal);
        }
        info
    }

    async fn upgrade(
        &self,
        credential: &Credential,
        upgrade_type: UpgradeType,
        refresh_token: Option<&str>,
        ctx: &CallerContext,
    ) -> Result<LoginResult, ClientError> {
        let mut field_map = self.base_fields(Some(credential), Some(ctx));
        field_map.insert(fields::UPGRADE_TYPE.into(), json!(upgrade_type.as_str()));
        if let Some(refresh_token) = refresh_token {
            field_map.insert(fields::REFRESH_TOKEN.into(), json!(refresh_token));
        }

        let reply = self
            .exchange(Operation::Upgrade, field_map, Some(upgrade_type))
            .await
            .map_err(|failure| failure.into_client_error(Operation::Upgrade))?;
        let info = AuthenticationInformation::from_reply(reply);
        let Some(principal) = info.principal().cloned() else {
            return Err(ClientError::from_information(&info));
        };

        if upgrade_type == UpgradeType::Version {
            if let Some(fingerprint) = credential.fingerprint(&self.config.cookie_name) {
                self.cache.invalidate(fingerprint);
            }
            ctx.clear_user();
        }
        Ok(LoginResult {
            token: info.token().map(str::to_string),
            refresh_token: info.refresh_token().map(str::to_string),
            principal,
        })
    }

    async fn get_access_token(
        &self,
        username: &str,
        password: &str,
        auth_type: AuthType,
        ext: &Map<String, Value>,
    ) -> Result<LoginAuthResult, ClientError> {
        let mut field_map = self.base_fields(None, None);
        field_map.insert(fields::USERNAME.into(), json!(username));
        field_map.insert(fields::PASSWORD.into(), json!(password));
        field_map.insert(fields::AUTH_TYPE.into(), json!(auth_type.as_str()));
        field_map.insert(fields::EXT.into(), Value::Object(ext.clone()));

        let reply = self
            .exchange(Operation::Login, field_map, None)
            .await
            .map_err(|failure| failure.into_client_error(Operation::Login))?;
        let info = AuthenticationInformation::from_reply(reply);
        if !info.is_ok() {
            return Err(ClientError::from_information(&info));
        }
        Ok(LoginAuthResult::from(&info))
    }

    async fn logout(
        &self,
        uid: &str,
        logout_type: LogoutType,
        user: Option<&UserPrincipal>,
    ) -> Result<LoginAuthResult, ClientError> {
        let mut field_map = self.base_fields(None, None);
        field_map.insert(fields::UID.into(), json!(uid));
        field_map.insert(fields::LOGOUT_TYPE.into(), json!(logout_type.as_str()));
        if let Some(user) = user {
            field_map.insert(fields::EXT.into(), json!({ "principal": user }));
            if let Some(token) = user.token.as_deref() {
                field_map.insert(fields::TOKEN.into(), json!(token));
            }
        }

        let reply = self
            .exchange(Operation::Logout, field_map, None)
            .await
            .map_err(|failure| failure.into_client_error(Operation::Logout))?;
        if reply.code != codes::OK {
            return Err(ClientError::from_information(&AuthenticationInformation::from_reply(
                reply,
            )));
        }
        let mut result = LoginAuthResult::ok();
        if let Some(message) = reply.message {
            result.message = message;
        }
        result.principal = user.cloned();
        Ok(result)
    }

    async fn get_online_status(&self, uid: &str) -> OnlineStatus {
        let mut field_map = self.base_fields(None, None);
        field_map.insert(fields::UID.into(), json!(uid));
        match self.exchange(Operation::OnlineStatus, field_map, None).await {
            Ok(reply) => reply_data(reply, "online status").unwrap_or_default(),
            Err(_) => OnlineStatus::default(),
        }
    }

    async fn get_online_users(&self, query: &OnlineUserQuery) -> OnlineUserResult {
        let mut field_map = self.base_fields(None, None);
        field_map.insert(fields::QUERY.into(), json!(query));
        let page = match self.exchange(Operation::OnlineUsers, field_map, None).await {
            Ok(reply) => reply_data(reply, "online users"),
            Err(_) => None,
        };
        page.unwrap_or_else(|| OnlineUserResult { page: query.page, size: query.size, ..OnlineUserResult::empty() })
    }

    async fn create_temporary_token(
        &self,
        source_token: &str,
        ext: &Map<String, Value>,
    ) -> LoginAuthResult {
        let mut field_map = self.base_fields(Some(&Credential::bearer(source_token)), None);
        field_map.insert(fields::EXT.into(), Value::Object(ext.clone()));
        match self.exchange(Operation::TemporaryToken, field_map, None).await {
            Ok(reply) => LoginAuthResult::from(&AuthenticationInformation::from_reply(reply)),
            Err(CallFailure::Unsupported) => LoginAuthResult::not_supported(),
            Err(failure) => {
                LoginAuthResult::from(&failure.into_information(Operation::TemporaryToken))
            }
        }
    }
}
