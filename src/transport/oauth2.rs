//! Standard OAuth2 authorization server binding.
//!
//! The authority is a plain RFC 6749 / 7662 / 7009 server, so nothing is sealed:
//!
//! | operation | endpoint                                                        |
//! |-----------|-----------------------------------------------------------------|
//! | approve   | `POST /oauth2/introspect`, then `GET /oauth2/userinfo` if needed |
//! | login     | `POST /oauth2/token` with `grant_type=password`                 |
//! | app-key   | `POST /oauth2/token` with `grant_type=client_credentials`       |
//! | upgrade   | refresh grant when given a refresh token, else introspection     |
//! | logout    | `POST /oauth2/revoke`                                           |
//!
//! The client authenticates with HTTP Basic using the configured access and secret keys.
//! Credential rejections (400/401/403 from the server) come back as a `403` reply; other
//! non-success statuses are transport failures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{client_error, with_timeout};
use super::{Operation, OutboundRequest, Received, Transport, TransportSettings};
use crate::codec::{fields, FieldMap};
use crate::error::{CodecError, ConfigError, TransportError};
use crate::model::{codes, AppKeySecret, Reply, UpgradeType, UserPrincipal};
use crate::selector::Endpoint;

pub const TOKEN_PATH: &str = "/oauth2/token";
pub const INTROSPECT_PATH: &str = "/oauth2/introspect";
pub const REVOKE_PATH: &str = "/oauth2/revoke";
pub const USERINFO_PATH: &str = "/oauth2/userinfo";

#[derive(Debug, Clone)]
pub struct OAuth2Transport {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    read_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Introspection {
    #[serde(default)]
    active: bool,
    sub: Option<String>,
    username: Option<String>,
    scope: Option<String>,
    tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    preferred_username: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthError {
    error: Option<String>,
    error_description: Option<String>,
}

impl OAuth2Transport {
    pub fn new(settings: &TransportSettings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeouts.connect())
            .timeout(settings.timeouts.read())
            .build()
            .map_err(|e| client_error("oauth2", e))?;
        Ok(Self {
            client,
            client_id: settings.keys.access_key.clone(),
            client_secret: settings.keys.secret_key.clone(),
            read_timeout: settings.timeouts.read(),
        })
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Outcome, TransportError> {
        let response = builder.send().await.map_err(|e| with_timeout(e, self.read_timeout))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| with_timeout(e, self.read_timeout))?;
        match status {
            s if s.is_success() => Ok(Outcome::Accepted(body.to_vec())),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let error: OAuthError = serde_json::from_slice(&body).unwrap_or_default();
                let message = error
                    .error_description
                    .or(error.error)
                    .unwrap_or_else(|| format!("rejected with {}", status));
                Ok(Outcome::Rejected(message))
            }
            other => Err(TransportError::Status(other.as_u16())),
        }
    }

    async fn introspect(&self, endpoint: &Endpoint, token: &str) -> Result<Reply, TransportError> {
        let request = self
            .client
            .post(endpoint.join(INTROSPECT_PATH))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")]);
        let body = match self.send(request).await? {
            Outcome::Accepted(body) => body,
            Outcome::Rejected(message) => return Ok(rejected(message)),
        };
        let introspection: Introspection = parse(&body)?;
        if !introspection.active {
            return Ok(rejected("token is not active"));
        }

        let mut principal = match (&introspection.sub, &introspection.username) {
            (Some(sub), Some(username)) => UserPrincipal::new(sub, username),
            (Some(sub), None) => match self.user_info(endpoint, token).await {
                Some(info) => {
                    let username = info.preferred_username.or(info.name).unwrap_or(info.sub);
                    UserPrincipal::new(sub, username)
                }
                None => UserPrincipal::new(sub, sub),
            },
            (None, Some(username)) => UserPrincipal::new(username, username),
            (None, None) => {
                return Err(CodecError::Malformed("introspection names no subject".into()).into())
            }
        };
        principal.roles = scopes(introspection.scope.as_deref());
        principal.tenant_id = introspection.tenant_id;
        Ok(Reply::ok(json!(principal)))
    }

    /// Best effort; the introspection result stands on its own.
    async fn user_info(&self, endpoint: &Endpoint, token: &str) -> Option<UserInfo> {
        let response = self.client.get(endpoint.join(USERINFO_PATH)).bearer_auth(token).send().await;
        match response {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(target: "authwire::oauth2", error = %err, "unreadable userinfo");
                    None
                }
            },
            Ok(response) => {
                tracing::debug!(target: "authwire::oauth2", status = %response.status(), "userinfo refused");
                None
            }
            Err(err) => {
                tracing::warn!(target: "authwire::oauth2", error = %err, "userinfo unavailable");
                None
            }
        }
    }

    async fn token(
        &self,
        endpoint: &Endpoint,
        client: (&str, &str),
        form: &[(&str, &str)],
        subject: &str,
    ) -> Result<Reply, TransportError> {
        let request = self
            .client
            .post(endpoint.join(TOKEN_PATH))
            .basic_auth(client.0, Some(client.1))
            .form(form);
        let body = match self.send(request).await? {
            Outcome::Accepted(body) => body,
            Outcome::Rejected(message) => return Ok(rejected(message)),
        };
        let grant: TokenGrant = parse(&body)?;
        let mut principal = UserPrincipal::new(subject, subject);
        principal.roles = scopes(grant.scope.as_deref());
        Ok(Reply::ok(json!({
            "principal": principal,
            "token": grant.access_token,
            "refreshToken": grant.refresh_token,
        })))
    }

    async fn revoke(&self, endpoint: &Endpoint, token: &str) -> Result<Reply, TransportError> {
        let request = self
            .client
            .post(endpoint.join(REVOKE_PATH))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")]);
        match self.send(request).await? {
            Outcome::Accepted(_) => {
                Ok(Reply { code: codes::OK.into(), message: None, data: None })
            }
            Outcome::Rejected(message) => Ok(rejected(message)),
        }
    }
}

enum Outcome {
    Accepted(Vec<u8>),
    Rejected(String),
}

#[async_trait]
impl Transport for OAuth2Transport {
    fn name(&self) -> &'static str {
        "oauth2"
    }

    fn supports(&self, operation: Operation) -> bool {
        operation.is_core() || operation == Operation::AppKey
    }

    fn seals_requests(&self) -> bool {
        false
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let f = &request.fields;
        tracing::debug!(target: "authwire::oauth2", operation = %request.operation, %endpoint, "sending");
        let reply = match request.operation {
            Operation::Approve => match text(f, fields::TOKEN).or_else(|| text(f, fields::COOKIE)) {
                Some(token) => self.introspect(endpoint, token).await?,
                None => Reply::with_code(codes::ACCESS_UNAUTHORIZED, "no token supplied"),
            },
            Operation::Login => {
                let username = text(f, fields::USERNAME).unwrap_or_default();
                let password = text(f, fields::PASSWORD).unwrap_or_default();
                let form =
                    [("grant_type", "password"), ("username", username), ("password", password)];
                let client = (self.client_id.as_str(), self.client_secret.as_str());
                self.token(endpoint, client, &form, username).await?
            }
            Operation::AppKey => {
                let secret: AppKeySecret = f
                    .get(fields::USER_CODE)
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| CodecError::Malformed(e.to_string()))?
                    .ok_or_else(|| CodecError::Malformed("missing app credentials".into()))?;
                let form = [("grant_type", "client_credentials")];
                let client = (secret.app_key.as_str(), secret.app_secret.as_str());
                self.token(endpoint, client, &form, &secret.app_key).await?
            }
            Operation::Upgrade => {
                let refresh = text(f, fields::UPGRADE_TYPE)
                    .and_then(UpgradeType::from_wire)
                    .filter(|t| *t == UpgradeType::Refresh)
                    .and_then(|_| text(f, fields::REFRESH_TOKEN));
                match (refresh, text(f, fields::TOKEN)) {
                    (Some(refresh_token), _) => {
                        let form =
                            [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
                        let client = (self.client_id.as_str(), self.client_secret.as_str());
                        let subject = text(f, fields::UID).unwrap_or(refresh_token);
                        self.token(endpoint, client, &form, subject).await?
                    }
                    (None, Some(token)) => self.introspect(endpoint, token).await?,
                    (None, None) => Reply::with_code(codes::ACCESS_UNAUTHORIZED, "no token supplied"),
                }
            }
            Operation::Logout => match text(f, fields::TOKEN).or_else(|| text(f, fields::UID)) {
                Some(token) => self.revoke(endpoint, token).await?,
                None => Reply::with_code(codes::ACCESS_UNAUTHORIZED, "no token supplied"),
            },
            other => Reply::with_code(
                codes::NOT_SUPPORTED,
                format!("{} is not supported by the oauth2 binding", other),
            ),
        };
        Ok(Received::Plain(reply))
    }
}

fn text<'a>(fields: &'a FieldMap, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn rejected(message: impl Into<String>) -> Reply {
    Reply::with_code(codes::RESOURCE_OAUTH_ERROR, message)
}

fn scopes(scope: Option<&str>) -> std::collections::BTreeSet<String> {
    scope.unwrap_or_default().split_whitespace().map(str::to_string).collect()
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body).map_err(|e| CodecError::Malformed(e.to_string()).into())
}
