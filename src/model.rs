//! Result model shared by every transport.
//!
//! Adapters never hand raw authority replies to callers. Each reply is reduced to the generic
//! `{code, message, data}` shape ([`Reply`]) and then mapped onto [`AuthenticationInformation`]
//! through [`AuthenticationInformation::from_reply`], so the status table lives in exactly one place.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Return codes understood on the wire.
pub mod codes {
    /// The authority accepted the call.
    pub const OK: &str = "200";
    /// The caller is not authorized to use the resource.
    pub const ACCESS_UNAUTHORIZED: &str = "401";
    /// The credential was rejected (invalid, expired, revoked).
    pub const RESOURCE_OAUTH_ERROR: &str = "403";
    /// The authority or binding does not implement the operation.
    pub const NOT_SUPPORTED: &str = "501";
}

/// Closed set of authentication outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Information {
    Ok,
    NoAuth,
    AuthenticationFailure,
    AuthenticationServerException,
    Other,
    ServerError,
    ServerNotFound,
}

impl Information {
    /// Numeric code reported to callers, HTTP-flavoured.
    pub const fn code(self) -> u16 {
        match self {
            Information::Ok => 200,
            Information::Other => 400,
            Information::NoAuth => 401,
            Information::AuthenticationFailure => 403,
            Information::ServerNotFound => 404,
            Information::AuthenticationServerException => 500,
            Information::ServerError => 502,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Information::Ok => "authenticated",
            Information::NoAuth => "no credential supplied",
            Information::AuthenticationFailure => "authentication failed",
            Information::AuthenticationServerException => "authority returned no payload",
            Information::Other => "unexpected authority response",
            Information::ServerError => "authority unavailable",
            Information::ServerNotFound => "authority not found",
        }
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Information::Ok)
    }

    /// Statuses produced by connect/read failures rather than by the authority's verdict.
    pub const fn is_transport_failure(self) -> bool {
        matches!(self, Information::ServerError | Information::ServerNotFound)
    }
}

impl fmt::Display for Information {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// The authenticated user as reported by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrincipal {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default, alias = "permission")]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub ext: BTreeMap<String, Value>,
    /// Session token this principal was issued, when the caller kept it. Logout revokes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl UserPrincipal {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            tenant_id: None,
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            ext: BTreeMap::new(),
            token: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Payload of an `OK` reply: either a bare principal or a login grant carrying tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Grant {
    Login {
        #[serde(alias = "userResume")]
        principal: UserPrincipal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, rename = "refreshToken", skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
    Principal(UserPrincipal),
}

/// Generic reply shape every transport decodes into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub code: String,
    #[serde(default, alias = "msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self { code: codes::OK.to_string(), message: None, data: Some(data) }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: Some(message.into()), data: None }
    }
}

/// Normalized outcome of a verification call.
///
/// Fields are private so that `status == Ok` always comes with a principal.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationInformation {
    status: Information,
    principal: Option<UserPrincipal>,
    token: Option<String>,
    refresh_token: Option<String>,
    message: Option<String>,
}

impl AuthenticationInformation {
    pub fn ok(principal: UserPrincipal) -> Self {
        Self::granted(principal, None, None)
    }

    pub fn granted(
        principal: UserPrincipal,
        token: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            status: Information::Ok,
            principal: Some(principal),
            token,
            refresh_token,
            message: None,
        }
    }

    /// A principal-less result. `Information::Ok` cannot be expressed without a principal and
    /// degrades to `AuthenticationServerException`.
    pub fn from_status(status: Information) -> Self {
        let status = if status.is_ok() { Information::AuthenticationServerException } else { status };
        Self { status, principal: None, token: None, refresh_token: None, message: None }
    }

    pub fn no_auth() -> Self {
        Self::from_status(Information::NoAuth)
    }

    pub fn failure() -> Self {
        Self::from_status(Information::AuthenticationFailure)
    }

    pub fn server_error() -> Self {
        Self::from_status(Information::ServerError)
    }

    pub fn server_not_found() -> Self {
        Self::from_status(Information::ServerNotFound)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Maps a decoded reply onto the status table.
    pub fn from_reply(reply: Reply) -> Self {
        let message = reply.message;
        let info = match reply.code.as_str() {
            codes::OK => match reply.data {
                None | Some(Value::Null) => Self::from_status(Information::AuthenticationServerException),
                Some(data) => match serde_json::from_value::<Grant>(data) {
                    Ok(Grant::Login { principal, token, refresh_token }) => {
                        Self::granted(principal, token, refresh_token)
                    }
                    Ok(Grant::Principal(principal)) => Self::ok(principal),
                    Err(err) => {
                        tracing::warn!(error = %err, "OK reply carried an unreadable principal");
                        Self::from_status(Information::AuthenticationServerException)
                    }
                },
            },
            codes::RESOURCE_OAUTH_ERROR | codes::ACCESS_UNAUTHORIZED => Self::failure(),
            _ => Self::from_status(Information::Other),
        };
        match message {
            Some(message) if !info.status.is_ok() => info.with_message(message),
            _ => info,
        }
    }

    pub fn status(&self) -> Information {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn principal(&self) -> Option<&UserPrincipal> {
        self.principal.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Explicit message, or the status' default text.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.status.message())
    }
}

/// Tokens issued by a successful upgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginResult {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub principal: UserPrincipal,
}

/// Outcome of login, logout and temporary-token calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAuthResult {
    pub code: u16,
    pub message: String,
    #[serde(default, rename = "userResume")]
    pub principal: Option<UserPrincipal>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl LoginAuthResult {
    pub fn ok() -> Self {
        Self::with_code(Information::Ok.code(), Information::Ok.message())
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), principal: None, token: None, refresh_token: None }
    }

    pub fn not_supported() -> Self {
        Self::with_code(501, "temporary tokens are not supported by this transport")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Information::Ok.code()
    }
}

impl From<&AuthenticationInformation> for LoginAuthResult {
    fn from(info: &AuthenticationInformation) -> Self {
        Self {
            code: info.status().code(),
            message: info.message().to_string(),
            principal: info.principal().cloned(),
            token: info.token().map(str::to_string),
            refresh_token: info.refresh_token().map(str::to_string),
        }
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn from_wire(value: &str) -> Option<Self> {
                match value {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Position in declaration order; used by compact binary framings.
            pub fn ordinal(self) -> u8 {
                [$($name::$variant),+].iter().position(|v| *v == self).unwrap_or(0) as u8
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// How a token is upgraded.
    UpgradeType { Version => "VERSION", Refresh => "REFRESH", Timestamp => "TIMESTAMP" }
);

wire_enum!(
    /// Which login surface issued the credentials.
    AuthType { Web => "WEB", Embed => "EMBED" }
);

wire_enum!(
    /// Scope of a logout.
    LogoutType { None => "NONE", Logout => "LOGOUT", LogoutAll => "LOGOUT_ALL", UnRegister => "UN_REGISTER" }
);

/// Application credentials exchanged for an app-level principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppKeySecret {
    pub app_key: String,
    pub app_secret: String,
}

/// Online-session limits for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatus {
    pub online_count: i32,
    pub max_online_count: i32,
    pub online_mode: String,
}

impl OnlineStatus {
    pub const UNLIMITED: i32 = -1;

    pub fn is_reached_limit(&self) -> bool {
        self.max_online_count > 0 && self.online_count >= self.max_online_count
    }

    /// Remaining slots, or [`OnlineStatus::UNLIMITED`].
    pub fn remaining_slots(&self) -> i32 {
        if self.max_online_count <= 0 {
            return Self::UNLIMITED;
        }
        (self.max_online_count - self.online_count).max(0)
    }

    pub fn is_single(&self) -> bool {
        self.online_mode.eq_ignore_ascii_case("SINGLE")
    }

    pub fn is_multiple(&self) -> bool {
        self.online_mode.eq_ignore_ascii_case("MULTIPLE")
    }

    pub fn is_limit(&self) -> bool {
        self.online_mode.eq_ignore_ascii_case("LIMIT")
    }
}

impl Default for OnlineStatus {
    fn default() -> Self {
        Self { online_count: 0, max_online_count: Self::UNLIMITED, online_mode: "MULTIPLE".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUserQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub page: u32,
    pub size: u32,
}

impl Default for OnlineUserQuery {
    fn default() -> Self {
        Self { username: None, ip: None, page: 1, size: 20 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnlineUserInfo {
    pub user_id: String,
    pub username: String,
    pub nickname: Option<String>,
    pub login_ip: Option<String>,
    pub login_address: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub login_time: Option<i64>,
    pub token: Option<String>,
    pub login_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUserResult {
    #[serde(default)]
    pub users: Vec<OnlineUserInfo>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

impl OnlineUserResult {
    pub fn empty() -> Self {
        Self { users: Vec::new(), total: 0, page: 1, size: 20 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_reply_with_principal_maps_to_ok() {
        let reply = Reply::ok(json!({"userId": "7", "username": "ada", "tenantId": "t1"}));
        let info = AuthenticationInformation::from_reply(reply);
        assert_eq!(info.status(), Information::Ok);
        let principal = info.principal().unwrap();
        assert_eq!(principal.username, "ada");
        assert_eq!(principal.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn ok_reply_with_login_grant_keeps_tokens() {
        let reply = Reply::ok(json!({
            "principal": {"userId": "7", "username": "ada"},
            "token": "t-1",
            "refreshToken": "r-1"
        }));
        let info = AuthenticationInformation::from_reply(reply);
        assert!(info.is_ok());
        assert_eq!(info.token(), Some("t-1"));
        assert_eq!(info.refresh_token(), Some("r-1"));
    }

    #[test]
    fn ok_reply_without_data_is_server_exception() {
        let reply = Reply { code: codes::OK.into(), message: None, data: None };
        let info = AuthenticationInformation::from_reply(reply);
        assert_eq!(info.status(), Information::AuthenticationServerException);
        assert!(info.principal().is_none());
    }

    #[test]
    fn oauth_error_codes_map_to_failure() {
        for code in [codes::RESOURCE_OAUTH_ERROR, codes::ACCESS_UNAUTHORIZED] {
            let info = AuthenticationInformation::from_reply(Reply::with_code(code, "expired"));
            assert_eq!(info.status(), Information::AuthenticationFailure);
            assert_eq!(info.message(), "expired");
        }
    }

    #[test]
    fn unknown_code_maps_to_other() {
        let info = AuthenticationInformation::from_reply(Reply::with_code("418", "teapot"));
        assert_eq!(info.status(), Information::Other);
    }

    #[test]
    fn ok_status_cannot_exist_without_principal() {
        let info = AuthenticationInformation::from_status(Information::Ok);
        assert_eq!(info.status(), Information::AuthenticationServerException);
    }

    #[test]
    fn online_status_limits() {
        let unlimited = OnlineStatus::default();
        assert!(!unlimited.is_reached_limit());
        assert_eq!(unlimited.remaining_slots(), OnlineStatus::UNLIMITED);
        assert!(unlimited.is_multiple());

        let capped =
            OnlineStatus { online_count: 3, max_online_count: 3, online_mode: "limit".into() };
        assert!(capped.is_reached_limit());
        assert_eq!(capped.remaining_slots(), 0);
        assert!(capped.is_limit());
    }

    #[test]
    fn wire_enums_keep_declaration_order() {
        assert_eq!(UpgradeType::Version.ordinal(), 0);
        assert_eq!(LogoutType::UnRegister.ordinal(), 3);
        assert_eq!(AuthType::Embed.as_str(), "EMBED");
    }
}
