//! The operation set every verification client exposes.
//!
//! [`AuthClient`](crate::AuthClient) implements it once on top of any
//! [`Transport`](crate::transport::Transport); callers that only need to verify credentials can depend on
//! `dyn Protocol` and swap in test doubles.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::CallerContext;
use crate::credential::Credential;
use crate::error::ClientError;
use crate::model::{
    AppKeySecret, AuthType, AuthenticationInformation, LoginAuthResult, LoginResult, LogoutType,
    OnlineStatus, OnlineUserQuery, OnlineUserResult, UpgradeType, UserPrincipal,
};

#[async_trait]
pub trait Protocol: Send + Sync {
    /// Verifies `credential`. Never fails: every failure is a status.
    ///
    /// An `OK` result (fresh or cached) populates `ctx`. An authentication failure, or an `OK`
    /// reply that carried no principal, clears it and marks the session cookie for removal.
    async fn approve(&self, credential: &Credential, ctx: &CallerContext)
        -> AuthenticationInformation;

    /// Exchanges application credentials for an app-level principal.
    async fn authenticate_app_key(
        &self,
        secret: &AppKeySecret,
        ctx: &CallerContext,
    ) -> AuthenticationInformation;

    /// Re-issues tokens for `credential`. `VERSION` upgrades drop the cached result and the
    /// request-scoped user.
    async fn upgrade(
        &self,
        credential: &Credential,
        upgrade_type: UpgradeType,
        refresh_token: Option<&str>,
        ctx: &CallerContext,
    ) -> Result<LoginResult, ClientError>;

    async fn get_access_token(
        &self,
        username: &str,
        password: &str,
        auth_type: AuthType,
        ext: &Map<String, Value>,
    ) -> Result<LoginAuthResult, ClientError>;

    async fn logout(
        &self,
        uid: &str,
        logout_type: LogoutType,
        user: Option<&UserPrincipal>,
    ) -> Result<LoginAuthResult, ClientError>;

    /// Falls back to an unlimited `MULTIPLE` status when the binding cannot ask.
    async fn get_online_status(&self, uid: &str) -> OnlineStatus;

    /// Falls back to an empty page when the binding cannot ask.
    async fn get_online_users(&self, query: &OnlineUserQuery) -> OnlineUserResult;

    /// Falls back to a `501` result when the binding cannot ask.
    async fn create_temporary_token(
        &self,
        source_token: &str,
        ext: &Map<String, Value>,
    ) -> LoginAuthResult;
}
