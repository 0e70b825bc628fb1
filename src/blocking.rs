//! Synchronous facade over [`AuthClient`].
//!
//! [`BlockingAuthClient`] owns a small multi-threaded runtime and blocks on each call. Do not use
//! it from inside an async context; call the [`Protocol`] methods on the inner client there.

use serde_json::{Map, Value};
use tokio::runtime::Runtime;

use crate::client::AuthClient;
use crate::config::AuthClientConfig;
use crate::context::CallerContext;
use crate::credential::Credential;
use crate::error::{ClientError, ConfigError};
use crate::model::{
    AppKeySecret, AuthType, AuthenticationInformation, LoginAuthResult, LoginResult, LogoutType,
    OnlineStatus, OnlineUserQuery, OnlineUserResult, UpgradeType, UserPrincipal,
};
use crate::protocol::Protocol;

const WORKER_THREADS: usize = 2;

#[derive(Debug)]
pub struct BlockingAuthClient {
    client: AuthClient,
    runtime: Runtime,
}

impl BlockingAuthClient {
    pub fn new(config: AuthClientConfig) -> Result<Self, ConfigError> {
        Self::from_client(AuthClient::new(config)?)
    }

    pub fn from_client(client: AuthClient) -> Result<Self, ConfigError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("authwire-blocking")
            .enable_all()
            .build()
            .map_err(|e| ConfigError::Invalid { field: "runtime", reason: e.to_string() })?;
        Ok(Self { client, runtime })
    }

    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    pub fn approve(&self, credential: &Credential, ctx: &CallerContext) -> AuthenticationInformation {
        self.runtime.block_on(self.client.approve(credential, ctx))
    }

    pub fn authenticate_app_key(
        &self,
        secret: &AppKeySecret,
        ctx: &CallerContext,
    ) -> AuthenticationInformation {
        self.runtime.block_on(self.client.authenticate_app_key(secret, ctx))
    }

    pub fn upgrade(
        &self,
        credential: &Credential,
        upgrade_type: UpgradeType,
        refresh_token: Option<&str>,
        ctx: &CallerContext,
    ) -> Result<LoginResult, ClientError> {
        self.runtime.block_on(self.client.upgrade(credential, upgrade_type, refresh_token, ctx))
    }

    pub fn get_access_token(
        &self,
        username: &str,
        password: &str,
        auth_type: AuthType,
        ext: &Map<String, Value>,
    ) -> Result<LoginAuthResult, ClientError> {
        self.runtime.block_on(self.client.get_access_token(username, password, auth_type, ext))
    }

    pub fn logout(
        &self,
        uid: &str,
        logout_type: LogoutType,
        user: Option<&UserPrincipal>,
    ) -> Result<LoginAuthResult, ClientError> {
        self.runtime.block_on(self.client.logout(uid, logout_type, user))
    }

    pub fn get_online_status(&self, uid: &str) -> OnlineStatus {
        self.runtime.block_on(self.client.get_online_status(uid))
    }

    pub fn get_online_users(&self, query: &OnlineUserQuery) -> OnlineUserResult {
        self.runtime.block_on(self.client.get_online_users(query))
    }

    pub fn create_temporary_token(&self, source_token: &str, ext: &Map<String, Value>) -> LoginAuthResult {
        self.runtime.block_on(self.client.create_temporary_token(source_token, ext))
    }

    pub fn close(&self) {
        self.runtime.block_on(self.client.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Information;

    #[test]
    fn blocking_calls_follow_the_async_contract() {
        let client = BlockingAuthClient::new(AuthClientConfig::default()).unwrap();
        let ctx = CallerContext::new();

        let info = client.approve(&Credential::bearer("  "), &ctx);
        assert_eq!(info.status(), Information::NoAuth);

        let info = client.approve(&Credential::bearer("abc"), &ctx);
        assert_eq!(info.status(), Information::ServerError);

        let err = client.logout("1", LogoutType::Logout, None).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(ConfigError::NoAuthority)));
        client.close();
    }
}
