//! Request-scoped caller context.
//!
//! The embedding application creates one [`CallerContext`] per inbound request. The client fills
//! it on a successful verification and wipes it (and marks the session cookie for removal) when
//! the authority rejects the credential.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::UserPrincipal;

#[derive(Debug, Default)]
struct ContextState {
    user_id: Option<String>,
    username: Option<String>,
    tenant_id: Option<String>,
    principal: Option<UserPrincipal>,
    removed_cookies: Vec<String>,
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    remote_address: Option<String>,
    user_agent: Option<String>,
    fingerprint: Option<String>,
    timezone: Option<String>,
    state: Arc<Mutex<ContextState>>,
}

impl CallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Browser/device fingerprint supplied by the front end (not the credential fingerprint).
    pub fn with_device_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn device_fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        // A poisoned context only ever holds plain data; keep using it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn apply(&self, principal: &UserPrincipal) {
        let mut state = self.state();
        state.user_id = Some(principal.user_id.clone());
        state.username = Some(principal.username.clone());
        state.tenant_id = principal.tenant_id.clone();
        state.principal = Some(principal.clone());
    }

    pub(crate) fn clear_user(&self) {
        let mut state = self.state();
        state.user_id = None;
        state.username = None;
        state.tenant_id = None;
        state.principal = None;
    }

    pub(crate) fn remove_cookie(&self, name: &str) {
        let mut state = self.state();
        if !state.removed_cookies.iter().any(|c| c == name) {
            state.removed_cookies.push(name.to_string());
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.state().user_id.clone()
    }

    pub fn username(&self) -> Option<String> {
        self.state().username.clone()
    }

    pub fn tenant_id(&self) -> Option<String> {
        self.state().tenant_id.clone()
    }

    pub fn principal(&self) -> Option<UserPrincipal> {
        self.state().principal.clone()
    }

    /// Cookies the application should expire on the response.
    pub fn removed_cookies(&self) -> Vec<String> {
        self.state().removed_cookies.clone()
    }
}
