//! Inbound caller credentials.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// What the caller presented. Request-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Credential {
    Cookies(Vec<Cookie>),
    BearerToken(String),
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credential::BearerToken(token.into())
    }

    pub fn cookies<I>(cookies: I) -> Self
    where
        I: IntoIterator<Item = Cookie>,
    {
        Credential::Cookies(cookies.into_iter().collect())
    }

    /// The bearer token, if one was presented and is not blank.
    pub fn token(&self) -> Option<&str> {
        match self {
            Credential::BearerToken(token) if !token.trim().is_empty() => Some(token.as_str()),
            _ => None,
        }
    }

    /// Value of the named cookie, if present and not blank.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        match self {
            Credential::Cookies(cookies) => cookies
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.value.as_str())
                .filter(|v| !v.trim().is_empty()),
            Credential::BearerToken(_) => None,
        }
    }

    /// Cache key: the token, else the session cookie's value. `None` means nothing to verify
    /// and nothing to cache.
    pub fn fingerprint(&self, cookie_name: &str) -> Option<&str> {
        self.token().or_else(|| self.cookie(cookie_name))
    }
}
