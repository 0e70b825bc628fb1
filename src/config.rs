//! Client configuration.
//!
//! Every field has a default, so an empty source yields a runnable (if address-less) client.
//! [`AuthClientConfig::load`] layers defaults, an optional YAML file and `AUTHWIRE_*` environment
//! variables (`__` separates nested keys, e.g. `AUTHWIRE_KEYS__ACCESS_KEY`).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::codec::Cipher;
use crate::error::ConfigError;
use crate::selector::BalanceStrategy;

pub const ENV_PREFIX: &str = "AUTHWIRE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthClientConfig {
    /// Registered transport name, see [`crate::registry::TransportRegistry`].
    pub protocol: String,
    /// Comma-separated authority list; `${VAR:default}` placeholders are expanded.
    pub address: String,
    pub balance: String,
    /// Cookie whose value fingerprints a cookie credential.
    pub cookie_name: String,
    pub app_name: String,
    /// Marker sent with every request; upper-cased on the wire.
    pub sub_protocol: String,
    /// Advertised in the `x-oauth-encode` sidecar.
    pub encode: bool,
    pub keys: KeySettings,
    pub cache: CacheSettings,
    pub timeouts: TimeoutSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub paths: PathSettings,
}

impl Default for AuthClientConfig {
    fn default() -> Self {
        Self {
            protocol: "http".into(),
            address: String::new(),
            balance: "random".into(),
            cookie_name: "x-oauth-cookie".into(),
            app_name: String::new(),
            sub_protocol: "DEFAULT".into(),
            encode: true,
            keys: KeySettings::default(),
            cache: CacheSettings::default(),
            timeouts: TimeoutSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
            paths: PathSettings::default(),
        }
    }
}

impl AuthClientConfig {
    /// Defaults, then `file` (YAML) if given, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Cipher::from_name(&self.keys.cipher)?;
        BalanceStrategy::from_name(&self.balance)?;
        if self.cookie_name.trim().is_empty() {
            return Err(invalid("cookie_name", "must not be blank"));
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(invalid("circuit_breaker.failure_threshold", "must be > 0"));
            }
            if self.circuit_breaker.cooldown_ms == 0 {
                return Err(invalid("circuit_breaker.cooldown_ms", "must be > 0"));
            }
        }
        if self.retry.enabled {
            if self.retry.max_attempts == 0 {
                return Err(invalid("retry.max_attempts", "must be > 0"));
            }
            if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
                return Err(invalid("retry.multiplier", "must be >= 1.0"));
            }
            if self.retry.max_delay_ms < self.retry.delay_ms {
                return Err(invalid("retry.max_delay_ms", "must be >= retry.delay_ms"));
            }
        }
        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.connect_ms", t.connect_ms),
            ("timeouts.read_ms", t.read_ms),
            ("timeouts.response_ms", t.response_ms),
            ("timeouts.heartbeat_ms", t.heartbeat_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be > 0"));
            }
        }
        if self.cache.enabled && self.cache.ttl_ms == 0 {
            return Err(invalid("cache.ttl_ms", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}

/// Key material. `Debug` never prints secrets.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    pub access_key: String,
    pub secret_key: String,
    pub service_key: String,
    pub cipher: String,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            service_key: String::new(),
            cipher: Cipher::Aes256Gcm.name().into(),
        }
    }
}

impl fmt::Debug for KeySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySettings")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("service_key", &"<redacted>")
            .field("cipher", &self.cipher)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_ms: u64,
    /// Keep a longer-lived cold-backup tier behind the hot tier.
    pub backup: bool,
    pub backup_ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { enabled: true, ttl_ms: 60_000, backup: false, backup_ttl_ms: 600_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_ms: u64,
    pub read_ms: u64,
    /// Overall wait for duplex transports (WebSocket, reactive, UDP).
    pub response_ms: u64,
    pub heartbeat_ms: u64,
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { connect_ms: 3_000, read_ms: 5_000, response_ms: 10_000, heartbeat_ms: 30_000 }
    }
}

/// Breaker around each attempt against the authority.
///
/// Retries sit outside the breaker, so every failed attempt counts on its own: with
/// `max_attempts = 3` one dead call costs three failures. Size `failure_threshold` as
/// `max_attempts` times the number of failed calls to tolerate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    /// Consecutive failed attempts (not calls) that open the circuit.
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
    pub fallback_message: String,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_ms: 30_000,
            fallback_message: "authentication service temporarily unavailable".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    /// Attempts per call, the first included. Each one is seen by the circuit breaker.
    pub max_attempts: usize,
    pub delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { enabled: true, max_attempts: 3, delay_ms: 200, multiplier: 2.0, max_delay_ms: 2_000 }
    }
}

/// Authority paths for the HTTP-family transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub approve: String,
    pub login: String,
    pub logout: String,
    pub upgrade: String,
    pub app_key: String,
    pub online_status: String,
    pub online_users: String,
    pub temporary_token: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            approve: "/oauth".into(),
            login: "/doLogin".into(),
            logout: "/logout".into(),
            upgrade: "/upgrade".into(),
            app_key: "/oauth/app".into(),
            online_status: "/online/status".into(),
            online_users: "/online/users".into(),
            temporary_token: "/token/temporary".into(),
        }
    }
}
