#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # authwire
//!
//! Pluggable credential-verification client. Hand it a caller's cookie set or bearer token and it
//! asks a remote authority whether the credential is valid, returning one normalized
//! [`AuthenticationInformation`].
//!
//! ## Features
//!
//! - **Envelope crypto**: per-call ephemeral keys, AES-256-GCM or ChaCha20-Poly1305, HMAC-SHA256
//!   signatures, sealed replies bound to the request serial
//! - **Two-tier result cache** keyed by credential fingerprint, with eviction of non-`OK`
//!   entries on read
//! - **Endpoint selection**: random, round-robin or weighted over a placeholder-expanded list
//! - **Circuit breaker + retry** with a fail-closed fallback
//! - **Nine transports**: `http`, `http2`, `lite`, `oauth2`, `tcp`, `udp`, `rsocket`,
//!   `websocket`, `grpc`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authwire::{AuthClient, AuthClientConfig, CallerContext, Credential, Protocol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), authwire::ConfigError> {
//!     let config = AuthClientConfig {
//!         protocol: "http".into(),
//!         address: "${AUTH_HOST:127.0.0.1}:8080".into(),
//!         ..AuthClientConfig::default()
//!     };
//!     let client = AuthClient::new(config)?;
//!
//!     let ctx = CallerContext::new().with_remote_address("203.0.113.7");
//!     let info = client.approve(&Credential::bearer("abc"), &ctx).await;
//!     if info.is_ok() {
//!         println!("hello {:?}", ctx.username());
//!     }
//!     Ok(())
//! }
//! ```

pub mod blocking;
pub mod cache;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod selector;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use blocking::BlockingAuthClient;
pub use cache::ResultCache;
pub use client::{AuthClient, AuthClientBuilder};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::{Cipher, EnvelopeCodec};
pub use config::AuthClientConfig;
pub use context::CallerContext;
pub use credential::{Cookie, Credential};
pub use error::{ClientError, CodecError, ConfigError, ResilienceError, TransportError};
pub use model::{
    AppKeySecret, AuthType, AuthenticationInformation, Information, LoginAuthResult, LoginResult,
    LogoutType, OnlineStatus, OnlineUserQuery, OnlineUserResult, UpgradeType, UserPrincipal,
};
pub use protocol::Protocol;
pub use registry::TransportRegistry;
pub use selector::{BalanceStrategy, Endpoint, EndpointSelector};
pub use transport::{Operation, Transport};
