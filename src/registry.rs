//! Name-keyed transport registry.
//!
//! The client resolves `config.protocol` here once, at build time. Applications can register
//! their own bindings next to (or instead of) the built-in ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::error::ConfigError;
use crate::transport::http::HttpTransport;
use crate::transport::http2::http2_transport;
use crate::transport::lite::LiteTransport;
use crate::transport::oauth2::OAuth2Transport;
use crate::transport::rsocket::RSocketTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{Transport, TransportSettings};

/// Builds a transport from settings.
pub type TransportFactory =
    Arc<dyn Fn(&TransportSettings) -> Result<Arc<dyn Transport>, ConfigError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransportRegistry {
    inner: Arc<RwLock<HashMap<String, TransportFactory>>>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry").field("names", &self.names()).finish()
    }
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// All bindings compiled into this build.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("http", |s| Ok(Arc::new(HttpTransport::new(s)?) as Arc<dyn Transport>));
        registry.register("http2", |s| Ok(Arc::new(http2_transport(s)?) as Arc<dyn Transport>));
        registry.register("lite", |s| Ok(Arc::new(LiteTransport::new(s)?) as Arc<dyn Transport>));
        registry.register("oauth2", |s| Ok(Arc::new(OAuth2Transport::new(s)?) as Arc<dyn Transport>));
        registry.register("tcp", |s| Ok(Arc::new(TcpTransport::new(s)) as Arc<dyn Transport>));
        registry.register("udp", |s| Ok(Arc::new(UdpTransport::new(s)) as Arc<dyn Transport>));
        registry.register("rsocket", |s| Ok(Arc::new(RSocketTransport::new(s)) as Arc<dyn Transport>));
        #[cfg(feature = "websocket")]
        registry.register("websocket", |s| {
            Ok(Arc::new(crate::transport::websocket::WebSocketTransport::new(s)) as Arc<dyn Transport>)
        });
        #[cfg(feature = "grpc")]
        registry.register("grpc", |s| {
            Ok(Arc::new(crate::transport::grpc::GrpcTransport::new(s)) as Arc<dyn Transport>)
        });
        registry
    }

    /// Registers `factory` under `name` (case-insensitive). Last registration wins.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&TransportSettings) -> Result<Arc<dyn Transport>, ConfigError> + Send + Sync + 'static,
    {
        let key = name.trim().to_ascii_lowercase();
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.insert(key.clone(), Arc::new(factory)).is_some() {
            warn!(target: "authwire::registry", name = %key, "transport re-registered; last registration wins");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(&name.trim().to_ascii_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(
        &self,
        name: &str,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn Transport>, ConfigError> {
        let factory = self
            .read()
            .get(&name.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTransport(name.to_string()))?;
        factory(settings)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TransportFactory>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
