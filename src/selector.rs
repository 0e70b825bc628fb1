//! Authority endpoint resolution and selection.
//!
//! The configured address is a comma-separated list. Each item may carry `${VAR}` or
//! `${VAR:default}` placeholders (resolved from the environment) and an optional `#weight`
//! suffix. A fresh selection is made on every call; the list can be swapped at runtime with
//! [`EndpointSelector::refresh`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use regex::Regex;
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_TCP_PORT: u16 = 8081;
pub const DEFAULT_UDP_PORT: u16 = 8082;
/// Weights below this are raised to it so every endpoint stays reachable.
pub const MIN_WEIGHT: f64 = 0.1;

const PLACEHOLDER: &str = r"\$\{([^}:]+)(?::([^}]*))?\}";

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    url: Url,
    http_port: Option<u16>,
    weight: f64,
}

impl Endpoint {
    /// Parses `host:port`, `scheme://host:port/path`, optionally followed by `#weight`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (address, weight) = match raw.rsplit_once('#') {
            Some((address, weight)) => {
                let weight = weight.trim().parse::<f64>().map_err(|_| ConfigError::Invalid {
                    field: "address",
                    reason: format!("bad weight in {:?}", raw),
                })?;
                (address.trim(), weight)
            }
            None => (raw.trim(), 1.0),
        };
        let explicit_scheme = address.contains("://");
        let candidate =
            if explicit_scheme { address.to_string() } else { format!("http://{}", address) };
        let url = Url::parse(&candidate).map_err(|e| ConfigError::Invalid {
            field: "address",
            reason: format!("{:?}: {}", address, e),
        })?;
        if url.host_str().is_none() {
            return Err(ConfigError::Invalid {
                field: "address",
                reason: format!("{:?} has no host", address),
            });
        }
        // A bare `host` has no HTTP port; `host:port` and `scheme://host` do.
        let has_port = address
            .rsplit_once(':')
            .is_some_and(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()));
        let http_port =
            if explicit_scheme || has_port { url.port_or_known_default() } else { None };
        Ok(Self { url, http_port, weight })
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("localhost")
    }

    /// Base URL without a trailing slash, e.g. `http://10.0.0.1:8080`.
    pub fn base_url(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_string()
    }

    /// `base_url` + `path`.
    pub fn join(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }

    /// Same authority with `ws`/`wss` in place of `http`/`https`.
    pub fn websocket_url(&self, path: &str) -> String {
        let joined = self.join(path);
        if let Some(rest) = joined.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = joined.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            joined
        }
    }

    /// The HTTP port: explicit, else the scheme default when a scheme was given.
    pub fn http_port(&self) -> Option<u16> {
        self.http_port
    }

    /// `host:port` with an explicit port or the scheme default.
    pub fn authority(&self) -> String {
        match self.http_port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => format!("{}:80", self.host()),
        }
    }

    pub fn tcp_port(&self) -> u16 {
        self.http_port().and_then(|p| p.checked_add(1)).unwrap_or(DEFAULT_TCP_PORT)
    }

    pub fn udp_port(&self) -> u16 {
        self.http_port().and_then(|p| p.checked_add(2)).unwrap_or(DEFAULT_UDP_PORT)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base_url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceStrategy {
    #[default]
    Random,
    RoundRobin,
    Weighted,
}

impl BalanceStrategy {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "random" => Ok(BalanceStrategy::Random),
            "round-robin" | "roundrobin" | "polling" => Ok(BalanceStrategy::RoundRobin),
            "weighted" | "weight" => Ok(BalanceStrategy::Weighted),
            _ => Err(ConfigError::UnknownBalance(name.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct EndpointSelector {
    endpoints: ArcSwap<Vec<Endpoint>>,
    strategy: BalanceStrategy,
    cursor: AtomicUsize,
    placeholder: Regex,
}

impl EndpointSelector {
    pub fn new(address: &str, strategy: BalanceStrategy) -> Result<Self, ConfigError> {
        let placeholder = Regex::new(PLACEHOLDER)
            .map_err(|e| ConfigError::Invalid { field: "address", reason: e.to_string() })?;
        let endpoints = resolve(&placeholder, address, |name| std::env::var(name).ok())?;
        Ok(Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            strategy,
            cursor: AtomicUsize::new(0),
            placeholder,
        })
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        self.endpoints.load_full()
    }

    /// Replaces the endpoint list. In-flight selections keep the list they loaded.
    pub fn refresh(&self, address: &str) -> Result<(), ConfigError> {
        let endpoints = resolve(&self.placeholder, address, |name| std::env::var(name).ok())?;
        tracing::info!(count = endpoints.len(), "authority list refreshed");
        self.endpoints.store(Arc::new(endpoints));
        Ok(())
    }

    /// `None` when no endpoint is configured.
    pub fn select(&self) -> Option<Endpoint> {
        let endpoints = self.endpoints.load();
        match endpoints.len() {
            0 => None,
            1 => endpoints.first().cloned(),
            len => {
                let index = match self.strategy {
                    BalanceStrategy::Random => rand::rng().random_range(0..len),
                    BalanceStrategy::RoundRobin => {
                        self.cursor.fetch_add(1, Ordering::Relaxed) % len
                    }
                    BalanceStrategy::Weighted => weighted_index(&endpoints),
                };
                endpoints.get(index).cloned()
            }
        }
    }
}

fn weighted_index(endpoints: &[Endpoint]) -> usize {
    let total: f64 = endpoints.iter().map(|e| e.weight.max(MIN_WEIGHT)).sum();
    let mut point = rand::rng().random::<f64>() * total;
    for (index, endpoint) in endpoints.iter().enumerate() {
        point -= endpoint.weight.max(MIN_WEIGHT);
        if point <= 0.0 {
            return index;
        }
    }
    endpoints.len().saturating_sub(1)
}

/// Expands `${VAR}` / `${VAR:default}`. Unset variables without a default expand to "".
pub fn expand_placeholders<F>(pattern: &Regex, raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            lookup(name)
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}

fn resolve<F>(pattern: &Regex, address: &str, lookup: F) -> Result<Vec<Endpoint>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    expand_placeholders(pattern, address, lookup)
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(Endpoint::parse)
        .collect()
}
