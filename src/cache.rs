//! Two-tier verification result cache keyed by credential fingerprint.
//!
//! - `get` on an `OK` entry is a hit.
//! - `get` on any other entry deletes it from every tier and reports a miss, so a rejected or
//!   failed verification is never served twice.
//! - A hot miss falls back to the cold-backup tier (when enabled); a cold hit is promoted.
//! - `put` always stores and overwrites both tiers. Last writer wins.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::{Clock, MonotonicClock};
use crate::config::CacheSettings;
use crate::model::{AuthenticationInformation, Information};
use crate::telemetry::{CacheEvent, ClientEvent, EventEmitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Cold,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: AuthenticationInformation,
    pub tier: Tier,
    pub expires_at_millis: u64,
}

enum Lookup {
    Hit(AuthenticationInformation),
    Rejected(Information),
    Absent,
}

#[derive(Debug)]
pub struct ResultCache {
    enabled: bool,
    hot: DashMap<String, CacheEntry>,
    cold: Option<DashMap<String, CacheEntry>>,
    ttl_millis: u64,
    cold_ttl_millis: u64,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            enabled: true,
            hot: DashMap::new(),
            cold: None,
            ttl_millis: millis(ttl),
            cold_ttl_millis: 0,
            clock: Arc::new(MonotonicClock::default()),
            events: EventEmitter::none(),
        }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::new(Duration::ZERO) }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        if !settings.enabled {
            return Self::disabled();
        }
        let cache = Self::new(Duration::from_millis(settings.ttl_ms));
        if settings.backup {
            cache.with_backup(Duration::from_millis(settings.backup_ttl_ms))
        } else {
            cache
        }
    }

    pub fn with_backup(mut self, ttl: Duration) -> Self {
        self.cold = Some(DashMap::new());
        self.cold_ttl_millis = millis(ttl);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn get(&self, fingerprint: &str) -> Option<AuthenticationInformation> {
        if !self.enabled {
            return None;
        }
        let now = self.clock.now_millis();

        let mut outcome = lookup(&self.hot, fingerprint, now);
        if matches!(outcome, Lookup::Absent) {
            if let Some(cold) = &self.cold {
                outcome = lookup(cold, fingerprint, now);
                if let Lookup::Hit(value) = &outcome {
                    tracing::debug!(target: "authwire::cache", "promoting cold-backup entry");
                    self.hot.insert(
                        fingerprint.to_string(),
                        CacheEntry {
                            value: value.clone(),
                            tier: Tier::Hot,
                            expires_at_millis: now.saturating_add(self.ttl_millis),
                        },
                    );
                }
            }
        }

        match outcome {
            Lookup::Hit(value) => {
                self.events.emit(ClientEvent::Cache(CacheEvent::Hit)).await;
                Some(value)
            }
            Lookup::Rejected(status) => {
                self.remove_everywhere(fingerprint);
                tracing::debug!(target: "authwire::cache", ?status, "evicted non-OK entry on read");
                self.events.emit(ClientEvent::Cache(CacheEvent::Evicted { status })).await;
                self.events.emit(ClientEvent::Cache(CacheEvent::Miss)).await;
                None
            }
            Lookup::Absent => {
                self.events.emit(ClientEvent::Cache(CacheEvent::Miss)).await;
                None
            }
        }
    }

    pub fn put(&self, fingerprint: &str, value: AuthenticationInformation) {
        if !self.enabled {
            return;
        }
        let now = self.clock.now_millis();
        if let Some(cold) = &self.cold {
            cold.insert(
                fingerprint.to_string(),
                CacheEntry {
                    value: value.clone(),
                    tier: Tier::Cold,
                    expires_at_millis: now.saturating_add(self.cold_ttl_millis),
                },
            );
        }
        self.hot.insert(
            fingerprint.to_string(),
            CacheEntry {
                value,
                tier: Tier::Hot,
                expires_at_millis: now.saturating_add(self.ttl_millis),
            },
        );
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.remove_everywhere(fingerprint);
    }

    /// Entry as stored in the hot tier, without read side effects.
    pub fn peek(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.hot.get(fingerprint).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.hot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }

    /// Drops expired entries from both tiers.
    pub fn purge_expired(&self) {
        let now = self.clock.now_millis();
        self.hot.retain(|_, entry| entry.expires_at_millis > now);
        if let Some(cold) = &self.cold {
            cold.retain(|_, entry| entry.expires_at_millis > now);
        }
    }

    fn remove_everywhere(&self, fingerprint: &str) {
        self.hot.remove(fingerprint);
        if let Some(cold) = &self.cold {
            cold.remove(fingerprint);
        }
    }
}

fn lookup(map: &DashMap<String, CacheEntry>, fingerprint: &str, now: u64) -> Lookup {
    // The shard guard must be released before `remove_if` touches the same shard.
    let found =
        map.get(fingerprint).map(|entry| (entry.expires_at_millis <= now, entry.value.clone()));
    match found {
        None => Lookup::Absent,
        Some((true, _)) => {
            map.remove_if(fingerprint, |_, entry| entry.expires_at_millis <= now);
            Lookup::Absent
        }
        Some((false, value)) if value.is_ok() => Lookup::Hit(value),
        Some((false, value)) => Lookup::Rejected(value.status()),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::UserPrincipal;
    use crate::telemetry::MemorySink;

    fn ok() -> AuthenticationInformation {
        AuthenticationInformation::ok(UserPrincipal::new("1", "ada"))
    }

    #[tokio::test]
    async fn ok_entries_hit() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.put("abc", ok());
        assert_eq!(cache.get("abc").await, Some(ok()));
        assert_eq!(cache.get("abc").await, Some(ok()));
    }

    #[tokio::test]
    async fn non_ok_entries_are_evicted_by_the_read() {
        let sink = MemorySink::new();
        let cache = ResultCache::new(Duration::from_secs(60))
            .with_backup(Duration::from_secs(600))
            .with_events(EventEmitter::new(sink.clone()));
        cache.put("expired", AuthenticationInformation::failure());
        assert!(cache.peek("expired").is_some());

        assert_eq!(cache.get("expired").await, None);
        assert!(cache.peek("expired").is_none());
        assert_eq!(cache.get("expired").await, None);
        assert!(sink.events().contains(&ClientEvent::Cache(CacheEvent::Evicted {
            status: Information::AuthenticationFailure
        })));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(Duration::from_millis(100)).with_clock(clock.clone());
        cache.put("abc", ok());
        clock.advance(99);
        assert!(cache.get("abc").await.is_some());
        clock.advance(1);
        assert!(cache.get("abc").await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cold_tier_backs_up_and_promotes() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(Duration::from_millis(100))
            .with_backup(Duration::from_millis(1_000))
            .with_clock(clock.clone());
        cache.put("abc", ok());
        clock.advance(500);
        cache.purge_expired();
        assert!(cache.peek("abc").is_none());

        assert_eq!(cache.get("abc").await, Some(ok()));
        assert_eq!(cache.peek("abc").map(|e| e.tier), Some(Tier::Hot));
    }

    #[tokio::test]
    async fn put_overwrites_and_invalidate_removes() {
        let cache = ResultCache::new(Duration::from_secs(60)).with_backup(Duration::from_secs(60));
        cache.put("abc", AuthenticationInformation::server_error());
        cache.put("abc", ok());
        assert_eq!(cache.get("abc").await, Some(ok()));
        cache.invalidate("abc");
        assert_eq!(cache.get("abc").await, None);
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let cache = ResultCache::disabled();
        cache.put("abc", ok());
        assert_eq!(cache.get("abc").await, None);
        assert!(cache.is_empty());
    }
}
