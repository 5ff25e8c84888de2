//! Server-action cache collaborator (interface level).
//!
//! The store itself does no network caching; server integration consumes a
//! [`ServerCache`] passed in by the caller. The cache is an explicit object
//! with a constructor-supplied clock, never a module-level singleton, so
//! separate store instances (and tests) cannot cross-contaminate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

/// Key/value cache with per-entry TTL.
pub trait ServerCache: Send + Sync {
    /// Read a live (non-expired) entry.
    fn get(&self, key: &str) -> Option<Value>;

    /// Write an entry that expires after `ttl`.
    fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Drop an entry.
    fn remove(&self, key: &str);

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

/// Clock abstraction so TTL expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// In-memory [`ServerCache`] implementation.
pub struct TtlCache<C = SystemClock> {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: C,
}

impl TtlCache<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for TtlCache<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> TtlCache<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of entries, including not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<C: Clock> ServerCache for TtlCache<C> {
    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > self.clock.now())
            .map(|entry| entry.value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .lock()
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}
