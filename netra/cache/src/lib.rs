#![deny(warnings, rust_2018_idioms)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// A concurrent map whose entries expire a fixed TTL after insertion.
///
/// Reads return only unexpired values; a background sweeper deletes dead
/// entries so the map does not grow with traffic. Writes overwrite both the
/// value and the deadline, so a reader always observes the latest write.
#[derive(Clone, Debug)]
pub struct ExpiringCache<V> {
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
    ttl: Duration,
}

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    deadline: Instant,
}

// === impl ExpiringCache ===

impl<V: Clone + Send + Sync + 'static> ExpiringCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Creates a cache and spawns its sweeper onto the current runtime.
    pub fn spawn(ttl: Duration, cleanup_interval: Duration) -> Self {
        let cache = Self::new(ttl);
        tokio::spawn(cache.clone().sweep_forever(cleanup_interval));
        cache
    }

    pub fn insert(&self, key: String, value: V) {
        let deadline = Instant::now() + self.ttl;
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, Entry { value, deadline });
    }

    /// Returns the value for `key` if it has not yet expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(key)?;
        if entry.deadline <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes all entries whose deadline has passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.deadline > now);
        let swept = before - entries.len();
        if swept > 0 {
            trace!(swept, remaining = entries.len(), "Swept expired entries");
        }
    }

    async fn sweep_forever(self, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a sweep never races
        // the insert that prompted cache construction.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.sweep();
        }
    }
}
