#![deny(warnings, rust_2018_idioms)]

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// The set of destination addresses currently being proxied.
///
/// Mutated around each flow and observed by a periodic dump task, so the
/// lock favors many readers and brief writes.
#[derive(Clone, Debug, Default)]
pub struct EstablishedSet(Arc<RwLock<HashSet<String>>>);

// === impl EstablishedSet ===

impl EstablishedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, addr: &str) {
        self.0
            .write()
            .expect("established set poisoned")
            .insert(addr.to_string());
    }

    pub fn remove(&self, addr: &str) {
        self.0.write().expect("established set poisoned").remove(addr);
    }

    pub fn len(&self) -> usize {
        self.0.read().expect("established set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .0
            .read()
            .expect("established set poisoned")
            .iter()
            .cloned()
            .collect();
        addrs.sort();
        addrs
    }

    /// Spawns a task that logs the current set every `interval`.
    pub fn spawn_dump(&self, interval: Duration) {
        let set = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let addrs = set.snapshot();
                info!(connections = addrs.len(), ?addrs, "Established");
            }
        });
    }
}
