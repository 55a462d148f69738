//! Local value store with age-based expiry and a cap on the number of keys.

use super::routing::DhtId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct ValueStore {
    entries: HashMap<DhtId, StoredValue>,
    ttl: Duration,
    max_keys: usize,
}

impl ValueStore {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_keys: max_keys.max(1),
        }
    }

    /// Store or overwrite; every write restarts the key's age. A new key arriving
    /// at a full store first culls expired keys, then evicts the oldest one.
    /// Returns the evicted key, if any.
    pub fn put(&mut self, key: DhtId, value: String) -> Option<DhtId> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_keys {
            self.cull();
            if self.entries.len() >= self.max_keys {
                evicted = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(oldest, _)| *oldest);
                if let Some(oldest) = &evicted {
                    self.entries.remove(oldest);
                }
            }
        }
        self.entries.insert(
            key,
            StoredValue {
                value,
                stored_at: Instant::now(),
            },
        );
        evicted
    }

    pub fn get(&mut self, key: &DhtId) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Drop every aged-out key and return how many were removed.
    pub fn cull(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
