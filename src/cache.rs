// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! TTL cache — small keyed cache with per-entry expiry
//!
//! Each cache in the collector (cluster membership, namespace discovery,
//! last-known-good nodes, direct connections) owns one of these. Every
//! instance carries its own lock so unrelated caches never contend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// A keyed cache where every entry expires `ttl` after insertion.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get a value if present and not expired
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some((written, value)) if written.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key, (Instant::now(), value));
    }

    /// Drop expired entries and return all live (key, value) pairs
    pub fn live_entries(&self) -> Vec<(K, V)> {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, (written, _)| written.elapsed() < self.ttl);
        entries.iter().map(|(k, (_, v))| (k.clone(), v.clone())).collect()
    }

    #[cfg(test)]
    fn insert_aged(&self, key: K, value: V, age: Duration) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key, (Instant::now() - age, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_within_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(300));
        cache.insert("pve1".to_string(), 7);
        assert_eq!(cache.get(&"pve1".to_string()), Some(7));
        assert_eq!(cache.get(&"pve2".to_string()), None);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        // 299s old entry is valid, 301s old entry is expired
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(300));
        cache.insert_aged("fresh".to_string(), 1, Duration::from_secs(299));
        cache.insert_aged("stale".to_string(), 2, Duration::from_secs(301));
        assert_eq!(cache.get(&"fresh".to_string()), Some(1));
        assert_eq!(cache.get(&"stale".to_string()), None);
    }

    #[test]
    fn test_insert_refreshes_expiry() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert_aged("node1".to_string(), 1, Duration::from_secs(59));
        cache.insert("node1".to_string(), 2);
        assert_eq!(cache.get(&"node1".to_string()), Some(2));
    }

    #[test]
    fn test_live_entries_drops_expired() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("live".to_string(), 1);
        cache.insert_aged("dead".to_string(), 2, Duration::from_secs(61));
        let live = cache.live_entries();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, "live");
        // the expired entry is gone for good
        assert_eq!(cache.get(&"dead".to_string()), None);
    }
}
