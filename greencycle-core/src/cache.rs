//! Time-bounded cache owned by the component that needs it.
//!
//! Each instance carries its own TTL and its own entries, so two clients
//! (or two tests) never observe each other's cached values.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh value for `key`, if any. Expired entries are dropped on read.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("status", 3);
        assert_eq!(cache.get(&"status"), Some(3));
        assert_eq!(cache.get(&"other"), None);
    }

    #[test]
    fn test_cache_zero_ttl_always_misses() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert(1, "x");
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_cache_expiry() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert(1, "x");
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_cache_instances_are_isolated() {
        let a = TtlCache::new(Duration::from_secs(60));
        let b: TtlCache<&str, i32> = TtlCache::new(Duration::from_secs(60));
        a.insert("k", 1);
        assert_eq!(b.get(&"k"), None);
        a.invalidate(&"k");
        assert_eq!(a.get(&"k"), None);
    }
}
