//! Read-through cache for stat counters.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: i64,
    refreshed_at: Instant,
}

pub struct StatCache {
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl StatCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Cached value for `key` if it is younger than the TTL.
    pub fn get(&self, key: &str) -> Option<i64> {
        let entry = *self.entries.get(key)?;
        if entry.refreshed_at.elapsed() < self.ttl {
            Some(entry.value)
        } else {
            self.entries.remove(key);
            None
        }
    }

    pub fn put(&self, key: &str, value: i64) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                refreshed_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire() {
        let cache = StatCache::new(Duration::ZERO);
        cache.put("ModsInstalled", 3);
        assert_eq!(cache.get("ModsInstalled"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = StatCache::new(Duration::from_secs(60));
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get("a"), Some(1));

        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
