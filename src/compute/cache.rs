//! Process-local requirements cache.
//!
//! Requirements objects are immutable once stored (their key is their content
//! hash), so entries never go stale. They are evicted only after sitting
//! unused for the configured TTL; every hit restarts that window.
//!
//! Conditions are parsed when an entry is inserted, not on each match.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::requirements::{CompiledRequirements, Requirements};
use crate::clock::Clock;

#[derive(Debug, Clone)]
struct CacheEntry {
    requirements: Arc<CompiledRequirements>,
    last_accessed: DateTime<Utc>,
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries_added: u64,
    pub entries_evicted: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if there were no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Requirements keyed by their hash, with a sliding expiry.
pub struct RequirementsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    stats: RwLock<CacheStats>,
}

impl RequirementsCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Returns the cached requirements for `hash`, refreshing its expiry.
    pub fn get(&self, hash: &str) -> Option<Arc<CompiledRequirements>> {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);

        let expired = match entries.get(hash) {
            Some(entry) => self.is_expired(entry, now),
            None => {
                stats.misses += 1;
                return None;
            }
        };

        if expired {
            entries.remove(hash);
            stats.entries_evicted += 1;
            stats.misses += 1;
            return None;
        }

        let entry = entries.get_mut(hash)?;
        entry.last_accessed = now;
        stats.hits += 1;
        Some(Arc::clone(&entry.requirements))
    }

    /// Compiles `requirements`, caches them under `hash` and returns the
    /// shared copy.
    pub fn insert(&self, hash: &str, requirements: Requirements) -> Arc<CompiledRequirements> {
        let now = self.clock.now();
        let requirements = Arc::new(CompiledRequirements::compile(requirements));

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let evicted = self.evict_expired(&mut entries, now);
        entries.insert(
            hash.to_string(),
            CacheEntry {
                requirements: Arc::clone(&requirements),
                last_accessed: now,
            },
        );

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.entries_added += 1;
        stats.entries_evicted += evicted;

        requirements
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        (now - entry.last_accessed)
            .to_std()
            .is_ok_and(|idle| idle >= self.ttl)
    }

    fn evict_expired(&self, entries: &mut HashMap<String, CacheEntry>, now: DateTime<Utc>) -> u64 {
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        (before - entries.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with_clock() -> (RequirementsCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            RequirementsCache::new(Duration::from_secs(600), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_hit_and_miss_are_counted() {
        let (cache, _) = cache_with_clock();

        assert!(cache.get("h").is_none());
        cache.insert("h", Requirements::default().exclusive(true));
        assert!(cache.get("h").unwrap().requirements.exclusive);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_condition_is_compiled_on_insert() {
        let (cache, _) = cache_with_clock();
        cache.insert("bad", Requirements::default().with_condition("os =="));
        cache.insert("good", Requirements::default().with_condition("os == linux"));

        assert!(cache.get("bad").unwrap().condition_error().is_some());
        assert!(cache.get("good").unwrap().condition_error().is_none());
    }

    #[test]
    fn test_expiry_slides_on_access() {
        let (cache, clock) = cache_with_clock();
        cache.insert("h", Requirements::default());

        clock.advance(Duration::from_secs(500));
        assert!(cache.get("h").is_some());

        // 1000s after insert, but only 500s after the last hit.
        clock.advance(Duration::from_secs(500));
        assert!(cache.get("h").is_some());

        clock.advance(Duration::from_secs(600));
        assert!(cache.get("h").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().entries_evicted, 1);
    }

    #[test]
    fn test_insert_evicts_idle_entries() {
        let (cache, clock) = cache_with_clock();
        cache.insert("old", Requirements::default());

        clock.advance(Duration::from_secs(601));
        cache.insert("new", Requirements::default());

        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }
}
