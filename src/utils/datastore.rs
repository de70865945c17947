use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which entry gets dropped when the store is over capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Evict the entry read least recently.
    LastGetTime,
    /// Evict the entry read least often.
    GetsCount,
}

struct Entry<V> {
    value: Option<V>,
    last_get: u64,
    gets: u64,
    /// A held key is reserved while its value is being computed; held
    /// entries are never evicted and `hold` on them fails, which is what
    /// prevents lookup stampedes.
    held: bool,
}

/// Bounded concurrent cache used for Content-Disposition headers and public
/// album renders.
pub struct DataStore<V> {
    map: DashMap<String, Entry<V>>,
    limit: usize,
    strategy: EvictionStrategy,
    clock: AtomicU64,
}

impl<V: Clone> DataStore<V> {
    pub fn new(limit: usize, strategy: EvictionStrategy) -> Self {
        Self {
            map: DashMap::new(),
            limit,
            strategy,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.tick();
        let mut entry = self.map.get_mut(key)?;
        entry.last_get = now;
        entry.gets += 1;
        entry.value.clone()
    }

    /// Reserve a key for computation. Returns false when the key already
    /// exists (value present or another worker holds it).
    pub fn hold(&self, key: &str) -> bool {
        let now = self.tick();
        let mut inserted = false;
        self.map.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            Entry {
                value: None,
                last_get: now,
                gets: 0,
                held: true,
            }
        });
        inserted
    }

    /// Drop a reservation without storing a value.
    pub fn release(&self, key: &str) {
        self.map
            .remove_if(key, |_, entry| entry.held && entry.value.is_none());
    }

    pub fn set(&self, key: &str, value: V) {
        let now = self.tick();
        self.map.insert(
            key.to_string(),
            Entry {
                value: Some(value),
                last_get: now,
                gets: 0,
                held: false,
            },
        );
        self.evict_over_limit(key);
    }

    pub fn delete(&self, key: &str) {
        self.map.remove(key);
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Held entries and the entry just written are never the victim.
    fn evict_over_limit(&self, incoming: &str) {
        while self.map.len() > self.limit {
            let victim = self
                .map
                .iter()
                .filter(|e| !e.value().held && e.key() != incoming)
                .min_by_key(|e| match self.strategy {
                    EvictionStrategy::LastGetTime => e.value().last_get,
                    EvictionStrategy::GetsCount => e.value().gets,
                })
                .map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    self.map.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// The service's bounded render caches: Content-Disposition headers for
/// file serving and public album renders.
pub struct Caches {
    pub disposition: DataStore<String>,
    pub album_render: DataStore<serde_json::Value>,
}

impl Caches {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            disposition: DataStore::new(1000, EvictionStrategy::LastGetTime),
            album_render: DataStore::new(500, EvictionStrategy::GetsCount),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set() {
        let store: DataStore<String> = DataStore::new(10, EvictionStrategy::LastGetTime);
        assert!(store.get("a").is_none());
        store.set("a", "value".to_string());
        assert_eq!(store.get("a").as_deref(), Some("value"));
    }

    #[test]
    fn hold_blocks_second_holder() {
        let store: DataStore<String> = DataStore::new(10, EvictionStrategy::LastGetTime);
        assert!(store.hold("k"));
        assert!(!store.hold("k"));
        store.release("k");
        assert!(store.hold("k"));
    }

    #[test]
    fn release_keeps_stored_values() {
        let store: DataStore<String> = DataStore::new(10, EvictionStrategy::LastGetTime);
        store.set("k", "v".to_string());
        store.release("k");
        assert_eq!(store.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn evicts_least_recently_read() {
        let store: DataStore<u32> = DataStore::new(2, EvictionStrategy::LastGetTime);
        store.set("a", 1);
        store.set("b", 2);
        store.get("a");
        store.set("c", 3);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn evicts_least_read_count() {
        let store: DataStore<u32> = DataStore::new(2, EvictionStrategy::GetsCount);
        store.set("a", 1);
        store.set("b", 2);
        store.get("a");
        store.get("a");
        store.get("b");
        store.set("c", 3);
        // "c" has zero reads but the incoming entry is exempt; "b" loses on
        // reads among the older entries.
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
    }
}
