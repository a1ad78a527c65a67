//! Bounded cache with TTL and max-size eviction.
//!
//! Holds terminal transaction records so a relayer running for weeks does not
//! grow memory without limit.
//!
//! ## Recommended RAM
//!
//! - A terminal TxState with one message is ~1 KB (message bytes included), so
//!   the default 100k entries ≈ 100 MB.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_TERMINAL_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_TERMINAL_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

/// Map of `K -> V` with max-size and TTL eviction.
///
/// - **Max capacity:** when full, the oldest insertion is evicted on insert.
/// - **TTL:** expired entries are hidden from reads and purged on insert.
pub struct BoundedCache<K, V> {
    map: HashMap<K, Entry<V>>,
    max_size: usize,
    ttl: Duration,
    counter: u64,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    order: u64,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
            counter: 0,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map
            .get(key)
            .filter(|e| e.inserted.elapsed() < self.ttl)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let ttl = self.ttl;
        self.map
            .get_mut(key)
            .filter(|e| e.inserted.elapsed() < ttl)
            .map(|e| &mut e.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert a value, returning every entry evicted to make room
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let now = Instant::now();
        let ttl = self.ttl;

        let expired: Vec<K> = self
            .map
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        let mut evicted: Vec<(K, V)> = expired
            .into_iter()
            .filter_map(|k| self.map.remove(&k).map(|e| (k, e.value)))
            .collect();

        if let Some(old) = self.map.remove(&key) {
            evicted.push((key.clone(), old.value));
        }

        while self.map.len() >= self.max_size {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| k.clone());
            match oldest.and_then(|k| self.map.remove(&k).map(|e| (k, e.value))) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        self.counter += 1;
        self.map.insert(
            key,
            Entry {
                value,
                inserted: now,
                order: self.counter,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
