//! Bounded in-memory caches.
//!
//! Recency is tracked with a lazy order queue: every touch pushes a fresh
//! `(key, stamp)` pair and stale pairs are skipped during eviction. When the
//! queue grows well past the live entry count it is rebuilt from the map.

use ledgerlink_common::{EntityId, ExclusiveKey, MetadataPayload, ValueKey};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::Hash;

use crate::config::CacheConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct BoundedCache<K, V> {
    entries: FxHashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    capacity: usize,
    evict_batch: usize,
    next_stamp: u64,
    counters: CacheCounters,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `eviction_fraction` of `capacity` (at least one entry) is dropped each
    /// time an insert overflows.
    pub fn new(capacity: usize, eviction_fraction: f64) -> Self {
        let capacity = capacity.max(1);
        let evict_batch = ((capacity as f64) * eviction_fraction).ceil().max(1.0) as usize;
        Self {
            entries: FxHashMap::default(),
            order: VecDeque::new(),
            capacity,
            evict_batch: evict_batch.min(capacity),
            next_stamp: 0,
            counters: CacheCounters::default(),
        }
    }

    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let stamp = self.stamp();
        match self.entries.get_mut(key) {
            Some((value, s)) => {
                *s = stamp;
                let value = value.clone();
                self.order.push_back((key.clone(), stamp));
                self.counters.hits += 1;
                self.maybe_compact();
                Some(value)
            }
            None => {
                self.counters.misses += 1;
                None
            }
        }
    }

    /// Presence check that neither refreshes recency nor counts as a hit.
    pub fn has(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: K, value: V) {
        let stamp = self.stamp();
        let fresh = self.entries.insert(key.clone(), (value, stamp)).is_none();
        self.order.push_back((key, stamp));
        if fresh && self.entries.len() > self.capacity {
            self.evict(self.evict_batch);
        }
        self.maybe_compact();
    }

    pub fn delete(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(v, _)| v)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, (v, _)| keep(k, v));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters
    }

    fn evict(&mut self, mut count: usize) {
        while count > 0 {
            let Some((key, stamp)) = self.order.pop_front() else {
                break;
            };
            let live = matches!(self.entries.get(&key), Some((_, s)) if *s == stamp);
            if live {
                self.entries.remove(&key);
                self.counters.evictions += 1;
                count -= 1;
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.order.len() <= self.entries.len() * 2 + 64 {
            return;
        }
        let mut live: Vec<(K, u64)> = self
            .entries
            .iter()
            .map(|(k, (_, s))| (k.clone(), *s))
            .collect();
        live.sort_unstable_by_key(|(_, s)| *s);
        self.order = live.into();
    }
}

/// One bounded cache per result domain.
pub struct CacheDomains {
    pub values: BoundedCache<ValueKey, f64>,
    pub labels: BoundedCache<EntityId, MetadataPayload>,
    pub classifications: BoundedCache<EntityId, MetadataPayload>,
    pub exclusive: BoundedCache<ExclusiveKey, f64>,
}

impl CacheDomains {
    pub fn new(cfg: &CacheConfig) -> Self {
        let f = cfg.eviction_fraction;
        Self {
            values: BoundedCache::new(cfg.value_capacity, f),
            labels: BoundedCache::new(cfg.label_capacity, f),
            classifications: BoundedCache::new(cfg.classification_capacity, f),
            exclusive: BoundedCache::new(cfg.exclusive_capacity, f),
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.labels.clear();
        self.classifications.clear();
        self.exclusive.clear();
    }
}
