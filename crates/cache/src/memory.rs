//! In-memory resource cache with LRU eviction
//!
//! Maps keys to reference-counted decoded resources. Entries that are
//! currently acquired by a consumer are "active": they stay in the map so a
//! second request finds the same instance, but they do not count against the
//! byte budget and are never evicted. Releasing the last reference re-admits
//! the entry to the evictable set at its current recency.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::sizing::MemoryPressure;

/// Called with every entry the cache evicts, after the cache lock is released.
pub type EvictionListener<K, V> = Box<dyn Fn(K, Arc<V>) + Send + Sync>;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCacheStats {
    /// Entries in the map, active or not
    pub entry_count: usize,
    /// Entries with at least one outstanding reference
    pub active_count: usize,
    /// Bytes of evictable entries (the budgeted portion)
    pub memory_used: usize,
    /// Bytes of active entries
    pub active_memory: usize,
    /// Current budget for evictable entries
    pub memory_limit: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl MemoryCacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: Arc<V>,
    size: usize,
    active: usize,
    tick: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Evictable entries by recency tick, least recently used first
    lru: BTreeMap<u64, K>,
    tick: u64,
    initial_limit: usize,
    memory_limit: usize,
    memory_used: usize,
    active_memory: usize,
    stats: MemoryCacheStats,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Mark as most recently used.
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.active == 0 {
                self.lru.remove(&entry.tick);
                self.lru.insert(tick, key.clone());
            }
            entry.tick = tick;
        }
    }

    fn detach(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        if entry.active == 0 {
            self.lru.remove(&entry.tick);
            self.memory_used -= entry.size;
        } else {
            self.active_memory -= entry.size;
        }
        Some(entry)
    }

    /// Evict least recently used inactive entries until the budgeted bytes
    /// fit `target`. `keep` is spared when it is the only evictable entry.
    fn evict_to(&mut self, target: usize, keep: Option<&K>, evicted: &mut Vec<(K, Arc<V>)>) {
        while self.memory_used > target {
            let Some((&tick, key)) = self.lru.iter().next() else {
                break;
            };
            if self.lru.len() == 1 && keep == Some(key) {
                break;
            }
            let key = key.clone();
            self.lru.remove(&tick);
            if let Some(entry) = self.entries.remove(&key) {
                self.memory_used -= entry.size;
                self.stats.evictions += 1;
                evicted.push((key, entry.value));
            }
        }
    }

    fn refresh_stats(&mut self) {
        self.stats.entry_count = self.entries.len();
        self.stats.active_count = self.entries.len() - self.lru.len();
        self.stats.memory_used = self.memory_used;
        self.stats.active_memory = self.active_memory;
        self.stats.memory_limit = self.memory_limit;
    }
}

/// LRU cache of reference-counted resources with active-use tracking.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use imgload_cache::MemoryCache;
///
/// let cache: MemoryCache<&str, Vec<u8>> = MemoryCache::new(1024);
/// cache.put("a", Arc::new(vec![0; 100]), 100);
///
/// let hit = cache.acquire(&"a").expect("cached");
/// // Active entries are exempt from eviction...
/// cache.put("b", Arc::new(vec![0; 1000]), 1000);
/// assert!(cache.contains(&"a"));
/// // ...until their last reference is released.
/// assert!(cache.release(&"a", hit).is_ok());
/// ```
pub struct MemoryCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    on_evict: Option<EvictionListener<K, V>>,
}

impl<K: Eq + Hash + Clone, V> MemoryCache<K, V> {
    /// Create a cache whose evictable entries may total `memory_limit` bytes.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                tick: 0,
                initial_limit: memory_limit,
                memory_limit,
                memory_used: 0,
                active_memory: 0,
                stats: MemoryCacheStats {
                    memory_limit,
                    ..Default::default()
                },
            }),
            on_evict: None,
        }
    }

    /// Register a callback for evicted entries, typically to recycle their
    /// backing memory.
    pub fn with_eviction_listener(mut self, listener: EvictionListener<K, V>) -> Self {
        self.on_evict = Some(listener);
        self
    }

    fn notify(&self, evicted: Vec<(K, Arc<V>)>) {
        if let Some(listener) = &self.on_evict {
            for (key, value) in evicted {
                listener(key, value);
            }
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut state = lock(&self.state);
        let value = state.entries.get(key).map(|e| e.value.clone());
        if value.is_some() {
            state.touch(key);
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        value
    }

    /// Look up an entry and take an active reference on it.
    ///
    /// The entry leaves the evictable set until every reference taken this
    /// way has been given back with [`MemoryCache::release`].
    pub fn acquire(&self, key: &K) -> Option<Arc<V>> {
        let mut state = lock(&self.state);
        if !state.entries.contains_key(key) {
            state.stats.misses += 1;
            return None;
        }
        state.touch(key);
        state.stats.hits += 1;

        let state = &mut *state;
        let entry = state.entries.get_mut(key)?;
        if entry.active == 0 {
            state.lru.remove(&entry.tick);
            state.memory_used -= entry.size;
            state.active_memory += entry.size;
        }
        entry.active += 1;
        let value = entry.value.clone();
        state.refresh_stats();
        Some(value)
    }

    /// Take another active reference on an entry already held by the caller.
    ///
    /// Returns `false` if the key no longer maps to this exact instance.
    pub fn retain(&self, key: &K, value: &Arc<V>) -> bool {
        let mut state = lock(&self.state);
        let state = &mut *state;
        match state.entries.get_mut(key) {
            Some(entry) if Arc::ptr_eq(&entry.value, value) => {
                if entry.active == 0 {
                    state.lru.remove(&entry.tick);
                    state.memory_used -= entry.size;
                    state.active_memory += entry.size;
                }
                entry.active += 1;
                state.refresh_stats();
                true
            }
            _ => false,
        }
    }

    /// Give back one active reference, consuming the caller's `Arc`.
    ///
    /// The caller's clone is dropped before eviction listeners run, so a
    /// listener can reclaim the value if nobody else holds it. If the key no
    /// longer maps to this exact instance (it was removed or replaced
    /// meanwhile) nothing changes and the value is handed back.
    pub fn release(&self, key: &K, value: Arc<V>) -> Result<(), Arc<V>> {
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            let state = &mut *state;
            let Some(entry) = state.entries.get_mut(key) else {
                return Err(value);
            };
            if !Arc::ptr_eq(&entry.value, &value) || entry.active == 0 {
                return Err(value);
            }
            drop(value);
            entry.active -= 1;
            if entry.active == 0 {
                state.lru.insert(entry.tick, key.clone());
                state.active_memory -= entry.size;
                state.memory_used += entry.size;
                let limit = state.memory_limit;
                state.evict_to(limit, None, &mut evicted);
            }
            state.refresh_stats();
        }
        self.notify(evicted);
        Ok(())
    }

    /// Insert an evictable entry, evicting least recently used entries until
    /// the budget holds. An entry larger than the whole budget is still kept
    /// when nothing else is left to evict.
    pub fn put(&self, key: K, value: Arc<V>, size: usize) {
        self.put_acquired(key, value, size, 0);
    }

    /// Insert an entry that already has `references` active users.
    pub fn put_acquired(&self, key: K, value: Arc<V>, size: usize, references: usize) {
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            if let Some(old) = state.detach(&key) {
                if old.active == 0 && !Arc::ptr_eq(&old.value, &value) {
                    evicted.push((key.clone(), old.value));
                }
            }

            let tick = state.next_tick();
            if references == 0 {
                state.lru.insert(tick, key.clone());
                state.memory_used += size;
            } else {
                state.active_memory += size;
            }
            state.entries.insert(
                key.clone(),
                Entry {
                    value,
                    size,
                    active: references,
                    tick,
                },
            );

            let limit = state.memory_limit;
            state.evict_to(limit, Some(&key), &mut evicted);
            state.refresh_stats();
        }
        self.notify(evicted);
    }

    /// Remove an entry whether or not it is active. The value is returned to
    /// the caller rather than reported as an eviction.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut state = lock(&self.state);
        let entry = state.detach(key);
        state.refresh_stats();
        entry.map(|e| e.value)
    }

    /// Check if a key is cached without updating recency
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    /// Number of outstanding active references on `key`.
    pub fn active_references(&self, key: &K) -> usize {
        lock(&self.state).entries.get(key).map_or(0, |e| e.active)
    }

    /// Rescale the budget to `factor` times the initial size.
    pub fn set_size_multiplier(&self, factor: f32) {
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            let factor = factor.max(0.0) as f64;
            state.memory_limit = (state.initial_limit as f64 * factor).round() as usize;
            let limit = state.memory_limit;
            state.evict_to(limit, None, &mut evicted);
            state.refresh_stats();
        }
        self.notify(evicted);
    }

    /// Respond to a memory pressure signal. Active entries are untouched.
    pub fn trim(&self, level: MemoryPressure) {
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            let target = level.trim_target(state.memory_limit);
            state.evict_to(target, None, &mut evicted);
            state.refresh_stats();
        }
        log::debug!("memory cache trimmed {} entries ({:?})", evicted.len(), level);
        self.notify(evicted);
    }

    /// Evict every inactive entry.
    pub fn clear_memory(&self) {
        self.trim(MemoryPressure::Critical);
    }

    pub fn memory_limit(&self) -> usize {
        lock(&self.state).memory_limit
    }

    /// Bytes held by evictable entries
    pub fn memory_used(&self) -> usize {
        lock(&self.state).memory_used
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    pub fn stats(&self) -> MemoryCacheStats {
        lock(&self.state).stats
    }
}
