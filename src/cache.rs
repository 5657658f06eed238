use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::response::ShardQueryResponse;

/// Hash of everything that determines a query's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryCacheKey([u8; 32]);

impl QueryCacheKey {
    /// Hash the serialized form of `parts`. `None` when they cannot be
    /// serialized, which makes the query uncacheable.
    pub fn from_parts<T: Serialize>(parts: &T) -> Option<Self> {
        let bytes = serde_json::to_vec(parts).ok()?;
        Some(Self(*blake3::hash(&bytes).as_bytes()))
    }
}

struct CacheState {
    entries: Option<LruCache<QueryCacheKey, ShardQueryResponse>>,
    /// Reader generation the cached entries were computed against.
    generation: u64,
}

/// Bounded LRU of query responses, tied to one reader generation.
///
/// Entries computed against an older generation are never stored, an entry
/// is only served to a caller holding the same generation, and every reader
/// refresh clears the cache.
pub struct ResultCache {
    state: Mutex<CacheState>,
    max_amount: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn lru(capacity: usize) -> Option<LruCache<QueryCacheKey, ShardQueryResponse>> {
    NonZeroUsize::new(capacity).map(LruCache::new)
}

impl ResultCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize, max_amount: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: lru(capacity),
                generation: 0,
            }),
            max_amount: AtomicUsize::new(max_amount),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Replace the cache with an empty one of the new size.
    pub fn reconfigure(&self, capacity: usize, max_amount: usize) {
        let mut state = self.state.lock();
        state.entries = lru(capacity);
        self.max_amount.store(max_amount, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().entries.is_some()
    }

    /// Whether a query with this key and amount may use the cache.
    pub fn is_eligible(
        &self,
        key: Option<&QueryCacheKey>,
        amount: usize,
    ) -> bool {
        let max_amount = self.max_amount.load(Ordering::Relaxed);
        key.is_some()
            && (max_amount == 0 || amount <= max_amount)
            && self.is_enabled()
    }

    /// Look up a response for a caller reading reader `generation`.
    pub fn get(
        &self,
        key: &QueryCacheKey,
        generation: u64,
    ) -> Option<ShardQueryResponse> {
        let mut state = self.state.lock();
        let found = if state.generation == generation {
            state.entries.as_mut().and_then(|e| e.get(key).cloned())
        } else {
            None
        };
        match found {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response computed against reader `generation`. Dropped if
    /// the reader has moved on since.
    pub fn put(
        &self,
        key: QueryCacheKey,
        generation: u64,
        response: ShardQueryResponse,
    ) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        if let Some(entries) = state.entries.as_mut() {
            entries.put(key, response);
        }
    }

    /// Drop every entry and start accepting results for `generation`.
    pub fn invalidate(&self, generation: u64) {
        let mut state = self.state.lock();
        if let Some(entries) = state.entries.as_mut() {
            entries.clear();
        }
        state.generation = generation;
    }

    pub fn clear(&self) {
        if let Some(entries) = self.state.lock().entries.as_mut() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.as_ref().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            size: state.entries.as_ref().map_or(0, |e| e.len()),
            capacity: state.entries.as_ref().map_or(0, |e| e.cap().get()),
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}
