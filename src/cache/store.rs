//! Cache storage.
//!
//! `CacheStore` is the seam a shared backend would implement for multi-process
//! deployments; `MemoryStore` is the process-local implementation used for
//! both the page store and the shell store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::config::Capacity;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Hands out render generations in the order renders start.
///
/// Clones share one counter, so every writer of a store must draw from the
/// same sequence for generations to be comparable.
#[derive(Debug, Clone, Default)]
pub struct RenderSequence(Arc<AtomicU64>);

impl RenderSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation for a render that is about to start. Never returns zero.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Rendered page bytes, the instant they were produced and the generation
/// of the render that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    bytes: Bytes,
    generation: u64,
    created_at: Instant,
}

impl CacheEntry {
    pub fn new(bytes: Bytes, generation: u64) -> Self {
        Self {
            bytes,
            generation,
            created_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_created_at(bytes: Bytes, created_at: Instant) -> Self {
        Self {
            bytes,
            generation: 0,
            created_at,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// True when `self` came from a render that started after `other`'s.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.generation > other.generation
    }
}

/// Result of a conditional store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Stored { evicted: Option<CacheKey> },
    /// The current entry was kept and the offered value dropped.
    Kept,
}

/// Key/value store holding immutable cache entries.
///
/// Implementations must never hold a lock across an `.await` of the caller's
/// render work; each call is a single short map operation.
#[async_trait]
pub trait CacheStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Option<V>;

    /// Insert or replace `key`; returns the key evicted to make room, if any.
    async fn insert(&self, key: CacheKey, value: V) -> Option<CacheKey>;

    /// Insert `value` unless `keeps(current, &value)` holds for the entry
    /// already stored under `key`. The check and the write are atomic.
    async fn insert_unless(
        &self,
        key: CacheKey,
        value: V,
        keeps: for<'a, 'b> fn(&'a V, &'b V) -> bool,
    ) -> StoreWrite;

    async fn remove(&self, key: &CacheKey) -> bool;

    async fn clear(&self);

    async fn len(&self) -> usize;

    /// Backend name used in logs.
    fn name(&self) -> &'static str;
}

struct Ledger<V> {
    entries: HashMap<CacheKey, V>,
    order: VecDeque<CacheKey>,
}

impl<V> Ledger<V> {
    fn store(&mut self, key: CacheKey, value: V, capacity: Capacity) -> Option<CacheKey> {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }

        if !capacity.is_exceeded_by(self.entries.len()) {
            return None;
        }

        let oldest = self.order.pop_front()?;
        self.entries.remove(&oldest);
        Some(oldest)
    }
}

/// In-memory store with strict FIFO eviction.
///
/// Eviction order is insertion order only; reads never promote an entry.
/// Replacing an existing key keeps its original position in the ledger.
pub struct MemoryStore<V> {
    name: &'static str,
    capacity: Capacity,
    inner: RwLock<Ledger<V>>,
}

impl<V> MemoryStore<V> {
    pub fn new(name: &'static str, capacity: Capacity) -> Self {
        Self {
            name,
            capacity,
            inner: RwLock::new(Ledger {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Keys in eviction order, oldest first.
    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.inner, SOURCE, "keys")
            .order
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<V> CacheStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Option<V> {
        rw_read(&self.inner, SOURCE, "get").entries.get(key).cloned()
    }

    async fn insert(&self, key: CacheKey, value: V) -> Option<CacheKey> {
        let mut ledger = rw_write(&self.inner, SOURCE, "insert");
        ledger.store(key, value, self.capacity)
    }

    async fn insert_unless(
        &self,
        key: CacheKey,
        value: V,
        keeps: for<'a, 'b> fn(&'a V, &'b V) -> bool,
    ) -> StoreWrite {
        let mut ledger = rw_write(&self.inner, SOURCE, "insert_unless");
        if let Some(current) = ledger.entries.get(&key) {
            if keeps(current, &value) {
                return StoreWrite::Kept;
            }
        }
        StoreWrite::Stored {
            evicted: ledger.store(key, value, self.capacity),
        }
    }

    async fn remove(&self, key: &CacheKey) -> bool {
        let mut ledger = rw_write(&self.inner, SOURCE, "remove");
        if ledger.entries.remove(key).is_none() {
            return false;
        }
        ledger.order.retain(|candidate| candidate != key);
        true
    }

    async fn clear(&self) {
        let mut ledger = rw_write(&self.inner, SOURCE, "clear");
        ledger.entries.clear();
        ledger.order.clear();
    }

    async fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").entries.len()
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
