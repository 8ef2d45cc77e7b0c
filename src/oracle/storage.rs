//! Storage abstraction for the oracle's shared mutable state.
//!
//! Rate-limit windows, circuit state and response caches are all kept behind
//! the same small key-value contract so tests can inject isolated instances
//! and a shared external store can later replace the in-process ones.

use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Formal contract for keyed process state.
#[async_trait]
pub trait StateStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Read the current value for a key.
    async fn get(&self, key: &str) -> Option<V>;

    /// Overwrite the value for a key (last write wins).
    async fn put(&self, key: &str, value: V);

    /// Atomically read, modify and write back the slot for `key`.
    ///
    /// The closure sees `None` for an absent key; leaving `None` in the slot
    /// removes the key.
    async fn modify(&self, key: &str, f: &mut (dyn for<'s> FnMut(&'s mut Option<V>) + Send));

    /// Number of keys currently held.
    async fn len(&self) -> usize;
}

/// Unbounded in-memory store guarded by a single async mutex.
pub struct InMemoryStore<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V> InMemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> Default for InMemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> StateStore<V> for InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn put(&self, key: &str, value: V) {
        self.entries.lock().await.insert(key.to_string(), value);
    }

    async fn modify(&self, key: &str, f: &mut (dyn for<'s> FnMut(&'s mut Option<V>) + Send)) {
        let mut entries = self.entries.lock().await;
        let mut slot = entries.remove(key);
        f(&mut slot);
        if let Some(value) = slot {
            entries.insert(key.to_string(), value);
        }
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Capacity-bounded store backed by moka.
///
/// Response caches use no TTL on the moka side: expiry is decided by the
/// caller so that expired entries remain readable as stale fallbacks.
pub struct MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<String, V>,
    write_lock: Mutex<()>,
}

impl<V> MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: u64) -> Self {
        debug!("Creating moka store with capacity {}", max_entries);
        Self {
            cache: Cache::builder().max_capacity(max_entries).build(),
            write_lock: Mutex::new(()),
        }
    }

    /// Bounded store that also drops keys left untouched for `idle`.
    pub fn with_time_to_idle(max_entries: u64, idle: Duration) -> Self {
        debug!("Creating moka store with capacity {} and idle expiry {:?}", max_entries, idle);
        Self {
            cache: Cache::builder().max_capacity(max_entries).time_to_idle(idle).build(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<V> StateStore<V> for MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key).await
    }

    async fn put(&self, key: &str, value: V) {
        let _guard = self.write_lock.lock().await;
        self.cache.insert(key.to_string(), value).await;
    }

    async fn modify(&self, key: &str, f: &mut (dyn for<'s> FnMut(&'s mut Option<V>) + Send)) {
        let _guard = self.write_lock.lock().await;
        let mut slot = self.cache.get(key).await;
        f(&mut slot);
        match slot {
            Some(value) => self.cache.insert(key.to_string(), value).await,
            None => self.cache.invalidate(key).await,
        }
    }

    async fn len(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count() as usize
    }
}
