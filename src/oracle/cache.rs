//! TTL response cache with stale-on-error reads.
//!
//! Entries are never expired on the store side: `get` applies the TTL while
//! `get_stale` ignores it, so a previously successful answer stays available
//! as a fallback until it is overwritten.

use crate::oracle::storage::{MokaStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A cached value and the moment it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

/// Generic key to value cache with a per-instance TTL.
pub struct ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    name: String,
    store: Arc<dyn StateStore<CacheEntry<T>>>,
    ttl: Duration,
}

impl<T> ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache backed by a bounded moka store.
    pub fn new(name: &str, ttl: Duration, max_entries: u64) -> Self {
        Self::with_store(name, Arc::new(MokaStore::new(max_entries)), ttl)
    }

    /// Create a cache over an injected store.
    pub fn with_store(name: &str, store: Arc<dyn StateStore<CacheEntry<T>>>, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            store,
            ttl,
        }
    }

    /// Build a composite key from an operation name and its arguments.
    pub fn key(operation: &str, args: &[&str]) -> String {
        if args.is_empty() {
            operation.to_string()
        } else {
            format!("{}:{}", operation, args.join(":"))
        }
    }

    /// Fresh read: returns the value only while it is younger than the TTL.
    pub async fn get(&self, key: &str) -> Option<T> {
        let entry = self.store.get(key).await?;
        if entry.age() <= self.ttl {
            debug!(cache = %self.name, key = %key, "cache hit");
            Some(entry.value)
        } else {
            debug!(cache = %self.name, key = %key, "cache entry expired");
            None
        }
    }

    /// Stale read: returns the last stored value regardless of age.
    pub async fn get_stale(&self, key: &str) -> Option<T> {
        self.store.get(key).await.map(|entry| entry.value)
    }

    pub async fn set(&self, key: &str, value: T) {
        self.store
            .put(
                key,
                CacheEntry {
                    value,
                    stored_at: Instant::now(),
                },
            )
            .await;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
