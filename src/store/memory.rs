// ABOUTME: In-memory replay store with LRU eviction and TTL support
// ABOUTME: Includes optional background sweep task for expired entries
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ReplayStore, StoreConfig};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// In-memory entry with expiration
#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory TTL cache with LRU eviction and optional background sweep
///
/// Uses `Arc<RwLock<LruCache>>` for shared state between store operations and
/// the background sweep task. The Arc is required because the sweep task
/// (spawned in `new`) needs shared ownership of the map to remove expired
/// entries concurrently. `LruCache` bounds memory under write floods by
/// evicting the least-recently-used entry on push.
#[derive(Clone)]
pub struct TtlCache {
    entries: Arc<RwLock<LruCache<String, Entry>>>,
    shutdown_tx: Option<Arc<tokio::sync::mpsc::Sender<()>>>,
}

impl TtlCache {
    /// Fallback capacity when config specifies zero entries
    const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
        Some(n) => n,
        None => unreachable!(),
    };

    /// Create a new cache, spawning the background sweep task if configured
    #[must_use]
    pub fn new(config: &StoreConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(Self::DEFAULT_CAPACITY);
        let entries = Arc::new(RwLock::new(LruCache::new(capacity)));

        let shutdown_tx = if config.enable_background_cleanup {
            let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
            let entries_clone = entries.clone();
            let cleanup_interval = config.cleanup_interval;

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(cleanup_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            Self::sweep_expired(&entries_clone).await;
                        }
                        _ = shutdown_rx.recv() => {
                            tracing::debug!("replay store sweep task received shutdown signal");
                            break;
                        }
                    }
                }
            });

            Some(Arc::new(shutdown_tx))
        } else {
            None
        };

        Self {
            entries,
            shutdown_tx,
        }
    }

    /// Create a cache with defaults suitable for tests (no background task)
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new(&StoreConfig::for_testing())
    }

    /// Number of live entries, expired included until swept
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn sweep_expired(entries: &Arc<RwLock<LruCache<String, Entry>>>) -> usize {
        let mut guard = entries.write().await;

        // Collect expired keys first (can't modify while iterating)
        let expired: Vec<String> = guard
            .iter()
            .filter_map(|(k, v)| v.is_expired().then(|| k.clone()))
            .collect();

        for key in &expired {
            guard.pop(key);
        }

        let removed = expired.len();
        drop(guard);
        if removed > 0 {
            tracing::debug!("swept {removed} expired replay entries");
        }
        removed
    }
}

#[async_trait]
impl ReplayStore for TtlCache {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let entry = Entry::new(value, ttl);
        // LruCache evicts automatically on push
        self.entries.write().await.push(key.to_owned(), entry);
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.write().await;

        // LruCache::get is mutable (updates access order)
        if let Some(entry) = entries.get(key) {
            if entry.is_expired() {
                entries.pop(key);
                return None;
            }
            return Some(entry.data.clone());
        }
        None
    }

    async fn take(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.write().await;

        // Removal and read happen under one write lock, so at most one
        // caller ever observes the record
        let entry = entries.pop(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.data)
    }

    async fn exists(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get(key) {
            if entry.is_expired() {
                entries.pop(key);
                return false;
            }
            return true;
        }
        false
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.pop(key);
    }

    async fn sweep(&self) -> usize {
        Self::sweep_expired(&self.entries).await
    }
}

impl Drop for TtlCache {
    fn drop(&mut self) {
        // Signal the sweep task to shut down; errors mean the channel is
        // already closed or another clone is still alive
        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.try_send(()) {
                tracing::debug!(error = ?e, "replay store shutdown signal send failed");
            }
        }
    }
}
