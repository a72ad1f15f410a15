// ABOUTME: Replay store abstraction for single-use security records
// ABOUTME: Defines the ReplayStore trait and configuration shared by implementations
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replay store abstraction
//!
//! Every single-use record in the crate (CSRF state, PKCE challenge, DPoP jti,
//! DPoP nonce) lives behind [`ReplayStore`]. The trait is object-safe and
//! byte-valued so managers hold an `Arc<dyn ReplayStore>`; records serialize
//! through `serde_json` at the call site.
//!
//! The shipped [`memory::TtlCache`] keeps single-process semantics.
//! Multi-instance deployments swap in a shared implementation (any backend
//! with an atomic get-and-delete, e.g. Redis `GETDEL`) without touching
//! validation logic — `take` is the only primitive single-use correctness
//! depends on.

use async_trait::async_trait;
use std::time::Duration;

/// In-memory replay store implementation
pub mod memory;

pub use memory::TtlCache;

/// Pluggable storage for time-boxed single-use records
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Store a value under `key` for at most `ttl`
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);

    /// Fetch a value. Expired entries are removed and reported absent even
    /// if no sweep has run.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Atomically fetch and delete a value. This is the single-use
    /// primitive: at most one caller ever observes a given record.
    async fn take(&self, key: &str) -> Option<Vec<u8>>;

    /// Whether a live (non-expired) entry exists under `key`
    async fn exists(&self, key: &str) -> bool;

    /// Remove an entry if present
    async fn delete(&self, key: &str);

    /// Remove expired entries, returning the count removed. A memory bound
    /// only; correctness never depends on sweeps running.
    async fn sweep(&self) -> usize;
}

/// Replay store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum live entries before LRU eviction
    pub max_entries: usize,
    /// Interval between background sweeps
    pub cleanup_interval: Duration,
    /// Spawn a background sweep task
    pub enable_background_cleanup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(60),
            enable_background_cleanup: true,
        }
    }
}

impl StoreConfig {
    /// Configuration for tests: small, no background task
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_entries: 100,
            cleanup_interval: Duration::from_secs(60),
            enable_background_cleanup: false,
        }
    }
}
