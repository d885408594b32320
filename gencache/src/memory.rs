//! In-process backend.
//!
//! Follows memcached semantics closely enough to stand in for a real bucket:
//! conditional writes, counters stored as decimal strings, decrements that
//! stop at zero, and optional expiry.

use crate::error::{CacheError, CacheResult};
use crate::traits::{Backend, WriteOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|exp| exp > Instant::now())
    }
}

/// In-memory backend.
///
/// Cloning shares the underlying store, so a clone handed to a router can
/// still be inspected by its creator.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    available: Arc<AtomicBool>,
    operations: Arc<AtomicU64>,
    name: Arc<str>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create an empty store with a name used in logs.
    pub fn named(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            operations: Arc::new(AtomicU64::new(0)),
            name: Arc::from(name),
        }
    }

    /// Simulate the node going away (`false`) or coming back (`true`).
    /// While unavailable every operation fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of operations received so far, including failed ones.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.data.read().await.values().filter(|e| e.is_live()).count()
    }

    /// Whether the store holds no live entry.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a live entry exists for `key`. Does not count as an
    /// operation.
    pub async fn contains_key(&self, key: &str) -> bool {
        self.data
            .read()
            .await
            .get(key)
            .is_some_and(Entry::is_live)
    }

    /// Live keys, unordered. Does not count as an operation.
    pub async fn keys(&self) -> Vec<String> {
        self.data
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn begin(&self) -> CacheResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Connection(format!("{} is unavailable", self.name)))
        }
    }

    async fn adjust(&self, key: &str, offset: u64, up: bool) -> CacheResult<Option<u64>> {
        self.begin()?;

        let mut data = self.data.write().await;
        let Some(entry) = data.get_mut(key).filter(|e| e.is_live()) else {
            return Ok(None);
        };

        let current: u64 = entry
            .value
            .trim()
            .parse()
            .map_err(|_| CacheError::NonNumeric(key.to_string()))?;

        let new_value = if up {
            current.wrapping_add(offset)
        } else {
            current.saturating_sub(offset)
        };
        entry.value = new_value.to_string();

        Ok(Some(new_value))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.begin()?;

        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.begin()?;

        self.data
            .write()
            .await
            .insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        self.begin()?;

        let mut data = self.data.write().await;
        if data.get(key).is_some_and(Entry::is_live) {
            return Ok(WriteOutcome::NotStored);
        }

        data.insert(key.to_string(), Entry::new(value, ttl));
        Ok(WriteOutcome::Stored)
    }

    async fn replace(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        self.begin()?;

        let mut data = self.data.write().await;
        if !data.get(key).is_some_and(Entry::is_live) {
            return Ok(WriteOutcome::NotStored);
        }

        data.insert(key.to_string(), Entry::new(value, ttl));
        Ok(WriteOutcome::Stored)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.begin()?;

        let removed = self.data.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live()))
    }

    async fn increment(&self, key: &str, offset: u64) -> CacheResult<Option<u64>> {
        self.adjust(key, offset, true).await
    }

    async fn decrement(&self, key: &str, offset: u64) -> CacheResult<Option<u64>> {
        self.adjust(key, offset, false).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
