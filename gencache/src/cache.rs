//! Cache facade.
//!
//! A [`CacheContext`] owns what is shared between units of work: the
//! backend router, the generation token store and the configured group
//! sets. Each unit of work takes its own [`ObjectCache`] from
//! [`CacheContext::begin`], with a private local cache and counters.

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::generation::GenerationStore;
use crate::key::{ComposedKey, KeyComposer};
use crate::local::{LocalCache, LocalEntry};
use crate::router::{BackendHandle, BackendRouter};
use crate::stats::{CacheStats, Counters};
use crate::traits::WriteOutcome;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Optional capabilities a host may probe for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    AddMultiple,
    SetMultiple,
    GetMultiple,
    DeleteMultiple,
    FlushRuntime,
    FlushGroup,
}

impl Feature {
    /// Every feature, in declaration order.
    pub const ALL: [Feature; 6] = [
        Feature::AddMultiple,
        Feature::SetMultiple,
        Feature::GetMultiple,
        Feature::DeleteMultiple,
        Feature::FlushRuntime,
        Feature::FlushGroup,
    ];

    /// Host-facing feature name.
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::AddMultiple => "add_multiple",
            Feature::SetMultiple => "set_multiple",
            Feature::GetMultiple => "get_multiple",
            Feature::DeleteMultiple => "delete_multiple",
            Feature::FlushRuntime => "flush_runtime",
            Feature::FlushGroup => "flush_group",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s.trim())
            .ok_or_else(|| CacheError::Other(format!("Unknown feature: {}", s)))
    }
}

/// Shared state of a cache deployment.
///
/// Construct one per process (or per site) and hand out units of work with
/// [`CacheContext::begin`].
pub struct CacheContext {
    router: Arc<BackendRouter>,
    generations: Arc<GenerationStore>,
    ignored_groups: BTreeSet<String>,
    global_groups: BTreeSet<String>,
    site: Option<String>,
    multisite: bool,
}

impl CacheContext {
    /// Create a context over an existing router. Bucket settings in
    /// `config` are not used.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::{BackendRouter, CacheConfig, CacheContext, MemoryBackend};
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> gencache::CacheResult<()> {
    /// let router = Arc::new(BackendRouter::new(Arc::new(MemoryBackend::new())));
    /// let context = CacheContext::new(router, &CacheConfig::new("blog"))?;
    ///
    /// let mut cache = context.begin();
    /// cache.set("post:1", "posts", "hello", None).await?;
    /// assert_eq!(cache.get("post:1", "posts").await?, Some("hello".to_string()));
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(router: Arc<BackendRouter>, config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;

        Ok(Self {
            generations: Arc::new(GenerationStore::new(router.clone(), config.prefix.clone())),
            router,
            ignored_groups: config.ignored_groups.clone(),
            global_groups: config.global_groups.clone(),
            site: config.site.clone(),
            multisite: config.multisite,
        })
    }

    /// Connect the configured buckets and create a context over them.
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        let router = BackendRouter::connect(config).await?;
        Self::new(Arc::new(router), config)
    }

    /// Start a unit of work.
    pub fn begin(&self) -> ObjectCache {
        ObjectCache {
            router: self.router.clone(),
            keys: KeyComposer::new(self.generations.clone()),
            local: LocalCache::new(),
            counters: Counters::default(),
            ignored_groups: self.ignored_groups.clone(),
            global_groups: self.global_groups.clone(),
            site: self.site.clone(),
            multisite: self.multisite,
        }
    }

    /// Replace the bucket map and drop cached generation tokens so the new
    /// default bucket is consulted.
    pub fn reconfigure(&self, buckets: HashMap<String, BackendHandle>) -> CacheResult<()> {
        self.router.reconfigure(buckets)?;
        self.generations.forget();
        Ok(())
    }

    /// The shared bucket router.
    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    /// The shared generation token store.
    pub fn generations(&self) -> &Arc<GenerationStore> {
        &self.generations
    }
}

/// One unit of work against the cache.
///
/// Reads consult the local cache first; positive and negative entries are
/// both answered locally until [`ObjectCache::get_fresh`] or a flush.
/// Payloads are owned strings, so callers always receive their own copy.
pub struct ObjectCache {
    router: Arc<BackendRouter>,
    keys: KeyComposer,
    local: LocalCache,
    counters: Counters,
    ignored_groups: BTreeSet<String>,
    global_groups: BTreeSet<String>,
    site: Option<String>,
    multisite: bool,
}

impl ObjectCache {
    /// Start a sibling unit of work sharing the same context. Group sets
    /// and site are carried over; the local cache and counters start empty.
    pub fn fork(&self) -> ObjectCache {
        ObjectCache {
            router: self.router.clone(),
            keys: self.keys.clone(),
            local: LocalCache::new(),
            counters: Counters::default(),
            ignored_groups: self.ignored_groups.clone(),
            global_groups: self.global_groups.clone(),
            site: self.site.clone(),
            multisite: self.multisite,
        }
    }

    /// Get a value, answering from the local cache when possible.
    pub async fn get(&mut self, key: &str, group: &str) -> CacheResult<Option<String>> {
        self.fetch(key, group, false).await
    }

    /// Get a value from the backend, refreshing the local cache.
    pub async fn get_fresh(&mut self, key: &str, group: &str) -> CacheResult<Option<String>> {
        self.fetch(key, group, true).await
    }

    /// Store a value unconditionally.
    ///
    /// The local cache keeps the value even when the backend write fails;
    /// the failure is still returned.
    pub async fn set(
        &mut self,
        key: &str,
        group: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        if self.is_ignored_group(group) {
            return Ok(());
        }

        let composed = self.keys.compose(key, group).await?;
        let backend = self.router.bucket_for(group);
        let result = self
            .timed(backend.set(composed.as_str(), value, ttl))
            .await;

        if let Err(e) = &result {
            warn!(key = %composed, error = %e, "Backend write failed, keeping local value");
        }
        self.local
            .set(composed, group, LocalEntry::Found(value.to_string()));

        result
    }

    /// Store a value only if the key holds none. Returns `false` when the
    /// key already exists, locally or in the backend.
    pub async fn add(
        &mut self,
        key: &str,
        group: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        if self.is_ignored_group(group) {
            return Ok(true);
        }

        let composed = self.keys.compose(key, group).await?;
        if self.local.is_found(&composed, group) {
            return Ok(false);
        }

        let backend = self.router.bucket_for(group);
        match self
            .timed(backend.add(composed.as_str(), value, ttl))
            .await
        {
            Ok(WriteOutcome::Stored) => {
                self.local
                    .set(composed, group, LocalEntry::Found(value.to_string()));
                Ok(true)
            }
            Ok(WriteOutcome::NotStored) => {
                // Only a negative entry can be present here, and the backend
                // just proved it wrong.
                self.local.clear(&composed, group);
                Ok(false)
            }
            Err(e) => {
                self.local.clear(&composed, group);
                Err(e)
            }
        }
    }

    /// Store a value only if the key already exists.
    pub async fn replace(
        &mut self,
        key: &str,
        group: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        if self.is_ignored_group(group) {
            return Ok(true);
        }

        let composed = self.keys.compose(key, group).await?;
        let backend = self.router.bucket_for(group);
        match self
            .timed(backend.replace(composed.as_str(), value, ttl))
            .await
        {
            Ok(WriteOutcome::Stored) => {
                self.local
                    .set(composed, group, LocalEntry::Found(value.to_string()));
                Ok(true)
            }
            Ok(WriteOutcome::NotStored) => {
                self.local.clear(&composed, group);
                Ok(false)
            }
            Err(e) => {
                self.local.clear(&composed, group);
                Err(e)
            }
        }
    }

    /// Delete a value. Returns `true` only if the backend removed an entry.
    pub async fn delete(&mut self, key: &str, group: &str) -> CacheResult<bool> {
        if self.is_ignored_group(group) {
            return Ok(true);
        }

        let composed = self.keys.compose(key, group).await?;
        let backend = self.router.bucket_for(group);
        let result = self.timed(backend.delete(composed.as_str())).await;

        self.local.clear(&composed, group);
        result
    }

    /// Increment a numeric value. Returns `None` if the key does not exist.
    pub async fn increment(
        &mut self,
        key: &str,
        group: &str,
        offset: u64,
    ) -> CacheResult<Option<u64>> {
        self.adjust(key, group, offset, true).await
    }

    /// Decrement a numeric value, stopping at zero. Returns `None` if the
    /// key does not exist.
    pub async fn decrement(
        &mut self,
        key: &str,
        group: &str,
        offset: u64,
    ) -> CacheResult<Option<u64>> {
        self.adjust(key, group, offset, false).await
    }

    /// Invalidate everything: clear the local cache and rotate the global
    /// token.
    pub async fn flush(&mut self) -> CacheResult<()> {
        self.local.clear_all();
        let token = self.keys.generations().reset_global().await?;
        debug!(token = %token, "Flushed cache");
        Ok(())
    }

    /// Invalidate one group: clear its local partition and rotate its token.
    pub async fn flush_group(&mut self, group: &str) -> CacheResult<()> {
        self.local.clear_group(group);
        if self.is_ignored_group(group) {
            return Ok(());
        }

        let token = self.keys.generations().reset_group(group).await?;
        debug!(group, token = %token, "Flushed group");
        Ok(())
    }

    /// Clear the local cache only.
    pub fn flush_runtime(&mut self) {
        self.local.clear_all();
        debug!("Flushed runtime cache");
    }

    /// [`ObjectCache::get`] for several keys, in input order.
    pub async fn get_multiple<K: AsRef<str>>(
        &mut self,
        keys: &[K],
        group: &str,
    ) -> Vec<CacheResult<Option<String>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key.as_ref(), group).await);
        }
        results
    }

    /// [`ObjectCache::get_fresh`] for several keys, in input order.
    pub async fn get_multiple_fresh<K: AsRef<str>>(
        &mut self,
        keys: &[K],
        group: &str,
    ) -> Vec<CacheResult<Option<String>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get_fresh(key.as_ref(), group).await);
        }
        results
    }

    /// [`ObjectCache::delete`] for several keys, in input order.
    pub async fn delete_multiple<K: AsRef<str>>(
        &mut self,
        keys: &[K],
        group: &str,
    ) -> Vec<CacheResult<bool>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.delete(key.as_ref(), group).await);
        }
        results
    }

    /// [`ObjectCache::add`] for several entries, in input order.
    pub async fn add_multiple<K: AsRef<str>, V: AsRef<str>>(
        &mut self,
        entries: &[(K, V)],
        group: &str,
        ttl: Option<Duration>,
    ) -> Vec<CacheResult<bool>> {
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            results.push(self.add(key.as_ref(), group, value.as_ref(), ttl).await);
        }
        results
    }

    /// [`ObjectCache::set`] for several entries, in input order.
    pub async fn set_multiple<K: AsRef<str>, V: AsRef<str>>(
        &mut self,
        entries: &[(K, V)],
        group: &str,
        ttl: Option<Duration>,
    ) -> Vec<CacheResult<()>> {
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            results.push(self.set(key.as_ref(), group, value.as_ref(), ttl).await);
        }
        results
    }

    /// Mark groups as shared across sites.
    pub fn add_global_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_groups.extend(groups.into_iter().map(Into::into));
    }

    /// Exclude groups from persistent storage.
    pub fn add_non_persistent_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_groups.extend(groups.into_iter().map(Into::into));
    }

    /// Whether `group` is declared global.
    pub fn is_global_group(&self, group: &str) -> bool {
        self.global_groups.contains(group)
    }

    /// Whether `group` bypasses persistent storage.
    pub fn is_ignored_group(&self, group: &str) -> bool {
        self.ignored_groups.contains(group)
    }

    /// Switch the current site. Returns `false`, leaving the site as it
    /// was, unless the context serves several sites.
    pub fn switch_to_site(&mut self, site: impl Into<String>) -> bool {
        if !self.multisite {
            return false;
        }

        self.site = Some(site.into());
        true
    }

    /// Current site identifier.
    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }

    /// Logical key scoped to the current site. Global groups and
    /// single-site deployments use the key unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::{BackendRouter, CacheConfig, CacheContext, MemoryBackend};
    /// use std::sync::Arc;
    ///
    /// let router = Arc::new(BackendRouter::new(Arc::new(MemoryBackend::new())));
    /// let config = CacheConfig::new("net").with_site("7").with_global_groups(["users"]);
    /// let cache = CacheContext::new(router, &config).unwrap().begin();
    ///
    /// assert_eq!(cache.site_key("post:1", "posts"), "7:post:1");
    /// assert_eq!(cache.site_key("user:1", "users"), "user:1");
    /// ```
    pub fn site_key(&self, key: &str, group: &str) -> String {
        match self.site.as_deref() {
            Some(site) if self.multisite && !self.is_global_group(group) => {
                format!("{}:{}", site, key)
            }
            _ => key.to_string(),
        }
    }

    /// Whether an optional capability is available.
    pub fn supports(&self, feature: Feature) -> bool {
        matches!(
            feature,
            Feature::GetMultiple
                | Feature::DeleteMultiple
                | Feature::FlushGroup
                | Feature::FlushRuntime
        )
    }

    /// Counters of this unit of work.
    pub fn stats(&self) -> CacheStats {
        let generations = self.keys.generations();
        CacheStats {
            local_hits: self.counters.local_hits,
            remote_hits: self.counters.remote_hits,
            misses: self.counters.misses,
            backend_calls: self.counters.backend_calls,
            backend_time: self.counters.backend_time,
            local_entries: self.local.len(),
            local_footprint: self.local.footprint(),
            token_reads: generations.remote_reads(),
            token_writes: generations.remote_writes(),
        }
    }

    /// Read-only view of the local cache.
    pub fn local_cache(&self) -> &LocalCache {
        &self.local
    }

    /// Compose the backend key for `key` in `group`.
    pub async fn compose_key(&self, key: &str, group: &str) -> CacheResult<ComposedKey> {
        self.keys.compose(key, group).await
    }

    async fn fetch(&mut self, key: &str, group: &str, force: bool) -> CacheResult<Option<String>> {
        if self.is_ignored_group(group) {
            return Ok(None);
        }

        let composed = self.keys.compose(key, group).await?;

        if !force && let Some(entry) = self.local.get(&composed, group) {
            let value = entry.value().map(str::to_string);
            self.counters.local_hits += 1;
            return Ok(value);
        }

        let backend = self.router.bucket_for(group);
        let value = self.timed(backend.get(composed.as_str())).await?;

        match &value {
            Some(found) => {
                self.counters.remote_hits += 1;
                self.local
                    .set(composed, group, LocalEntry::Found(found.clone()));
            }
            None => {
                self.counters.misses += 1;
                self.local.set(composed, group, LocalEntry::Missing);
            }
        }

        Ok(value)
    }

    async fn adjust(
        &mut self,
        key: &str,
        group: &str,
        offset: u64,
        up: bool,
    ) -> CacheResult<Option<u64>> {
        if self.is_ignored_group(group) {
            return Ok(None);
        }

        let composed = self.keys.compose(key, group).await?;
        let backend = self.router.bucket_for(group);
        let result = if up {
            self.timed(backend.increment(composed.as_str(), offset)).await
        } else {
            self.timed(backend.decrement(composed.as_str(), offset)).await
        };

        match result {
            Ok(Some(value)) => {
                self.local
                    .set(composed, group, LocalEntry::Found(value.to_string()));
                Ok(Some(value))
            }
            Ok(None) => {
                self.local.clear(&composed, group);
                Ok(None)
            }
            Err(e) => {
                self.local.clear(&composed, group);
                Err(e)
            }
        }
    }

    /// Await a primary backend call, counting and timing it.
    async fn timed<T, F>(&mut self, call: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let result = call.await;
        self.counters.record_call(started.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::traits::Backend;

    fn context_with(backend: &MemoryBackend, config: CacheConfig) -> CacheContext {
        let router = Arc::new(BackendRouter::new(Arc::new(backend.clone())));
        CacheContext::new(router, &config).unwrap()
    }

    fn context(backend: &MemoryBackend) -> CacheContext {
        context_with(backend, CacheConfig::new("test"))
    }

    #[tokio::test]
    async fn test_get_caches_both_outcomes() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        assert_eq!(cache.get("missing", "g").await.unwrap(), None);
        assert_eq!(cache.get("missing", "g").await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.backend_calls, 1);
    }

    #[tokio::test]
    async fn test_get_fresh_rechecks_backend() {
        let backend = MemoryBackend::new();
        let context = context(&backend);
        let mut reader = context.begin();
        let mut writer = context.begin();

        assert_eq!(reader.get("k", "g").await.unwrap(), None);
        writer.set("k", "g", "v", None).await.unwrap();

        assert_eq!(reader.get("k", "g").await.unwrap(), None);
        assert_eq!(reader.get_fresh("k", "g").await.unwrap(), Some("v".into()));
        assert_eq!(reader.get("k", "g").await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn test_set_keeps_local_value_on_backend_failure() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();
        cache.get("warm", "g").await.unwrap();

        backend.set_available(false);
        assert!(cache.set("k", "g", "v", None).await.is_err());
        assert_eq!(cache.get("k", "g").await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn test_add_local_conflict_skips_backend() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        assert!(cache.add("k", "g", "first", None).await.unwrap());
        let calls = cache.stats().backend_calls;

        assert!(!cache.add("k", "g", "second", None).await.unwrap());
        assert_eq!(cache.stats().backend_calls, calls);
        assert_eq!(cache.get("k", "g").await.unwrap(), Some("first".into()));
    }

    #[tokio::test]
    async fn test_add_conflict_drops_negative_entry() {
        let backend = MemoryBackend::new();
        let context = context(&backend);
        let mut first = context.begin();
        let mut second = context.begin();

        assert_eq!(first.get("k", "g").await.unwrap(), None);
        assert!(second.add("k", "g", "theirs", None).await.unwrap());

        assert!(!first.add("k", "g", "mine", None).await.unwrap());
        assert_eq!(first.get("k", "g").await.unwrap(), Some("theirs".into()));
    }

    #[tokio::test]
    async fn test_add_error_clears_local() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();
        cache.get("k", "g").await.unwrap();
        let composed = cache.compose_key("k", "g").await.unwrap();

        backend.set_available(false);
        assert!(cache.add("k", "g", "v", None).await.is_err());
        assert_eq!(cache.local_cache().get(&composed, "g"), None);
    }

    #[tokio::test]
    async fn test_replace() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        assert!(!cache.replace("k", "g", "x", None).await.unwrap());
        cache.set("k", "g", "1", None).await.unwrap();
        assert!(cache.replace("k", "g", "2", None).await.unwrap());
        assert_eq!(cache.get_fresh("k", "g").await.unwrap(), Some("2".into()));
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        cache.set("k", "g", "v", None).await.unwrap();
        assert!(cache.delete("k", "g").await.unwrap());
        assert!(!cache.delete("k", "g").await.unwrap());
        assert_eq!(cache.get("k", "g").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counters() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        assert_eq!(cache.increment("n", "g", 1).await.unwrap(), None);

        cache.set("n", "g", "5", None).await.unwrap();
        assert_eq!(cache.increment("n", "g", 2).await.unwrap(), Some(7));
        assert_eq!(cache.get("n", "g").await.unwrap(), Some("7".into()));
        assert_eq!(cache.decrement("n", "g", 10).await.unwrap(), Some(0));

        cache.set("s", "g", "text", None).await.unwrap();
        assert!(matches!(
            cache.increment("s", "g", 1).await,
            Err(CacheError::NonNumeric(_))
        ));
        let composed = cache.compose_key("s", "g").await.unwrap();
        assert_eq!(cache.local_cache().get(&composed, "g"), None);
    }

    #[tokio::test]
    async fn test_ignored_group_never_reaches_backend() {
        let backend = MemoryBackend::new();
        let config = CacheConfig::new("test").with_ignored_groups(["counts"]);
        let mut cache = context_with(&backend, config).begin();

        assert!(cache.add("k", "counts", "v", None).await.unwrap());
        cache.set("k", "counts", "v", None).await.unwrap();
        assert!(cache.replace("k", "counts", "v", None).await.unwrap());
        assert!(cache.delete("k", "counts").await.unwrap());
        assert_eq!(cache.increment("k", "counts", 1).await.unwrap(), None);
        assert_eq!(cache.get("k", "counts").await.unwrap(), None);

        assert_eq!(backend.operation_count(), 0);
        assert_eq!(cache.stats().backend_calls, 0);
        assert!(cache.local_cache().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_group_sets() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        cache.add_non_persistent_groups(["plugins"]);
        cache.add_global_groups(vec!["users".to_string()]);

        assert!(cache.is_ignored_group("plugins"));
        assert!(cache.is_global_group("users"));
        assert!(!cache.is_global_group("posts"));
        assert!(cache.fork().is_ignored_group("plugins"));
    }

    #[tokio::test]
    async fn test_flush_group_isolates_group() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        cache.set("a", "posts", "1", None).await.unwrap();
        cache.set("a", "users", "2", None).await.unwrap();
        let stored = backend.len().await;

        cache.flush_group("posts").await.unwrap();

        assert_eq!(cache.get("a", "posts").await.unwrap(), None);
        assert_eq!(cache.get("a", "users").await.unwrap(), Some("2".into()));
        assert!(backend.len().await >= stored);
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let backend = MemoryBackend::new();
        let context = context(&backend);
        let mut cache = context.begin();

        cache.set("a", "posts", "1", None).await.unwrap();
        let group_token = context.generations().cached_group("posts");

        cache.flush().await.unwrap();

        assert!(cache.local_cache().is_empty());
        assert_eq!(cache.get("a", "posts").await.unwrap(), None);
        assert_eq!(context.generations().cached_group("posts"), group_token);
    }

    #[tokio::test]
    async fn test_flush_runtime_keeps_backend() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        cache.set("a", "g", "1", None).await.unwrap();
        cache.flush_runtime();
        assert!(cache.local_cache().is_empty());

        assert_eq!(cache.get("a", "g").await.unwrap(), Some("1".into()));
        assert_eq!(cache.stats().remote_hits, 1);
    }

    #[tokio::test]
    async fn test_multiple_operations_keep_order() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();

        let added = cache
            .add_multiple(&[("a", "1"), ("b", "2"), ("a", "3")], "g", None)
            .await;
        let added: Vec<bool> = added.into_iter().map(Result::unwrap).collect();
        assert_eq!(added, vec![true, true, false]);

        let values = cache.get_multiple(&["b", "missing", "a"], "g").await;
        let values: Vec<Option<String>> = values.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![Some("2".into()), None, Some("1".into())]);

        let fresh = cache.get_multiple_fresh(&["a"], "g").await;
        assert_eq!(fresh[0].as_ref().unwrap().as_deref(), Some("1"));

        let deleted = cache.delete_multiple(&["a", "missing"], "g").await;
        let deleted: Vec<bool> = deleted.into_iter().map(Result::unwrap).collect();
        assert_eq!(deleted, vec![true, false]);

        let set = cache.set_multiple(&[("x", "1"), ("y", "2")], "g", None).await;
        assert!(set.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_multiple_failures_are_per_key() {
        let backend = MemoryBackend::new();
        let mut cache = context(&backend).begin();
        cache.set("a", "g", "1", None).await.unwrap();

        backend.set_available(false);
        let values = cache.get_multiple(&["a", "b"], "g").await;
        assert_eq!(values[0].as_ref().unwrap().as_deref(), Some("1"));
        assert!(values[1].is_err());
    }

    #[tokio::test]
    async fn test_sites() {
        let backend = MemoryBackend::new();
        let mut single = context(&backend).begin();
        assert!(!single.switch_to_site("2"));
        assert_eq!(single.site(), None);
        assert_eq!(single.site_key("k", "g"), "k");

        let config = CacheConfig::new("test").with_site("1");
        let mut multi = context_with(&backend, config).begin();
        assert_eq!(multi.site(), Some("1"));
        assert!(multi.switch_to_site("2"));
        assert_eq!(multi.site_key("k", "g"), "2:k");
    }

    #[test]
    fn test_features() {
        let backend = MemoryBackend::new();
        let cache = context(&backend).begin();

        assert!(cache.supports(Feature::GetMultiple));
        assert!(cache.supports(Feature::FlushRuntime));
        assert!(!cache.supports(Feature::AddMultiple));
        assert!(!cache.supports(Feature::SetMultiple));

        assert_eq!("flush_group".parse::<Feature>().unwrap(), Feature::FlushGroup);
        assert!("teleport".parse::<Feature>().is_err());
        assert_eq!(Feature::DeleteMultiple.to_string(), "delete_multiple");
    }

    #[tokio::test]
    async fn test_token_failure_propagates() {
        let backend = MemoryBackend::new();
        let context = context(&backend);
        let mut cache = context.begin();

        backend.set_available(false);
        assert!(cache.get("k", "g").await.unwrap_err().is_connection_error());
        assert_eq!(context.generations().cached_global(), None);
        assert_eq!(context.generations().remote_writes(), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_moves_traffic() {
        let old = MemoryBackend::named("old");
        let new = MemoryBackend::named("new");
        let context = context(&old);
        let mut cache = context.begin();
        cache.set("k", "g", "v", None).await.unwrap();

        let mut buckets: HashMap<String, BackendHandle> = HashMap::new();
        buckets.insert("default".into(), Arc::new(new.clone()));
        context.reconfigure(buckets).unwrap();

        let mut cache = context.begin();
        assert_eq!(cache.get("k", "g").await.unwrap(), None);
        assert!(new.contains_key("test").await);
        assert!(new.get("test").await.unwrap().is_some());
    }
}
