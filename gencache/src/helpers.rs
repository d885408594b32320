//! Typed helpers over [`ObjectCache`].
//!
//! Values are stored as JSON payloads.

use crate::cache::ObjectCache;
use crate::error::{CacheError, CacheResult};
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::time::Duration;

/// Get a typed value from the cache.
pub async fn get<T: DeserializeOwned>(
    cache: &mut ObjectCache,
    key: &str,
    group: &str,
) -> CacheResult<Option<T>> {
    match cache.get(key, group).await? {
        Some(json) => decode(&json).map(Some),
        None => Ok(None),
    }
}

/// Set a typed value in the cache.
pub async fn set<T: Serialize>(
    cache: &mut ObjectCache,
    key: &str,
    group: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CacheResult<()> {
    let json = encode(value)?;
    cache.set(key, group, &json, ttl).await
}

/// Add a typed value if the key holds none.
pub async fn add<T: Serialize>(
    cache: &mut ObjectCache,
    key: &str,
    group: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CacheResult<bool> {
    let json = encode(value)?;
    cache.add(key, group, &json, ttl).await
}

/// Remember a value for a given duration.
///
/// If the key exists, returns the cached value.
/// If not, calls the factory function, caches the result, and returns it.
///
/// # Examples
///
/// ```
/// use gencache::{BackendRouter, CacheConfig, CacheContext, CacheResult, MemoryBackend, helpers};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> CacheResult<()> {
/// let router = Arc::new(BackendRouter::new(Arc::new(MemoryBackend::new())));
/// let context = CacheContext::new(router, &CacheConfig::new("shop"))?;
/// let mut cache = context.begin();
///
/// let total: u32 = helpers::remember(&mut cache, "total", "orders", Duration::from_secs(60), || async {
///     Ok(42)
/// }).await?;
/// assert_eq!(total, 42);
/// # Ok(())
/// # }
/// ```
pub async fn remember<T, F, Fut>(
    cache: &mut ObjectCache,
    key: &str,
    group: &str,
    ttl: Duration,
    factory: F,
) -> CacheResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
{
    if let Some(value) = get(cache, key, group).await? {
        return Ok(value);
    }

    let value = factory().await?;
    set(cache, key, group, &value, Some(ttl)).await?;
    Ok(value)
}

/// Remember a value forever (no TTL).
pub async fn remember_forever<T, F, Fut>(
    cache: &mut ObjectCache,
    key: &str,
    group: &str,
    factory: F,
) -> CacheResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
{
    if let Some(value) = get(cache, key, group).await? {
        return Ok(value);
    }

    let value = factory().await?;
    set(cache, key, group, &value, None).await?;
    Ok(value)
}

fn encode<T: Serialize>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(json: &str) -> CacheResult<T> {
    serde_json::from_str(json).map_err(|e| CacheError::Deserialization(e.to_string()))
}
