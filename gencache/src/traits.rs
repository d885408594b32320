//! Backend connection trait definition.

use crate::error::CacheResult;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a conditional write (`add` / `replace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value was written.
    Stored,
    /// The condition did not hold: the key already existed (`add`) or was
    /// missing (`replace`).
    NotStored,
}

impl WriteOutcome {
    /// Whether the write took effect.
    pub fn is_stored(self) -> bool {
        matches!(self, WriteOutcome::Stored)
    }
}

/// A connection handle to one bucket of the key-value store.
///
/// Implementations own their node distribution, retries and timeouts.
/// Absence is reported through `Option`/`bool`/[`WriteOutcome`]; `Err` is
/// reserved for transport and protocol failures.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get a value.
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(value))` if the key exists, `Ok(None)` if not found,
    /// or an error if the operation fails.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a value unconditionally.
    ///
    /// # Arguments
    ///
    /// * `key` - The backend key
    /// * `value` - The payload
    /// * `ttl` - Optional time-to-live; `None` means no expiration
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Store a value only if the key does not exist yet.
    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> CacheResult<WriteOutcome>;

    /// Store a value only if the key already exists.
    async fn replace(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome>;

    /// Delete a key.
    ///
    /// # Returns
    ///
    /// Returns `Ok(true)` if an entry was removed, `Ok(false)` if the key was
    /// not present.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Atomically increment a numeric value.
    ///
    /// # Returns
    ///
    /// Returns the new value, or `None` if the key does not exist.
    async fn increment(&self, key: &str, offset: u64) -> CacheResult<Option<u64>>;

    /// Atomically decrement a numeric value, saturating at zero.
    ///
    /// # Returns
    ///
    /// Returns the new value, or `None` if the key does not exist.
    async fn decrement(&self, key: &str, offset: u64) -> CacheResult<Option<u64>>;

    /// Human-readable backend name used in logs.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Convert an optional TTL into a whole number of seconds, where zero means
/// "never expires". Sub-second remainders round up.
pub fn ttl_seconds(ttl: Option<Duration>) -> u64 {
    match ttl {
        None => 0,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 { secs + 1 } else { secs }
        }
    }
}
