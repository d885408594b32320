//! Generational invalidation cache layer.
//!
//! Sits in front of a sharded key-value store (Memcached or Redis) and
//! provides instant whole-cache and per-group flushes without deleting
//! anything: every backend key embeds a global and a per-group generation
//! token, and a flush simply rotates a token. A local cache scoped to one
//! unit of work remembers both hits and confirmed misses.
//!
//! # Features
//!
//! - `memcached` - Memcached backend (enabled by default)
//! - `memcached-tls` - Memcached over TLS (requires openssl)
//! - `redis` - Redis backend
//!
//! # Examples
//!
//! ## Connecting from configuration
//!
//! ```no_run
//! use gencache::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let config = CacheConfig::new("blog")
//!         .with_buckets(BucketConfig::from_flat_list(["10.0.0.1:11211", "10.0.0.2:11211"])?)
//!         .with_ignored_groups(["counts"]);
//!     let context = CacheContext::connect(&config).await?;
//!
//!     let mut cache = context.begin();
//!     cache.set("post:1", "posts", "hello", None).await?;
//!     cache.flush_group("posts").await?;
//!     assert_eq!(cache.get("post:1", "posts").await?, None);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Dedicated buckets per group
//!
//! ```
//! use gencache::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), CacheError> {
//! let sessions = MemoryBackend::named("sessions");
//! let router = BackendRouter::new(Arc::new(MemoryBackend::new()))
//!     .with_bucket("sessions", Arc::new(sessions.clone()));
//!
//! let context = CacheContext::new(Arc::new(router), &CacheConfig::new("app"))?;
//! let mut cache = context.begin();
//! cache.set("abc", "sessions", "user=1", None).await?;
//!
//! assert_eq!(sessions.len().await, 1);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod helpers;
pub mod key;
pub mod local;
pub mod memory;
pub mod ring;
pub mod router;
pub mod stats;
pub mod traits;

#[cfg(feature = "memcached")]
pub mod memcached_backend;

#[cfg(feature = "redis")]
pub mod redis_backend;

pub use cache::{CacheContext, Feature, ObjectCache};
pub use config::{BackendKind, BucketConfig, CacheConfig, NodeAddress};
pub use error::{CacheError, CacheResult};
pub use generation::{GenerationStore, GenerationToken};
pub use key::{ComposedKey, KeyComposer};
pub use local::{LocalCache, LocalEntry};
pub use memory::MemoryBackend;
pub use ring::HashRing;
pub use router::{BackendHandle, BackendRouter};
pub use stats::CacheStats;
pub use traits::{Backend, WriteOutcome};

#[cfg(feature = "memcached")]
pub use memcached_backend::MemcachedBackend;

#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheContext, Feature, ObjectCache};
    pub use crate::config::{BackendKind, BucketConfig, CacheConfig};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::memory::MemoryBackend;
    pub use crate::router::BackendRouter;
    pub use crate::traits::{Backend, WriteOutcome};

    #[cfg(feature = "memcached")]
    pub use crate::memcached_backend::MemcachedBackend;

    #[cfg(feature = "redis")]
    pub use crate::redis_backend::RedisBackend;
}
