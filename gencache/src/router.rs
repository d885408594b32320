//! Group-to-bucket routing.

use crate::config::{BackendKind, CacheConfig, DEFAULT_BUCKET, NodeAddress};
use crate::error::{CacheError, CacheResult};
use crate::traits::Backend;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace};

/// Shared handle to one bucket.
pub type BackendHandle = Arc<dyn Backend>;

/// Maps group names to bucket handles.
///
/// Groups without a bucket of their own (and groups whose name matches
/// nothing) go to the `"default"` bucket, which must always exist.
pub struct BackendRouter {
    buckets: RwLock<Buckets>,
}

struct Buckets {
    default: BackendHandle,
    named: HashMap<String, BackendHandle>,
}

impl Buckets {
    fn from_map(mut buckets: HashMap<String, BackendHandle>) -> CacheResult<Self> {
        let default = buckets
            .remove(DEFAULT_BUCKET)
            .ok_or(CacheError::MissingDefaultBucket)?;
        Ok(Self {
            default,
            named: buckets,
        })
    }
}

impl BackendRouter {
    /// Create a router whose only bucket is the default one.
    pub fn new(default: BackendHandle) -> Self {
        Self {
            buckets: RwLock::new(Buckets {
                default,
                named: HashMap::new(),
            }),
        }
    }

    /// Add a group-specific bucket. Naming it `"default"` replaces the
    /// default bucket.
    pub fn with_bucket(self, name: impl Into<String>, handle: BackendHandle) -> Self {
        let name = name.into();
        {
            let mut buckets = self.buckets.write();
            if name == DEFAULT_BUCKET {
                buckets.default = handle;
            } else {
                buckets.named.insert(name, handle);
            }
        }
        self
    }

    /// Create a router from a complete bucket map.
    pub fn from_buckets(buckets: HashMap<String, BackendHandle>) -> CacheResult<Self> {
        Ok(Self {
            buckets: RwLock::new(Buckets::from_map(buckets)?),
        })
    }

    /// Connect one backend per configured bucket.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gencache::{BackendRouter, CacheConfig};
    ///
    /// # async fn example() -> gencache::CacheResult<()> {
    /// let config = CacheConfig::from_env()?;
    /// let router = BackendRouter::connect(&config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;

        let mut buckets = HashMap::new();
        for (name, nodes) in config.buckets.iter() {
            let handle =
                connect_bucket(config.backend, name, nodes, config.operation_timeout).await?;
            buckets.insert(name.to_string(), handle);
        }

        info!(
            backend = %config.backend,
            buckets = buckets.len(),
            "Backend router ready"
        );

        Self::from_buckets(buckets)
    }

    /// Handle for `group`, falling back to the default bucket.
    pub fn bucket_for(&self, group: &str) -> BackendHandle {
        let buckets = self.buckets.read();
        match buckets.named.get(group) {
            Some(handle) => handle.clone(),
            None => {
                trace!(group, "No dedicated bucket, using default");
                buckets.default.clone()
            }
        }
    }

    /// Handle for the default bucket.
    pub fn default_bucket(&self) -> BackendHandle {
        self.buckets.read().default.clone()
    }

    /// Replace the whole bucket map. The current map is kept when the new
    /// one has no default bucket.
    pub fn reconfigure(&self, buckets: HashMap<String, BackendHandle>) -> CacheResult<()> {
        let buckets = Buckets::from_map(buckets)?;
        info!(buckets = buckets.named.len() + 1, "Reconfiguring backend router");
        *self.buckets.write() = buckets;
        Ok(())
    }

    /// Names of the configured buckets, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        let buckets = self.buckets.read();
        let mut names: Vec<String> = buckets.named.keys().cloned().collect();
        names.push(DEFAULT_BUCKET.to_string());
        names.sort();
        names
    }

    /// Whether `name` has a bucket of its own.
    pub fn has_bucket(&self, name: &str) -> bool {
        name == DEFAULT_BUCKET || self.buckets.read().named.contains_key(name)
    }
}

#[allow(unused_variables)]
async fn connect_bucket(
    kind: BackendKind,
    name: &str,
    nodes: &[NodeAddress],
    timeout: Option<Duration>,
) -> CacheResult<BackendHandle> {
    match kind {
        #[cfg(feature = "memcached")]
        BackendKind::Memcached => {
            let backend =
                crate::memcached_backend::MemcachedBackend::connect(name, nodes, timeout).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let backend = crate::redis_backend::RedisBackend::connect(name, nodes, timeout).await?;
            Ok(Arc::new(backend))
        }
        #[allow(unreachable_patterns)]
        other => Err(CacheError::Config(format!(
            "{} backend is not enabled in this build",
            other
        ))),
    }
}
