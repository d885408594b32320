//! Memcached backend.

use crate::config::NodeAddress;
use crate::error::{CacheError, CacheResult};
use crate::ring::HashRing;
use crate::traits::{Backend, WriteOutcome, ttl_seconds};
use async_trait::async_trait;
use futures::future::try_join_all;
use memcache::{ClientError, CommandError, MemcacheError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{info, trace};

/// Longest expiration memcached interprets as relative seconds; larger
/// values are read as absolute Unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

type Client = Arc<Mutex<memcache::Client>>;

/// Both connections to one memcached node.
///
/// Counters use the ASCII protocol. A binary `incr` from the `memcache`
/// crate always carries an expiration of 0, which tells the server to
/// create a missing key instead of reporting it.
#[derive(Clone)]
struct Node {
    store: Client,
    counters: Client,
}

/// Memcached bucket spanning one or more nodes.
///
/// Note: The `memcache` crate doesn't have native async support,
/// so each node client is wrapped with tokio's Mutex and driven through
/// spawn_blocking. Keys are placed on nodes with a [`HashRing`].
#[derive(Clone)]
pub struct MemcachedBackend {
    name: Arc<str>,
    nodes: Vec<Node>,
    labels: Vec<String>,
    ring: HashRing,
}

impl MemcachedBackend {
    /// Connect to every node of a bucket.
    ///
    /// # Arguments
    ///
    /// * `name` - Bucket name, used in logs and errors
    /// * `nodes` - Node addresses; must not be empty
    /// * `timeout` - Optional socket timeout per operation
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gencache::config::NodeAddress;
    /// use gencache::MemcachedBackend;
    ///
    /// # async fn example() -> gencache::CacheResult<()> {
    /// let nodes = vec![NodeAddress::parse("localhost:11211")?];
    /// let backend = MemcachedBackend::connect("default", &nodes, None).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(
        name: impl Into<String>,
        nodes: &[NodeAddress],
        timeout: Option<Duration>,
    ) -> CacheResult<Self> {
        let name: String = name.into();
        if nodes.is_empty() {
            return Err(CacheError::EmptyBucket(name));
        }

        let labels: Vec<String> = nodes.iter().map(ToString::to_string).collect();
        let clients = try_join_all(
            nodes
                .iter()
                .map(|node| Self::connect_node(node.memcache_url(timeout))),
        )
        .await?;

        info!(bucket = %name, nodes = labels.len(), "Connected to Memcached");

        Ok(Self {
            name: Arc::from(name),
            ring: HashRing::new(&labels),
            nodes: clients,
            labels,
        })
    }

    async fn connect_node(url: String) -> CacheResult<Node> {
        let counters_url = ascii_url(&url);
        let (store, counters) =
            futures::try_join!(Self::open(url), Self::open(counters_url))?;

        Ok(Node { store, counters })
    }

    async fn open(url: String) -> CacheResult<Client> {
        let target = url.clone();
        let client = tokio::task::spawn_blocking(move || memcache::connect(target.as_str()))
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to spawn task: {}", e)))?
            .map_err(|e| CacheError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        Ok(Arc::new(Mutex::new(client)))
    }

    /// Addresses of the nodes in this bucket.
    pub fn nodes(&self) -> &[String] {
        &self.labels
    }

    fn node_for(&self, key: &str) -> &Node {
        let index = self.ring.node_for(key).unwrap_or(0);
        trace!(bucket = %self.name, node = %self.labels[index], key, "Routing key");
        &self.nodes[index]
    }

    /// Run a blocking storage call on the node that owns `key`.
    async fn run<T, F>(&self, key: &str, op: F) -> CacheResult<Result<T, MemcacheError>>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client, &str) -> Result<T, MemcacheError> + Send + 'static,
    {
        let client = self.node_for(key).store.clone();
        Self::run_on(client, key, op).await
    }

    async fn run_on<T, F>(
        client: Client,
        key: &str,
        op: F,
    ) -> CacheResult<Result<T, MemcacheError>>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client, &str) -> Result<T, MemcacheError> + Send + 'static,
    {
        let key = key.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let client = client.blocking_lock();
            op(&client, &key)
        })
        .await?;

        Ok(result)
    }

    /// Convert a TTL to a memcached expiration value.
    fn expiration(ttl: Option<Duration>) -> u32 {
        let secs = ttl_seconds(ttl);
        if secs <= MAX_RELATIVE_EXPIRATION {
            return secs as u32;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        u32::try_from(now.saturating_add(secs)).unwrap_or(u32::MAX)
    }

    async fn adjust(&self, key: &str, offset: u64, up: bool) -> CacheResult<Option<u64>> {
        let client = self.node_for(key).counters.clone();
        let result = Self::run_on(client, key, move |client, key| {
            if up {
                client.increment(key, offset)
            } else {
                client.decrement(key, offset)
            }
        })
        .await?;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => Ok(None),
            Err(MemcacheError::ClientError(ClientError::Error(message)))
                if message.contains("non-numeric") =>
            {
                Err(CacheError::NonNumeric(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Same node, spoken to in the ASCII protocol.
fn ascii_url(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}protocol=ascii", url, separator)
}

#[async_trait]
impl Backend for MemcachedBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let value = self.run(key, |client, key| client.get::<String>(key)).await??;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let value = value.to_string();
        let expiration = Self::expiration(ttl);

        self.run(key, move |client, key| {
            client.set(key, value.as_str(), expiration)
        })
        .await??;

        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        let value = value.to_string();
        let expiration = Self::expiration(ttl);

        let result = self
            .run(key, move |client, key| {
                client.add(key, value.as_str(), expiration)
            })
            .await?;

        match result {
            Ok(()) => Ok(WriteOutcome::Stored),
            Err(MemcacheError::CommandError(CommandError::KeyExists)) => {
                Ok(WriteOutcome::NotStored)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        let value = value.to_string();
        let expiration = Self::expiration(ttl);

        let result = self
            .run(key, move |client, key| {
                client.replace(key, value.as_str(), expiration)
            })
            .await?;

        match result {
            Ok(()) => Ok(WriteOutcome::Stored),
            Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => {
                Ok(WriteOutcome::NotStored)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        match self.run(key, |client, key| client.delete(key)).await? {
            Ok(deleted) => Ok(deleted),
            Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => Ok(false),
            Err(e) => Err(e.into()),
        }
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
