//! Redis backend.

use crate::config::NodeAddress;
use crate::error::{CacheError, CacheResult};
use crate::ring::HashRing;
use crate::traits::{Backend, WriteOutcome, ttl_seconds};
use async_trait::async_trait;
use futures::future::try_join_all;
use redis::{AsyncCommands, Client, RedisError, RedisResult, Script, aio::ConnectionManager};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace};

/// Counter update that refuses missing keys and stops decrements at zero.
///
/// KEYS[1] - counter key
/// ARGV[1] - offset
/// ARGV[2] - "incr" or "decr"
const COUNTER_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return false
end
local offset = tonumber(ARGV[1])
if ARGV[2] == 'incr' then
    return redis.call('INCRBY', KEYS[1], offset)
end
local value = tonumber(current)
if value == nil or value ~= math.floor(value) then
    return redis.error_reply('ERR value is not an integer or out of range')
end
if value <= offset then
    redis.call('SET', KEYS[1], '0', 'KEEPTTL')
    return 0
end
return redis.call('DECRBY', KEYS[1], offset)
"#;

/// Redis bucket spanning one or more nodes.
#[derive(Clone)]
pub struct RedisBackend {
    name: Arc<str>,
    nodes: Vec<ConnectionManager>,
    labels: Vec<String>,
    ring: HashRing,
    counter: Arc<Script>,
    timeout: Option<Duration>,
}

impl RedisBackend {
    /// Connect to every node of a bucket.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gencache::config::NodeAddress;
    /// use gencache::RedisBackend;
    ///
    /// # async fn example() -> gencache::CacheResult<()> {
    /// let nodes = vec![NodeAddress::parse("localhost:6379")?];
    /// let backend = RedisBackend::connect("default", &nodes, None).await?;
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
        let connections =
            try_join_all(nodes.iter().map(|node| Self::connect_node(node.redis_url()))).await?;

        info!(bucket = %name, nodes = labels.len(), "Connected to Redis");

        Ok(Self {
            name: Arc::from(name),
            ring: HashRing::new(&labels),
            nodes: connections,
            labels,
            counter: Arc::new(Script::new(COUNTER_SCRIPT)),
            timeout,
        })
    }

    async fn connect_node(url: String) -> CacheResult<ConnectionManager> {
        let client = Client::open(url.as_str())
            .map_err(|e| CacheError::Connection(format!("{}: {}", url, e)))?;

        ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to connect to {}: {}", url, e)))
    }

    /// Addresses of the nodes in this bucket.
    pub fn nodes(&self) -> &[String] {
        &self.labels
    }

    fn connection_for(&self, key: &str) -> ConnectionManager {
        let index = self.ring.node_for(key).unwrap_or(0);
        trace!(bucket = %self.name, node = %self.labels[index], key, "Routing key");
        self.nodes[index].clone()
    }

    async fn bounded<T, F>(&self, command: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command)
                .await
                .map_err(|_| {
                    CacheError::Connection(format!("{} timed out after {:?}", self.name, limit))
                })?
                .map_err(Into::into),
            None => command.await.map_err(Into::into),
        }
    }

    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        condition: &str,
    ) -> CacheResult<WriteOutcome> {
        let mut conn = self.connection_for(key);

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg(condition);
        let secs = ttl_seconds(ttl);
        if secs > 0 {
            cmd.arg("EX").arg(secs);
        }

        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(if reply.is_some() {
            WriteOutcome::Stored
        } else {
            WriteOutcome::NotStored
        })
    }

    async fn adjust(&self, key: &str, offset: u64, direction: &str) -> CacheResult<Option<u64>> {
        let mut conn = self.connection_for(key);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let result: CacheResult<Option<i64>> = self
            .bounded(
                self.counter
                    .key(key)
                    .arg(offset)
                    .arg(direction)
                    .invoke_async(&mut conn),
            )
            .await;

        match result {
            Ok(value) => Ok(value.map(|v| v.max(0) as u64)),
            Err(CacheError::Redis(e)) if is_not_integer(&e) => {
                Err(CacheError::NonNumeric(key.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

fn is_not_integer(error: &RedisError) -> bool {
    error.to_string().contains("not an integer")
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.connection_for(key);
        self.bounded(conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.connection_for(key);

        match ttl_seconds(ttl) {
            0 => self.bounded(conn.set::<_, _, ()>(key, value)).await,
            secs => self.bounded(conn.set_ex::<_, _, ()>(key, value, secs)).await,
        }
    }

    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        self.conditional_set(key, value, ttl, "NX").await
    }

    async fn replace(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<WriteOutcome> {
        self.conditional_set(key, value, ttl, "XX").await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection_for(key);
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, offset: u64) -> CacheResult<Option<u64>> {
        self.adjust(key, offset, "incr").await
    }

    async fn decrement(&self, key: &str, offset: u64) -> CacheResult<Option<u64>> {
        self.adjust(key, offset, "decr").await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
