//! Cache configuration types.

use crate::error::{CacheError, CacheResult};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Name of the bucket used when a group has no dedicated mapping.
pub const DEFAULT_BUCKET: &str = "default";

/// Key prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "default";

/// Memcached port used when an address omits one.
pub const DEFAULT_MEMCACHED_PORT: u16 = 11211;

/// Redis port used when an address omits one.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Cache backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Memcached backend
    #[default]
    Memcached,
    /// Redis backend
    Redis,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memcached => write!(f, "Memcached"),
            BackendKind::Redis => write!(f, "Redis"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "memcached" | "memcache" => Ok(BackendKind::Memcached),
            "redis" => Ok(BackendKind::Redis),
            other => Err(CacheError::Config(format!("Unknown backend kind: {}", other))),
        }
    }
}

/// Address of one physical node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeAddress {
    /// TCP node; `port` is `None` when the backend default applies.
    Tcp { host: String, port: Option<u16> },
    /// Unix domain socket path.
    Unix(String),
}

impl NodeAddress {
    /// Parse `host:port`, `host`, `[v6]:port` or `unix:///path`.
    ///
    /// A port of `0` selects the backend default, like an omitted port.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::config::NodeAddress;
    ///
    /// let addr = NodeAddress::parse("cache-1:11212").unwrap();
    /// assert_eq!(addr.to_string(), "cache-1:11212");
    ///
    /// let sock = NodeAddress::parse("unix:///var/run/memcached.sock").unwrap();
    /// assert_eq!(sock, NodeAddress::Unix("/var/run/memcached.sock".to_string()));
    /// ```
    pub fn parse(input: &str) -> CacheResult<Self> {
        let input = input.trim();

        if let Some(path) = input.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(CacheError::InvalidAddress(format!(
                    "Empty socket path in '{}'",
                    input
                )));
            }
            return Ok(NodeAddress::Unix(path.to_string()));
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                CacheError::InvalidAddress(format!("Unterminated IPv6 address: '{}'", input))
            })?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    CacheError::InvalidAddress(format!("Expected ':port' after ']' in '{}'", input))
                })?),
            };
            (host, port)
        } else {
            match input.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(CacheError::InvalidAddress(format!(
                "Missing host in '{}'. Expected format: 'host:port' or 'unix:///path'",
                input
            )));
        }

        let port = match port {
            None | Some("") => None,
            Some(port) => {
                let port: u16 = port.parse().map_err(|_| {
                    CacheError::InvalidAddress(format!("Invalid port '{}' in '{}'", port, input))
                })?;
                (port != 0).then_some(port)
            }
        };

        Ok(NodeAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Connection URL understood by the `memcache` crate.
    pub fn memcache_url(&self, timeout: Option<Duration>) -> String {
        let base = match self {
            NodeAddress::Tcp { host, port } => format!(
                "memcache://{}:{}",
                bracket_host(host),
                port.unwrap_or(DEFAULT_MEMCACHED_PORT)
            ),
            NodeAddress::Unix(path) => format!("memcache://{}", path),
        };

        match timeout {
            Some(timeout) => format!("{}?timeout={}", base, timeout.as_secs_f64()),
            None => base,
        }
    }

    /// Connection URL understood by the `redis` crate.
    pub fn redis_url(&self) -> String {
        match self {
            NodeAddress::Tcp { host, port } => format!(
                "redis://{}:{}/",
                bracket_host(host),
                port.unwrap_or(DEFAULT_REDIS_PORT)
            ),
            NodeAddress::Unix(path) => format!("redis+unix://{}", path),
        }
    }
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAddress::Tcp { host, port: Some(port) } => {
                write!(f, "{}:{}", bracket_host(host), port)
            }
            NodeAddress::Tcp { host, port: None } => write!(f, "{}", bracket_host(host)),
            NodeAddress::Unix(path) => write!(f, "unix://{}", path),
        }
    }
}

impl FromStr for NodeAddress {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        NodeAddress::parse(s)
    }
}

/// Mapping from bucket name to the nodes serving it.
///
/// Always contains a [`DEFAULT_BUCKET`] entry and never an empty node list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    buckets: BTreeMap<String, Vec<NodeAddress>>,
}

impl BucketConfig {
    /// Use every node for the single `"default"` bucket.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::config::BucketConfig;
    ///
    /// let buckets = BucketConfig::from_flat_list(["10.0.0.1:11211", "10.0.0.2"]).unwrap();
    /// assert_eq!(buckets.nodes("default").unwrap().len(), 2);
    /// ```
    pub fn from_flat_list<I, S>(nodes: I) -> CacheResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nodes = parse_nodes(nodes)?;
        let mut buckets = BTreeMap::new();
        buckets.insert(DEFAULT_BUCKET.to_string(), nodes);

        let config = Self { buckets };
        config.validate()?;
        Ok(config)
    }

    /// Named buckets; one of them must be `"default"`.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::config::BucketConfig;
    ///
    /// let buckets = BucketConfig::from_buckets([
    ///     ("default", vec!["10.0.0.1:11211"]),
    ///     ("sessions", vec!["10.0.0.9:11211"]),
    /// ])
    /// .unwrap();
    /// assert_eq!(buckets.names().count(), 2);
    /// ```
    pub fn from_buckets<I, K, N, S>(buckets: I) -> CacheResult<Self>
    where
        I: IntoIterator<Item = (K, N)>,
        K: Into<String>,
        N: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for (name, nodes) in buckets {
            map.insert(name.into(), parse_nodes(nodes)?);
        }

        let config = Self { buckets: map };
        config.validate()?;
        Ok(config)
    }

    /// Check the bucket invariants.
    pub fn validate(&self) -> CacheResult<()> {
        if !self.buckets.contains_key(DEFAULT_BUCKET) {
            return Err(CacheError::MissingDefaultBucket);
        }

        if let Some((name, _)) = self.buckets.iter().find(|(_, nodes)| nodes.is_empty()) {
            return Err(CacheError::EmptyBucket(name.clone()));
        }

        Ok(())
    }

    /// Nodes configured for a bucket.
    pub fn nodes(&self, bucket: &str) -> Option<&[NodeAddress]> {
        self.buckets.get(bucket).map(Vec::as_slice)
    }

    /// Configured bucket names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Iterate over `(bucket, nodes)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[NodeAddress])> {
        self.buckets
            .iter()
            .map(|(name, nodes)| (name.as_str(), nodes.as_slice()))
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(
            DEFAULT_BUCKET.to_string(),
            vec![NodeAddress::Tcp {
                host: "127.0.0.1".to_string(),
                port: Some(DEFAULT_MEMCACHED_PORT),
            }],
        );
        Self { buckets }
    }
}

fn parse_nodes<I, S>(nodes: I) -> CacheResult<Vec<NodeAddress>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    nodes
        .into_iter()
        .map(|node| NodeAddress::parse(node.as_ref()))
        .collect()
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of every backend key; also the key holding the global token
    pub prefix: String,

    /// Bucket map
    pub buckets: BucketConfig,

    /// Backend type used by [`crate::BackendRouter::connect`]
    pub backend: BackendKind,

    /// Groups that never reach the backend
    pub ignored_groups: BTreeSet<String>,

    /// Groups shared across sites
    pub global_groups: BTreeSet<String>,

    /// Current site identifier
    pub site: Option<String>,

    /// Whether the host serves several sites
    pub multisite: bool,

    /// Per-operation socket timeout
    pub operation_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            buckets: BucketConfig::default(),
            backend: BackendKind::default(),
            ignored_groups: BTreeSet::new(),
            global_groups: BTreeSet::new(),
            site: None,
            multisite: false,
            operation_timeout: None,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given key prefix.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::CacheConfig;
    ///
    /// let config = CacheConfig::new("shop").with_ignored_groups(["counts"]);
    /// assert_eq!(config.prefix, "shop");
    /// assert!(config.ignored_groups.contains("counts"));
    /// ```
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the bucket map.
    pub fn with_buckets(mut self, buckets: BucketConfig) -> Self {
        self.buckets = buckets;
        self
    }

    /// Set the backend type.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Add non-persistent groups.
    pub fn with_ignored_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Add global groups.
    pub fn with_global_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Set the current site and enable multi-site mode.
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self.multisite = true;
        self
    }

    /// Set the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> CacheResult<()> {
        if self.prefix.trim().is_empty() {
            return Err(CacheError::Config("Key prefix must not be empty".to_string()));
        }
        self.buckets.validate()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `GENCACHE_PREFIX` | key prefix |
    /// | `GENCACHE_SERVERS` | comma-separated nodes for the default bucket |
    /// | `GENCACHE_BUCKETS` | `name=node,node;name=node` |
    /// | `GENCACHE_BACKEND` | `memcached` or `redis` |
    /// | `GENCACHE_IGNORED_GROUPS` | comma-separated group names |
    /// | `GENCACHE_GLOBAL_GROUPS` | comma-separated group names |
    /// | `GENCACHE_SITE` | current site, enables multi-site |
    /// | `GENCACHE_TIMEOUT_MS` | per-operation timeout |
    pub fn from_env() -> CacheResult<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`] with a custom variable lookup.
    pub fn from_env_with<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("GENCACHE_PREFIX") {
            config.prefix = prefix;
        }

        match (lookup("GENCACHE_SERVERS"), lookup("GENCACHE_BUCKETS")) {
            (Some(_), Some(_)) => {
                return Err(CacheError::Config(
                    "GENCACHE_SERVERS and GENCACHE_BUCKETS are mutually exclusive".to_string(),
                ));
            }
            (Some(servers), None) => {
                config.buckets = BucketConfig::from_flat_list(split_list(&servers, ','))?;
            }
            (None, Some(buckets)) => {
                config.buckets = parse_bucket_spec(&buckets)?;
            }
            (None, None) => {}
        }

        if let Some(backend) = lookup("GENCACHE_BACKEND") {
            config.backend = backend.parse()?;
        }

        if let Some(groups) = lookup("GENCACHE_IGNORED_GROUPS") {
            config = config.with_ignored_groups(split_list(&groups, ','));
        }

        if let Some(groups) = lookup("GENCACHE_GLOBAL_GROUPS") {
            config = config.with_global_groups(split_list(&groups, ','));
        }

        if let Some(site) = lookup("GENCACHE_SITE") {
            config = config.with_site(site);
        }

        if let Some(timeout) = lookup("GENCACHE_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                CacheError::Config(format!("Invalid GENCACHE_TIMEOUT_MS: {}", timeout))
            })?;
            config.operation_timeout = Some(Duration::from_millis(millis));
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration document.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::CacheConfig;
    ///
    /// let config = CacheConfig::from_toml_str(r#"
    ///     prefix = "blog"
    ///     ignored_groups = ["counts"]
    ///
    ///     [buckets]
    ///     default = ["10.0.0.1:11211"]
    ///     sessions = ["10.0.0.2:11211"]
    /// "#).unwrap();
    ///
    /// assert_eq!(config.prefix, "blog");
    /// assert!(config.buckets.nodes("sessions").is_some());
    /// ```
    pub fn from_toml_str(content: &str) -> CacheResult<Self> {
        let file: FileConfig = toml::from_str(content)
            .map_err(|e| CacheError::Config(format!("TOML parse error: {}", e)))?;
        file.into_config()
    }

    /// Load a TOML configuration file.
    pub fn load_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}

/// On-disk configuration shape.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    prefix: Option<String>,
    backend: Option<String>,
    servers: Option<Vec<String>>,
    buckets: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    ignored_groups: Vec<String>,
    #[serde(default)]
    global_groups: Vec<String>,
    site: Option<String>,
    multisite: Option<bool>,
    timeout_ms: Option<u64>,
}

impl FileConfig {
    fn into_config(self) -> CacheResult<CacheConfig> {
        let mut config = CacheConfig::default();

        if let Some(prefix) = self.prefix {
            config.prefix = prefix;
        }

        config.buckets = match (self.servers, self.buckets) {
            (Some(_), Some(_)) => {
                return Err(CacheError::Config(
                    "'servers' and 'buckets' are mutually exclusive".to_string(),
                ));
            }
            (Some(servers), None) => BucketConfig::from_flat_list(servers)?,
            (None, Some(buckets)) => BucketConfig::from_buckets(buckets)?,
            (None, None) => BucketConfig::default(),
        };

        if let Some(backend) = self.backend {
            config.backend = backend.parse()?;
        }

        config = config
            .with_ignored_groups(self.ignored_groups)
            .with_global_groups(self.global_groups);

        if let Some(site) = self.site {
            config = config.with_site(site);
        }
        if let Some(multisite) = self.multisite {
            config.multisite = multisite;
        }

        config.operation_timeout = self.timeout_ms.map(Duration::from_millis);

        config.validate()?;
        Ok(config)
    }
}

fn split_list(input: &str, separator: char) -> Vec<String> {
    input
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bucket_spec(spec: &str) -> CacheResult<BucketConfig> {
    let mut buckets = Vec::new();

    for entry in split_list(spec, ';') {
        let (name, nodes) = entry.split_once('=').ok_or_else(|| {
            CacheError::Config(format!("Expected 'name=node,node' in bucket spec: {}", entry))
        })?;
        buckets.push((name.trim().to_string(), split_list(nodes, ',')));
    }

    BucketConfig::from_buckets(buckets)
}
