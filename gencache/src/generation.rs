//! Generation tokens.
//!
//! Every backend key embeds two tokens: the global token stored under the
//! bare prefix and the group token stored under `prefix:group`. Rotating a
//! token moves the whole scope to a fresh key space, which is how flushes
//! work without deleting anything. Entries written under an old token stay
//! in the store until the backend evicts them.

use crate::error::CacheResult;
use crate::router::BackendRouter;
use crate::traits::{Backend, WriteOutcome};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque identifier of one epoch of a scope.
///
/// Tokens are compared for identity only; they carry no order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationToken(String);

impl GenerationToken {
    /// Generate a fresh random token (upper-case hyphenated GUID).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string().to_uppercase())
    }

    /// Interpret a stored value as a token. Empty and whitespace-only values
    /// are not tokens.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw.to_string()))
        }
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Global,
    Group(&'a str),
}

/// Lazily created, process-cached generation tokens.
///
/// Shared by every unit of work of a [`crate::CacheContext`]. All token
/// traffic goes to the default bucket.
pub struct GenerationStore {
    router: Arc<BackendRouter>,
    prefix: String,
    global: RwLock<Option<GenerationToken>>,
    groups: RwLock<HashMap<String, GenerationToken>>,
    resets: Mutex<()>,
    remote_reads: AtomicU64,
    remote_writes: AtomicU64,
}

impl GenerationStore {
    /// Create a store that keeps its tokens under `prefix`.
    pub fn new(router: Arc<BackendRouter>, prefix: impl Into<String>) -> Self {
        Self {
            router,
            prefix: prefix.into(),
            global: RwLock::new(None),
            groups: RwLock::new(HashMap::new()),
            resets: Mutex::new(()),
            remote_reads: AtomicU64::new(0),
            remote_writes: AtomicU64::new(0),
        }
    }

    /// Key prefix, which is also the backend key of the global token.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current global token, read or created on first use.
    pub async fn global_token(&self) -> CacheResult<GenerationToken> {
        self.token(Scope::Global).await
    }

    /// Current token of `group`, read or created on first use.
    pub async fn group_token(&self, group: &str) -> CacheResult<GenerationToken> {
        self.token(Scope::Group(group)).await
    }

    /// Rotate the global token. Every group becomes unreachable under its
    /// old keys; group tokens are left as they are.
    pub async fn reset_global(&self) -> CacheResult<GenerationToken> {
        self.reset(Scope::Global).await
    }

    /// Rotate the token of one group.
    pub async fn reset_group(&self, group: &str) -> CacheResult<GenerationToken> {
        self.reset(Scope::Group(group)).await
    }

    /// Drop every cached token so the next access re-reads the backend.
    pub fn forget(&self) {
        *self.global.write() = None;
        self.groups.write().clear();
        debug!(prefix = %self.prefix, "Forgot cached generation tokens");
    }

    /// Cached global token, without touching the backend.
    pub fn cached_global(&self) -> Option<GenerationToken> {
        self.global.read().clone()
    }

    /// Cached token of `group`, without touching the backend.
    pub fn cached_group(&self, group: &str) -> Option<GenerationToken> {
        self.groups.read().get(group).cloned()
    }

    /// Token reads issued to the backend so far.
    pub fn remote_reads(&self) -> u64 {
        self.remote_reads.load(Ordering::Relaxed)
    }

    /// Token writes issued to the backend so far.
    pub fn remote_writes(&self) -> u64 {
        self.remote_writes.load(Ordering::Relaxed)
    }

    fn remote_key(&self, scope: Scope<'_>) -> String {
        match scope {
            Scope::Global => self.prefix.clone(),
            Scope::Group(group) => format!("{}:{}", self.prefix, group),
        }
    }

    fn cached(&self, scope: Scope<'_>) -> Option<GenerationToken> {
        match scope {
            Scope::Global => self.cached_global(),
            Scope::Group(group) => self.cached_group(group),
        }
    }

    /// Cache a token found or created on a cold path. A token cached by a
    /// concurrent caller in the meantime wins.
    fn remember(&self, scope: Scope<'_>, token: GenerationToken) -> GenerationToken {
        match scope {
            Scope::Global => self.global.write().get_or_insert(token).clone(),
            Scope::Group(group) => self
                .groups
                .write()
                .entry(group.to_string())
                .or_insert(token)
                .clone(),
        }
    }

    fn replace(&self, scope: Scope<'_>, token: GenerationToken) {
        match scope {
            Scope::Global => *self.global.write() = Some(token),
            Scope::Group(group) => {
                self.groups.write().insert(group.to_string(), token);
            }
        }
    }

    async fn token(&self, scope: Scope<'_>) -> CacheResult<GenerationToken> {
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }

        let backend = self.router.default_bucket();
        let key = self.remote_key(scope);

        self.remote_reads.fetch_add(1, Ordering::Relaxed);
        let token = match backend.get(&key).await? {
            Some(raw) => match GenerationToken::parse(&raw) {
                Some(token) => token,
                None => {
                    let token = GenerationToken::generate();
                    self.remote_writes.fetch_add(1, Ordering::Relaxed);
                    backend.set(&key, token.as_str(), None).await?;
                    debug!(key = %key, token = %token, "Replaced empty generation token");
                    token
                }
            },
            None => self.create(backend.as_ref(), &key).await?,
        };

        Ok(self.remember(scope, token))
    }

    async fn create(&self, backend: &dyn Backend, key: &str) -> CacheResult<GenerationToken> {
        let token = GenerationToken::generate();

        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        if backend.add(key, token.as_str(), None).await? == WriteOutcome::Stored {
            debug!(key, token = %token, "Created generation token");
            return Ok(token);
        }

        self.remote_reads.fetch_add(1, Ordering::Relaxed);
        let winner = backend.get(key).await?;
        match winner.as_deref().and_then(GenerationToken::parse) {
            Some(winner) => {
                warn!(key, token = %winner, "Generation token created concurrently, adopting it");
                Ok(winner)
            }
            None => {
                self.remote_writes.fetch_add(1, Ordering::Relaxed);
                backend.set(key, token.as_str(), None).await?;
                debug!(key, token = %token, "Created generation token");
                Ok(token)
            }
        }
    }

    async fn reset(&self, scope: Scope<'_>) -> CacheResult<GenerationToken> {
        let _guard = self.resets.lock().await;

        let token = GenerationToken::generate();
        let key = self.remote_key(scope);

        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.router
            .default_bucket()
            .set(&key, token.as_str(), None)
            .await?;

        self.replace(scope, token.clone());
        debug!(key = %key, token = %token, "Rotated generation token");

        Ok(token)
    }
}
