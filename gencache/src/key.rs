//! Backend key composition.

use crate::error::CacheResult;
use crate::generation::{GenerationStore, GenerationToken};
use std::fmt;
use std::sync::Arc;

/// A fully qualified backend key:
/// `prefix:group:global_token:group_token:key` without any whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComposedKey(String);

impl ComposedKey {
    /// Compose a key from its parts.
    ///
    /// # Examples
    ///
    /// ```
    /// use gencache::{ComposedKey, GenerationToken};
    ///
    /// let global = GenerationToken::parse("G1").unwrap();
    /// let group = GenerationToken::parse("P1").unwrap();
    /// let key = ComposedKey::new("blog", "posts", &global, &group, "post 42");
    /// assert_eq!(key.as_str(), "blog:posts:G1:P1:post42");
    /// ```
    pub fn new(
        prefix: &str,
        group: &str,
        global: &GenerationToken,
        group_token: &GenerationToken,
        key: &str,
    ) -> Self {
        let raw = format!("{}:{}:{}:{}:{}", prefix, group, global, group_token, key);
        Self(raw.chars().filter(|c| !c.is_whitespace()).collect())
    }

    /// Key text as sent to the backend.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the key text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ComposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ComposedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds backend keys from the current generation tokens.
#[derive(Clone)]
pub struct KeyComposer {
    generations: Arc<GenerationStore>,
}

impl KeyComposer {
    /// Create a composer over a token store.
    pub fn new(generations: Arc<GenerationStore>) -> Self {
        Self { generations }
    }

    /// Compose the backend key of `key` in `group`, creating tokens that do
    /// not exist yet.
    pub async fn compose(&self, key: &str, group: &str) -> CacheResult<ComposedKey> {
        let global = self.generations.global_token().await?;
        let group_token = self.generations.group_token(group).await?;

        Ok(ComposedKey::new(
            self.generations.prefix(),
            group,
            &global,
            &group_token,
            key,
        ))
    }

    /// Token store behind this composer.
    pub fn generations(&self) -> &Arc<GenerationStore> {
        &self.generations
    }
}
