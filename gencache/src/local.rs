//! Unit-of-work local cache.

use crate::key::ComposedKey;
use std::collections::HashMap;

/// Locally known state of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEntry {
    /// The key holds this payload.
    Found(String),
    /// The backend was asked and reported no value.
    Missing,
}

impl LocalEntry {
    /// Whether this is a positive entry.
    pub fn is_found(&self) -> bool {
        matches!(self, LocalEntry::Found(_))
    }

    /// Payload of a positive entry.
    pub fn value(&self) -> Option<&str> {
        match self {
            LocalEntry::Found(value) => Some(value),
            LocalEntry::Missing => None,
        }
    }

    fn footprint(&self) -> usize {
        self.value().map_or(0, str::len)
    }
}

/// Local coherency cache, partitioned by group.
///
/// Holds composed keys, so a token rotation naturally bypasses stale
/// entries. No eviction and no locking: one instance belongs to exactly one
/// unit of work.
#[derive(Debug, Default)]
pub struct LocalCache {
    groups: HashMap<String, HashMap<ComposedKey, LocalEntry>>,
}

impl LocalCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` means unknown, `Some(Missing)` a confirmed miss.
    pub fn get(&self, key: &ComposedKey, group: &str) -> Option<&LocalEntry> {
        self.groups.get(group)?.get(key)
    }

    /// Store or overwrite the entry for `key`.
    pub fn set(&mut self, key: ComposedKey, group: &str, entry: LocalEntry) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key, entry);
    }

    /// Whether a positive entry is present.
    pub fn is_found(&self, key: &ComposedKey, group: &str) -> bool {
        self.get(key, group).is_some_and(LocalEntry::is_found)
    }

    /// Forget one key, dropping its partition once empty.
    pub fn clear(&mut self, key: &ComposedKey, group: &str) {
        if let Some(entries) = self.groups.get_mut(group) {
            entries.remove(key);
            if entries.is_empty() {
                self.groups.remove(group);
            }
        }
    }

    /// Forget every entry of `group`.
    pub fn clear_group(&mut self, group: &str) {
        self.groups.remove(group);
    }

    /// Forget everything.
    pub fn clear_all(&mut self) {
        self.groups.clear();
    }

    /// Number of entries, negative ones included.
    pub fn len(&self) -> usize {
        self.groups.values().map(HashMap::len).sum()
    }

    /// Whether no entry is held.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Approximate memory held, in bytes of group names, keys and payloads.
    pub fn footprint(&self) -> usize {
        self.groups
            .iter()
            .map(|(group, entries)| {
                group.len()
                    + entries
                        .iter()
                        .map(|(key, entry)| key.as_str().len() + entry.footprint())
                        .sum::<usize>()
            })
            .sum()
    }
}
