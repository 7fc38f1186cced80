//! Tag Index
//!
//! Bidirectional tag ⇄ key index for group invalidation. Keeping the reverse
//! side lets a delete prune a key from every tag it belongs to, so records
//! never point at keys that were explicitly removed.
//!
//! Entries that simply expire in a tier are not pruned; deleting them again
//! through `delete_by_tag` is a no-op per tier.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

#[derive(Default)]
struct Inner {
    keys_by_tag: HashMap<String, HashSet<String>>,
    tags_by_key: HashMap<String, HashSet<String>>,
}

/// In-process tag index
#[derive(Default)]
pub struct TagIndex {
    inner: RwLock<Inner>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with each tag; repeated associations are deduplicated
    pub fn tag<I, S>(&self, key: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.write();
        for tag in tags {
            let tag = tag.as_ref();
            inner
                .keys_by_tag
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());
            inner
                .tags_by_key
                .entry(key.to_string())
                .or_default()
                .insert(tag.to_string());
        }
    }

    /// Keys recorded under `tag`, sorted for stable iteration
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        let mut keys: Vec<_> = self
            .inner
            .read()
            .keys_by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Tags `key` belongs to, sorted
    pub fn tags_for(&self, key: &str) -> Vec<String> {
        let mut tags: Vec<_> = self
            .inner
            .read()
            .tags_by_key
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.inner.read().keys_by_tag.contains_key(tag)
    }

    /// Drop `key` from every tag; tags left empty are removed
    pub fn remove_key(&self, key: &str) {
        let mut inner = self.inner.write();
        let Some(tags) = inner.tags_by_key.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = inner.keys_by_tag.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    inner.keys_by_tag.remove(&tag);
                }
            }
        }
    }

    /// Remove the tag record and return the keys it held
    pub fn remove_tag(&self, tag: &str) -> Vec<String> {
        let mut inner = self.inner.write();
        let Some(keys) = inner.keys_by_tag.remove(tag) else {
            return Vec::new();
        };
        for key in &keys {
            if let Some(tags) = inner.tags_by_key.get_mut(key) {
                tags.remove(tag);
                if tags.is_empty() {
                    inner.tags_by_key.remove(key);
                }
            }
        }
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys
    }

    /// Forget everything
    pub fn purge(&self) {
        let mut inner = self.inner.write();
        inner.keys_by_tag.clear();
        inner.tags_by_key.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.inner.read().keys_by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tag_count() == 0
    }
}
