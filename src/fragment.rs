//! Composable cached fragments.
//!
//! Fragments are small rendered pieces (a price box, a navigation bar) cached
//! under their own keys. Larger artifacts are composed from them by literal
//! `{{name}}` substitution, and the composed output can itself be cached,
//! tagged with its fragments' tags and depending on their keys.

use crate::dependency::DependencyResolver;
use crate::error::Result;
use crate::store::KeyValueStore;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Namespace for fragment entries in the backing store.
const KEY_PREFIX: &str = "fragment:";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("valid placeholder pattern"))
}

/// A cached fragment as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentEntry {
    pub key: String,
    pub content: String,
    pub depends_on: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    /// Seconds to live, `0` for no expiry.
    pub ttl_seconds: i64,
}

/// Tag and key bookkeeping for every fragment written through this store.
#[derive(Debug, Default)]
struct TagIndex {
    key_tags: HashMap<String, BTreeSet<String>>,
    tag_keys: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    fn insert(&mut self, key: &str, tags: &BTreeSet<String>) {
        self.remove(key);
        for tag in tags {
            self.tag_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_tags.insert(key.to_string(), tags.clone());
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(tags) = self.key_tags.remove(key) else {
            return false;
        };
        for tag in &tags {
            if let Some(keys) = self.tag_keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_keys.remove(tag);
                }
            }
        }
        true
    }

    fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tag_keys
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Tag-indexed fragment cache with dependency tracking.
pub struct FragmentStore {
    store: Arc<dyn KeyValueStore>,
    resolver: Arc<DependencyResolver>,
    index: RwLock<TagIndex>,
}

impl FragmentStore {
    pub fn new(store: Arc<dyn KeyValueStore>, resolver: Arc<DependencyResolver>) -> Self {
        Self {
            store,
            resolver,
            index: RwLock::new(TagIndex::default()),
        }
    }

    /// Caches a fragment. `ttl` of `None` means no expiry.
    pub async fn cache_fragment<I, S>(
        &self,
        key: &str,
        content: impl Into<String>,
        ttl: Option<Duration>,
        tags: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_fragment_with_dependencies(key, content, ttl, tags, std::iter::empty::<String>())
            .await
    }

    /// Caches a fragment and records the data keys it was rendered from.
    pub async fn cache_fragment_with_dependencies<I, S, D, K>(
        &self,
        key: &str,
        content: impl Into<String>,
        ttl: Option<Duration>,
        tags: I,
        depends_on: D,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        D: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let entry = FragmentEntry {
            key: key.to_string(),
            content: content.into(),
            depends_on: depends_on.into_iter().map(Into::into).collect(),
            tags: tags.into_iter().map(Into::into).collect(),
            ttl_seconds: ttl.map_or(0, ttl_to_seconds),
        };
        self.write_entry(entry).await
    }

    async fn write_entry(&self, entry: FragmentEntry) -> Result<()> {
        let payload = serde_json::to_vec(&entry)?;
        self.store
            .put(&store_key(&entry.key), payload, entry.ttl_seconds)
            .await?;

        // Replace dependencies from any previous version
        self.resolver.untrack(&entry.key);
        self.resolver
            .track_dependencies(&entry.key, entry.depends_on.iter());
        self.index.write().insert(&entry.key, &entry.tags);

        tracing::debug!(
            key = %entry.key,
            tags = entry.tags.len(),
            dependencies = entry.depends_on.len(),
            "Cached fragment"
        );
        Ok(())
    }

    /// Loads a live fragment entry
    pub async fn get_entry(&self, key: &str) -> Result<Option<FragmentEntry>> {
        match self.store.get(&store_key(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => {
                // Expired or evicted behind our back
                if self.index.write().remove(key) {
                    self.resolver.untrack(key);
                }
                Ok(None)
            }
        }
    }

    /// Content of a live fragment
    pub async fn get_fragment(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.content))
    }

    /// Evicts one fragment. Returns whether it was cached.
    pub async fn invalidate_fragment(&self, key: &str) -> Result<bool> {
        let evicted = self.store.evict(&store_key(key)).await?;
        self.index.write().remove(key);
        self.resolver.untrack(key);
        if evicted {
            tracing::debug!(key, "Invalidated fragment");
        }
        Ok(evicted)
    }

    /// Evicts every fragment tagged `tag`. Returns the number evicted.
    pub async fn invalidate_fragments_by_tag(&self, tag: &str) -> Result<usize> {
        let keys = self.index.read().keys_for_tag(tag);
        let evicted = self.invalidate_all(keys).await?;
        tracing::info!(tag, evicted, "Invalidated fragments by tag");
        Ok(evicted)
    }

    /// Evicts every fragment that depends on `dependency_key`, directly or
    /// through other fragments. Returns the number evicted.
    pub async fn invalidate_fragments_by_dependency(&self, dependency_key: &str) -> Result<usize> {
        let affected = self.resolver.cascade(dependency_key);
        let keys: Vec<String> = {
            let index = self.index.read();
            affected
                .into_iter()
                .filter(|key| index.key_tags.contains_key(key))
                .collect()
        };
        let evicted = self.invalidate_all(keys).await?;
        tracing::info!(dependency_key, evicted, "Invalidated fragments by dependency");
        Ok(evicted)
    }

    async fn invalidate_all(&self, keys: Vec<String>) -> Result<usize> {
        let mut evicted = 0;
        for key in keys {
            if self.invalidate_fragment(&key).await? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Substitutes `{{placeholder}}` with the content of the mapped fragment.
    ///
    /// Missing fragments render as the empty string. Placeholders without a
    /// mapping are left untouched, and substituted content is never rescanned.
    pub async fn compose(&self, template: &str, placeholders: &[(&str, &str)]) -> Result<String> {
        let (rendered, _) = self.render(template, placeholders).await?;
        Ok(rendered)
    }

    /// Returns the cached composition under `key`, or composes and caches it.
    ///
    /// The composed entry carries the union of its fragments' tags and
    /// depends on the fragment keys, so invalidating any fragment (by key, tag
    /// or dependency) also reaches the composition.
    pub async fn compose_cached(
        &self,
        key: &str,
        template: &str,
        placeholders: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<String> {
        if let Some(cached) = self.get_fragment(key).await? {
            return Ok(cached);
        }

        let (rendered, used) = self.render(template, placeholders).await?;
        let tags: BTreeSet<String> = used
            .iter()
            .flat_map(|entry| entry.tags.iter().cloned())
            .collect();
        let depends_on: BTreeSet<String> = placeholders
            .iter()
            .map(|(_, fragment_key)| fragment_key.to_string())
            .collect();

        self.write_entry(FragmentEntry {
            key: key.to_string(),
            content: rendered.clone(),
            depends_on,
            tags,
            ttl_seconds: ttl.map_or(0, ttl_to_seconds),
        })
        .await?;
        Ok(rendered)
    }

    async fn render(
        &self,
        template: &str,
        placeholders: &[(&str, &str)],
    ) -> Result<(String, Vec<FragmentEntry>)> {
        let mut contents: HashMap<&str, String> = HashMap::with_capacity(placeholders.len());
        let mut used = Vec::new();
        for &(name, fragment_key) in placeholders {
            let content = match self.get_entry(fragment_key).await? {
                Some(entry) => {
                    let content = entry.content.clone();
                    used.push(entry);
                    content
                }
                None => {
                    tracing::debug!(fragment_key = %fragment_key, "Missing fragment rendered empty");
                    String::new()
                }
            };
            contents.insert(name, content);
        }

        let rendered = placeholder_pattern()
            .replace_all(template, |caps: &Captures<'_>| {
                let name = caps.get(1).map_or("", |m| m.as_str());
                match contents.get(name) {
                    Some(content) => content.clone(),
                    None => caps.get(0).map_or("", |m| m.as_str()).to_string(),
                }
            })
            .into_owned();

        Ok((rendered, used))
    }

    /// Number of fragments known to the index.
    pub fn len(&self) -> usize {
        self.index.read().key_tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn store_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

/// Rounds up so a sub-second TTL still expires rather than living forever.
fn ttl_to_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}
