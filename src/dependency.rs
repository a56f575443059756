// Cache Dependency Graph

use crate::error::{CacheMeshError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Forward and reverse adjacency, always updated together
#[derive(Debug, Default)]
struct Graph {
    /// cache key -> keys it depends on
    forward: HashMap<String, HashSet<String>>,
    /// dependency key -> cache keys depending on it
    reverse: HashMap<String, HashSet<String>>,
}

impl Graph {
    fn insert(&mut self, cache_key: &str, dependency_key: &str) -> bool {
        let added = self
            .forward
            .entry(cache_key.to_string())
            .or_default()
            .insert(dependency_key.to_string());
        self.reverse
            .entry(dependency_key.to_string())
            .or_default()
            .insert(cache_key.to_string());
        added
    }
}

/// Graph statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStats {
    /// Cache keys with at least one dependency
    pub tracked_keys: usize,
    /// Dependency keys with at least one dependent
    pub dependency_keys: usize,
    /// Total edges
    pub edges: usize,
}

/// Tracks which cache keys depend on which underlying data keys.
///
/// Both directions of every edge live behind one lock, so a reader never
/// observes a forward edge without its reverse counterpart.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    graph: RwLock<Graph>,
}

impl DependencyResolver {
    /// Creates an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `cache_key` depends on `dependency_key`
    pub fn track_dependency(&self, cache_key: &str, dependency_key: &str) {
        if self.graph.write().insert(cache_key, dependency_key) {
            tracing::trace!(cache_key, dependency_key, "Tracked dependency");
        }
    }

    /// Records several dependencies of `cache_key` at once
    pub fn track_dependencies<I, S>(&self, cache_key: &str, dependency_keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut graph = self.graph.write();
        for dependency_key in dependency_keys {
            graph.insert(cache_key, dependency_key.as_ref());
        }
    }

    /// Cache keys directly depending on `dependency_key`.
    ///
    /// Read-only: the caller evicts the returned keys and calls
    /// [`untrack`](Self::untrack) once they are gone.
    pub fn invalidate_dependent_caches(&self, dependency_key: &str) -> HashSet<String> {
        let dependents = self.get_dependents(dependency_key);
        if !dependents.is_empty() {
            tracing::debug!(
                dependency_key,
                dependents = dependents.len(),
                "Resolved dependent caches"
            );
        }
        dependents
    }

    /// Every cache key reachable from `dependency_key` through dependent
    /// edges, excluding `dependency_key` itself. Cycles are visited once.
    pub fn cascade(&self, dependency_key: &str) -> HashSet<String> {
        let graph = self.graph.read();

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(dependency_key);

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = graph.reverse.get(current) {
                for dependent in dependents {
                    if dependent != dependency_key && visited.insert(dependent.clone()) {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        tracing::debug!(dependency_key, affected = visited.len(), "Cascade resolved");
        visited
    }

    /// Keys `cache_key` depends on
    pub fn get_dependencies(&self, cache_key: &str) -> HashSet<String> {
        self.graph
            .read()
            .forward
            .get(cache_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Cache keys directly depending on `dependency_key`
    pub fn get_dependents(&self, dependency_key: &str) -> HashSet<String> {
        self.graph
            .read()
            .reverse
            .get(dependency_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes every outgoing edge of `cache_key`, pruning reverse entries
    /// and dropping dependency keys left without dependents
    pub fn untrack(&self, cache_key: &str) {
        let mut graph = self.graph.write();
        let Some(dependencies) = graph.forward.remove(cache_key) else {
            return;
        };

        for dependency_key in &dependencies {
            if let Some(dependents) = graph.reverse.get_mut(dependency_key) {
                dependents.remove(cache_key);
                if dependents.is_empty() {
                    graph.reverse.remove(dependency_key);
                }
            }
        }
    }

    /// Checks that the reverse map is exactly the transpose of the forward map
    pub fn verify_consistency(&self) -> Result<()> {
        let graph = self.graph.read();

        for (cache_key, dependencies) in &graph.forward {
            for dependency_key in dependencies {
                let mirrored = graph
                    .reverse
                    .get(dependency_key)
                    .map_or(false, |dependents| dependents.contains(cache_key));
                if !mirrored {
                    return Err(CacheMeshError::GraphInconsistency(format!(
                        "{} -> {} missing from reverse map",
                        cache_key, dependency_key
                    )));
                }
            }
        }

        for (dependency_key, dependents) in &graph.reverse {
            if dependents.is_empty() {
                return Err(CacheMeshError::GraphInconsistency(format!(
                    "empty reverse entry for {}",
                    dependency_key
                )));
            }
            for cache_key in dependents {
                let mirrored = graph
                    .forward
                    .get(cache_key)
                    .map_or(false, |dependencies| dependencies.contains(dependency_key));
                if !mirrored {
                    return Err(CacheMeshError::GraphInconsistency(format!(
                        "{} <- {} missing from forward map",
                        dependency_key, cache_key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Drops every edge
    pub fn clear(&self) {
        let mut graph = self.graph.write();
        graph.forward.clear();
        graph.reverse.clear();
    }

    /// Graph statistics
    pub fn stats(&self) -> DependencyStats {
        let graph = self.graph.read();
        DependencyStats {
            tracked_keys: graph.forward.len(),
            dependency_keys: graph.reverse.len(),
            edges: graph.forward.values().map(HashSet::len).sum(),
        }
    }
}
