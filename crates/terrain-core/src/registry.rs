use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::component::{Component, ComponentKind};
use crate::paths;

/// Thread-safe, path-keyed component registry.
///
/// The single piece of cross-phase shared mutable state. Guarantees one
/// `Component` instance per canonical path; `ensure` has single-writer-wins
/// semantics, and the `created` flag tells the caller whether it owns
/// context initialisation.
pub struct ComponentRegistry {
    components: DashMap<PathBuf, Arc<Component>>,
    relations_built: AtomicBool,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: DashMap::new(),
            relations_built: AtomicBool::new(false),
        }
    }

    /// Return the canonical instance for `path`, creating it when absent.
    /// The path is canonicalised before keying; `kind` and `config_file`
    /// only apply on creation.
    pub fn ensure(
        &self,
        path: &Path,
        kind: ComponentKind,
        config_file: &str,
    ) -> (Arc<Component>, bool) {
        let canonical = paths::canonicalize_lenient(path);
        let mut created = false;
        let component = self
            .components
            .entry(canonical.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Component::new(canonical, kind, config_file))
            })
            .clone();
        (component, created)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Component>> {
        let canonical = paths::canonicalize_lenient(path);
        self.components.get(&canonical).map(|c| c.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Component>> {
        self.components.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Set once the relationship phase has built reverse edges; the graph
    /// phase then walks `dependents` instead of the filesystem.
    pub fn mark_relations_built(&self) {
        self.relations_built.store(true, Ordering::Release);
    }

    pub fn relations_built(&self) -> bool {
        self.relations_built.load(Ordering::Acquire)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent string set with load-or-store semantics.
///
/// Backs the `seen` / `visited` / `checked_for_target` sets: `insert`
/// returns whether the key was new, which is the sole process-once
/// mechanism shared between workers within a phase.
#[derive(Default)]
pub struct StringSet {
    inner: DashMap<String, ()>,
}

impl StringSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key`, returning true when it was not present before.
    pub fn insert(&self, key: &str) -> bool {
        self.inner.insert(key.to_string(), ()).is_none()
    }

    pub fn insert_path(&self, path: &Path) -> bool {
        self.insert(&path.to_string_lossy())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
