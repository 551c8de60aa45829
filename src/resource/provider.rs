use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::path::normalize;
use super::store::{AliasStore, DirectoryStore, MemoryStore, Resource, ResourceStore};

/// Ordered view over one or more backing stores.
///
/// The first store that knows a path wins. Presence and absence are
/// remembered in a bounded LRU keyed by normalized path; the stores are
/// never mutated after the provider is assembled.
pub struct ResourceProvider {
    stores: Vec<Arc<dyn ResourceStore>>,
    /// normalized path -> index of the answering store, or `None` for absent
    cache: Option<Mutex<LruCache<String, Option<usize>>>>,
    released: AtomicBool,
}

impl fmt::Debug for ResourceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceProvider")
            .field("stores", &self.store_labels())
            .field("cached", &self.cache.is_some())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for ResourceProvider {
    fn default() -> Self {
        Self::empty()
    }
}

impl ResourceProvider {
    #[must_use]
    pub fn builder() -> ResourceProviderBuilder {
        ResourceProviderBuilder::default()
    }

    /// A provider that resolves nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            stores: Vec::new(),
            cache: None,
            released: AtomicBool::new(false),
        }
    }

    /// Resolve a logical path. Malformed or traversing paths are absent.
    pub fn resolve(&self, path: &str) -> Option<Resource> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        let Some(normalized) = normalize(path) else {
            warn!(path = %path, "Rejected resource path with traversal segments");
            return None;
        };

        if let Some(cache) = &self.cache {
            let hit = cache.lock().get(&normalized).copied();
            match hit {
                Some(None) => return None,
                Some(Some(idx)) => {
                    if let Some(found) = self.stores.get(idx).and_then(|s| s.resolve(&normalized)) {
                        return Some(found);
                    }
                    // The store changed underneath us; fall through to a full scan.
                }
                None => {}
            }
        }

        let mut answer = None;
        for (idx, store) in self.stores.iter().enumerate() {
            if let Some(found) = store.resolve(&normalized) {
                answer = Some((idx, found));
                break;
            }
        }

        if let Some(cache) = &self.cache {
            cache
                .lock()
                .put(normalized.clone(), answer.as_ref().map(|(idx, _)| *idx));
        }

        match answer {
            Some((_, found)) => {
                debug!(path = %normalized, store = %found.store(), "Resource resolved");
                Some(found)
            }
            None => {
                debug!(path = %normalized, "Resource not found");
                None
            }
        }
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// All logical paths, deduplicated, in store order. Each call rescans.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        if self.released.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for store in &self.stores {
            for path in store.list() {
                if seen.insert(path.clone()) {
                    out.push(path);
                }
            }
        }
        out
    }

    #[must_use]
    pub fn store_labels(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.label().to_string()).collect()
    }

    /// Drop cached lookups and stop answering. Called when the owning
    /// application is destroyed.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        debug!(stores = self.stores.len(), "Resource provider released");
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Assembles a [`ResourceProvider`]. Stores are consulted in the order they
/// are added.
#[derive(Default)]
pub struct ResourceProviderBuilder {
    stores: Vec<Arc<dyn ResourceStore>>,
    cache_size: usize,
}

impl ResourceProviderBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.stores.push(store);
        self
    }

    #[must_use]
    pub fn directory<P: Into<PathBuf>>(self, base: P) -> Self {
        self.store(Arc::new(DirectoryStore::new(base)))
    }

    #[must_use]
    pub fn memory(self, store: MemoryStore) -> Self {
        self.store(Arc::new(store))
    }

    /// Mount `inner` under `mount`.
    #[must_use]
    pub fn alias(self, mount: &str, inner: Arc<dyn ResourceStore>) -> Self {
        self.store(Arc::new(AliasStore::new(mount, inner)))
    }

    /// Presence cache capacity; `0` disables caching.
    #[must_use]
    pub fn cache_size(mut self, entries: usize) -> Self {
        self.cache_size = entries;
        self
    }

    #[must_use]
    pub fn build(self) -> ResourceProvider {
        let cache = NonZeroUsize::new(self.cache_size).map(|n| Mutex::new(LruCache::new(n)));
        ResourceProvider {
            stores: self.stores,
            cache,
            released: AtomicBool::new(false),
        }
    }
}
