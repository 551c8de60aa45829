use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, trace};

use super::class::{Class, ClassSource};
use crate::error::ClassNotFound;
use crate::resource::ResourceProvider;

/// Order in which a loader consults its own resources and its delegates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelegationPolicy {
    /// Own resources first. Each application carries its own copy of a
    /// library without clashing with anybody else's.
    #[default]
    ChildFirst,
    /// Delegates first, own resources only as a fallback.
    ParentFirst,
}

/// Resource root class bytes are read from.
pub const DEFAULT_CLASS_ROOT: &str = "/classes";
/// Suffix appended to the class path.
pub const CLASS_EXTENSION: &str = ".class";

/// Loads classes from an application's [`ResourceProvider`] and falls back
/// to an ordered list of delegates.
///
/// Definitions are cached per name in a [`OnceCell`]; concurrent loads of the
/// same name block on that cell only, so every caller receives the same
/// `Arc<Class>`.
pub struct IsolatingClassLoader {
    name: String,
    resources: Arc<ResourceProvider>,
    policy: DelegationPolicy,
    delegates: Vec<Arc<dyn ClassSource>>,
    parent_first_prefixes: Vec<String>,
    class_root: String,
    defined: DashMap<String, Arc<OnceCell<Arc<Class>>>>,
    released: AtomicBool,
    /// Held shared while defining, exclusively while releasing.
    release_gate: RwLock<()>,
}

impl fmt::Debug for IsolatingClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatingClassLoader")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("delegates", &self.delegates.len())
            .field("defined", &self.defined.len())
            .finish()
    }
}

impl IsolatingClassLoader {
    pub fn builder(name: impl Into<String>, resources: Arc<ResourceProvider>) -> ClassLoaderBuilder {
        ClassLoaderBuilder {
            name: name.into(),
            resources,
            policy: DelegationPolicy::default(),
            delegates: Vec::new(),
            parent_first_prefixes: vec!["brrtcontainer.".to_string()],
            class_root: DEFAULT_CLASS_ROOT.to_string(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> DelegationPolicy {
        self.policy
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceProvider> {
        &self.resources
    }

    #[must_use]
    pub fn class_root(&self) -> &str {
        &self.class_root
    }

    /// Resource path a class name maps to, e.g. `app.Main` →
    /// `/classes/app/Main.class`. `None` for malformed names.
    #[must_use]
    pub fn resource_path(&self, class_name: &str) -> Option<String> {
        if class_name.is_empty()
            || class_name.contains(['/', '\\'])
            || class_name.split('.').any(str::is_empty)
        {
            return None;
        }
        Some(format!(
            "{}/{}{}",
            self.class_root,
            class_name.replace('.', "/"),
            CLASS_EXTENSION
        ))
    }

    /// Load a class by name following the configured policy.
    pub fn load_class(&self, name: &str) -> Result<Arc<Class>, ClassNotFound> {
        if self.released.load(Ordering::Acquire) {
            return Err(self.not_found(name));
        }

        let parent_first = self.policy == DelegationPolicy::ParentFirst
            || self
                .parent_first_prefixes
                .iter()
                .any(|p| name.starts_with(p.as_str()));

        let found = if parent_first {
            self.from_delegates(name).or_else(|| self.define_local(name))
        } else {
            self.define_local(name).or_else(|| self.from_delegates(name))
        };

        match found {
            Some(_) if self.is_released() => Err(self.not_found(name)),
            Some(class) => {
                trace!(
                    loader = %self.name,
                    class = %name,
                    defined_by = %class.defined_by(),
                    "Class loaded"
                );
                Ok(class)
            }
            None => {
                debug!(loader = %self.name, class = %name, "Class not found");
                Err(self.not_found(name))
            }
        }
    }

    /// The class if this loader has already defined it.
    #[must_use]
    pub fn find_loaded(&self, name: &str) -> Option<Arc<Class>> {
        self.defined
            .get(name)
            .and_then(|cell| cell.value().get().map(Arc::clone))
    }

    /// Names of every class this loader has defined, sorted.
    #[must_use]
    pub fn defined_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .defined
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Forget every definition and refuse further loads. Waits for
    /// definitions already under way, so none survives the release.
    pub fn release(&self) {
        let _gate = self.release_gate.write();
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let count = self.defined.len();
        self.defined.clear();
        info!(loader = %self.name, classes = count, "Class loader released");
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn define_local(&self, name: &str) -> Option<Arc<Class>> {
        let _gate = self.release_gate.read();
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        // Clone the cell out so no map shard is locked while defining.
        let cell = match self.defined.get(name) {
            Some(existing) => Arc::clone(existing.value()),
            None => Arc::clone(
                self.defined
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .value(),
            ),
        };

        let result = cell.get_or_try_init(|| {
            let path = self.resource_path(name).ok_or(())?;
            let resource = self.resources.resolve(&path).ok_or(())?;
            let bytes = resource.read_all().map_err(|err| {
                debug!(loader = %self.name, class = %name, error = %err, "Class bytes unreadable");
            })?;
            debug!(
                loader = %self.name,
                class = %name,
                store = %resource.store(),
                len = bytes.len(),
                "Class defined"
            );
            Ok::<_, ()>(Arc::new(Class::define(name, &self.name, bytes)))
        });

        match result {
            Ok(class) => Some(Arc::clone(class)),
            Err(()) => {
                self.defined
                    .remove_if(name, |_, cell| cell.get().is_none());
                None
            }
        }
    }

    fn from_delegates(&self, name: &str) -> Option<Arc<Class>> {
        self.delegates
            .iter()
            .find_map(|delegate| delegate.load_class(name).ok())
    }

    fn not_found(&self, name: &str) -> ClassNotFound {
        ClassNotFound {
            name: name.to_string(),
            loader: self.name.clone(),
        }
    }
}

impl ClassSource for IsolatingClassLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_class(&self, name: &str) -> Result<Arc<Class>, ClassNotFound> {
        IsolatingClassLoader::load_class(self, name)
    }
}

/// Configures an [`IsolatingClassLoader`].
pub struct ClassLoaderBuilder {
    name: String,
    resources: Arc<ResourceProvider>,
    policy: DelegationPolicy,
    delegates: Vec<Arc<dyn ClassSource>>,
    parent_first_prefixes: Vec<String>,
    class_root: String,
}

impl ClassLoaderBuilder {
    #[must_use]
    pub fn policy(mut self, policy: DelegationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Append a delegate. Delegates are consulted in the order added.
    #[must_use]
    pub fn delegate(mut self, delegate: Arc<dyn ClassSource>) -> Self {
        self.delegates.push(delegate);
        self
    }

    /// Names starting with `prefix` always go to the delegates first,
    /// whatever the policy.
    #[must_use]
    pub fn parent_first_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.parent_first_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn class_root(mut self, root: &str) -> Self {
        self.class_root = root.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn build(self) -> IsolatingClassLoader {
        IsolatingClassLoader {
            name: self.name,
            resources: self.resources,
            policy: self.policy,
            delegates: self.delegates,
            parent_first_prefixes: self.parent_first_prefixes,
            class_root: self.class_root,
            defined: DashMap::new(),
            released: AtomicBool::new(false),
            release_gate: RwLock::new(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryClassSource;
    use crate::resource::MemoryStore;

    fn loader(policy: DelegationPolicy) -> IsolatingClassLoader {
        let resources = Arc::new(
            ResourceProvider::builder()
                .memory(
                    MemoryStore::new("app.war")
                        .with_entry("/classes/lib/Json.class", "app-json")
                        .with_entry("/classes/app/Main.class", "main"),
                )
                .build(),
        );
        let shared: Arc<dyn ClassSource> = Arc::new(
            MemoryClassSource::new("shared")
                .with_class("lib.Json", "shared-json")
                .with_class("lib.Only", "shared-only"),
        );
        IsolatingClassLoader::builder("app", resources)
            .policy(policy)
            .delegate(shared)
            .build()
    }

    #[test]
    fn test_resource_path_mapping() {
        let l = loader(DelegationPolicy::ChildFirst);
        assert_eq!(
            l.resource_path("app.Main").as_deref(),
            Some("/classes/app/Main.class")
        );
        assert!(l.resource_path("app..Main").is_none());
        assert!(l.resource_path("../x").is_none());
    }

    #[test]
    fn test_child_first_prefers_own_copy() {
        let l = loader(DelegationPolicy::ChildFirst);
        let json = l.load_class("lib.Json").unwrap();
        assert_eq!(json.defined_by(), "app");
        assert_eq!(json.bytes(), b"app-json");
    }

    #[test]
    fn test_parent_first_prefers_delegate() {
        let l = loader(DelegationPolicy::ParentFirst);
        let json = l.load_class("lib.Json").unwrap();
        assert_eq!(json.defined_by(), "shared");
        assert_eq!(l.load_class("app.Main").unwrap().defined_by(), "app");
    }

    #[test]
    fn test_falls_back_to_delegate_then_fails() {
        let l = loader(DelegationPolicy::ChildFirst);
        assert_eq!(l.load_class("lib.Only").unwrap().defined_by(), "shared");
        let err = l.load_class("lib.Nope").unwrap_err();
        assert_eq!(err.loader, "app");
        assert!(l.find_loaded("lib.Nope").is_none());
    }

    #[test]
    fn test_define_once() {
        let l = loader(DelegationPolicy::ChildFirst);
        let a = l.load_class("app.Main").unwrap();
        let b = l.load_class("app.Main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(l.defined_classes(), vec!["app.Main".to_string()]);
    }

    #[test]
    fn test_release_refuses_further_loads() {
        let l = loader(DelegationPolicy::ChildFirst);
        l.load_class("app.Main").unwrap();
        l.release();
        assert!(l.load_class("app.Main").is_err());
        assert!(l.defined_classes().is_empty());
    }
}
