//! # Application Descriptors
//!
//! An application described in YAML, TOML or JSON instead of code. The
//! format is picked by file extension.
//!
//! ```yaml
//! name: shop
//! context_path: /shop
//! delegation: child-first
//! resources:
//!   - kind: directory
//!     path: webapp
//!   - kind: alias
//!     mount: /docs
//!     path: /srv/shared-docs
//! handlers:
//!   - name: cart
//!     class: shop.CartHandler
//!     url_patterns: ["/cart/*"]
//!     load_on_startup: 1
//! middleware:
//!   - name: trace
//!     class: brrtcontainer.TracingMiddleware
//!     url_patterns: ["/*"]
//!     dispatch_kinds: [REQUEST, FORWARD]
//! error_pages:
//!   - status: 404
//!     location: /errors/missing.html
//!   - category: timeout
//!     location: /errors/slow
//! welcome_files: [index.html]
//! engine:
//!   max_dispatch_depth: 8
//! ```
//!
//! Relative resource paths are resolved against the descriptor's own
//! directory. [`ApplicationDescriptor::validate`] reports every problem it
//! finds, not just the first; class names are only resolved at start.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::{debug, info};

use crate::dispatcher::{
    Application, ApplicationBuilder, ConfigCallback, ErrorPageKey, Registrar,
};
use crate::error::ConfigError;
use crate::loader::{DelegationPolicy, Instantiator};
use crate::pipeline::ANY_HANDLER;
use crate::registry::{
    DispatchKind, DispatchKinds, HandlerRegistration, MiddlewareRegistration, UrlPattern,
};
use crate::resource::{normalize, DirectoryStore, ResourceProvider};
use crate::runtime_config::{EngineConfig, EngineOverrides};

/// One backing store of the application's resource provider, in lookup
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum StoreDescriptor {
    /// A directory tree served at the root.
    Directory { path: PathBuf },
    /// A directory tree mounted under `mount`.
    Alias { mount: String, path: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerDescriptor {
    pub name: String,
    pub class: String,
    pub url_patterns: Vec<String>,
    pub init_params: BTreeMap<String, String>,
    pub load_on_startup: Option<i32>,
    pub async_supported: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiddlewareDescriptor {
    pub name: String,
    pub class: String,
    pub url_patterns: Vec<String>,
    /// Handler names, or `*` for every handler.
    pub handler_names: Vec<String>,
    /// Empty means `REQUEST` only.
    pub dispatch_kinds: Vec<DispatchKind>,
    pub init_params: BTreeMap<String, String>,
    pub async_supported: bool,
}

/// `status` or `category`, never both; neither makes a default page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorPageDescriptor {
    pub status: Option<u16>,
    pub category: Option<String>,
    pub location: String,
}

impl ErrorPageDescriptor {
    fn key(&self) -> ErrorPageKey {
        match (&self.status, &self.category) {
            (Some(status), _) => ErrorPageKey::Status(*status),
            (None, Some(category)) => ErrorPageKey::Category(category.clone()),
            (None, None) => ErrorPageKey::Default,
        }
    }
}

fn default_serve_static() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationDescriptor {
    pub name: String,
    #[serde(default)]
    pub context_path: String,
    #[serde(default)]
    pub delegation: DelegationPolicy,
    #[serde(default)]
    pub resources: Vec<StoreDescriptor>,
    #[serde(default)]
    pub handlers: Vec<HandlerDescriptor>,
    #[serde(default)]
    pub middleware: Vec<MiddlewareDescriptor>,
    #[serde(default)]
    pub error_pages: Vec<ErrorPageDescriptor>,
    #[serde(default)]
    pub welcome_files: Vec<String>,
    #[serde(default)]
    pub engine: EngineOverrides,
    #[serde(default = "default_serve_static")]
    pub serve_static: bool,
    /// Directory relative resource paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl ApplicationDescriptor {
    /// Read and validate a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading descriptor {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let mut descriptor = match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content)?,
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => bail!(
                "unsupported descriptor format '{other}' for {}",
                path.display()
            ),
        };
        descriptor.base_dir = path.parent().map(Path::to_path_buf);
        descriptor.validate()?;
        debug!(app = %descriptor.name, path = %path.display(), "Descriptor loaded");
        Ok(descriptor)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Semantic checks the deserializer cannot make. Every issue found is
    /// reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push("application name is empty".to_string());
        }
        if !self.context_path.is_empty()
            && (self.context_path == "/"
                || normalize(&self.context_path).as_deref() != Some(self.context_path.as_str()))
        {
            issues.push(format!("invalid context path '{}'", self.context_path));
        }

        for store in &self.resources {
            if let StoreDescriptor::Alias { mount, .. } = store {
                if normalize(mount).is_none() {
                    issues.push(format!("invalid alias mount '{mount}'"));
                }
            }
        }

        let mut handler_names = HashSet::new();
        let mut claimed: HashMap<String, &str> = HashMap::new();
        for (i, handler) in self.handlers.iter().enumerate() {
            if handler.name.is_empty() {
                issues.push(format!("handler #{i} has no name"));
            } else if !handler_names.insert(handler.name.as_str()) {
                issues.push(format!("handler '{}' is declared twice", handler.name));
            }
            if handler.class.is_empty() {
                issues.push(format!("handler '{}' has no class", handler.name));
            }
            for raw in &handler.url_patterns {
                match UrlPattern::parse(raw) {
                    Err(e) => issues.push(format!("handler '{}': {e}", handler.name)),
                    Ok(pattern) => {
                        let key = pattern.to_string();
                        match claimed.get(&key) {
                            Some(owner) if *owner != handler.name => issues.push(format!(
                                "pattern '{key}' is claimed by both '{owner}' and '{}'",
                                handler.name
                            )),
                            _ => {
                                claimed.insert(key, &handler.name);
                            }
                        }
                    }
                }
            }
        }

        let mut middleware_names = HashSet::new();
        for (i, unit) in self.middleware.iter().enumerate() {
            if unit.name.is_empty() {
                issues.push(format!("middleware #{i} has no name"));
            } else if !middleware_names.insert(unit.name.as_str()) {
                issues.push(format!("middleware '{}' is declared twice", unit.name));
            }
            if unit.class.is_empty() {
                issues.push(format!("middleware '{}' has no class", unit.name));
            }
            if unit.url_patterns.is_empty() && unit.handler_names.is_empty() {
                issues.push(format!(
                    "middleware '{}' is bound to no pattern and no handler",
                    unit.name
                ));
            }
            for raw in &unit.url_patterns {
                if let Err(e) = UrlPattern::parse(raw) {
                    issues.push(format!("middleware '{}': {e}", unit.name));
                }
            }
            for target in &unit.handler_names {
                if target != ANY_HANDLER && !handler_names.contains(target.as_str()) {
                    issues.push(format!(
                        "middleware '{}' is bound to unknown handler '{target}'",
                        unit.name
                    ));
                }
            }
        }

        for page in &self.error_pages {
            if page.status.is_some() && page.category.is_some() {
                issues.push(format!(
                    "error page '{}' names both a status and a category",
                    page.location
                ));
            }
            if let Some(status) = page.status {
                if !(400..=599).contains(&status) {
                    issues.push(format!("error page status {status} is not an error status"));
                }
            }
            if !page.location.starts_with('/') || normalize(&page.location).is_none() {
                issues.push(format!("error page location '{}' is invalid", page.location));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Descriptor(issues))
        }
    }

    fn resolve_dir(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// The resource provider the descriptor's stores describe.
    pub fn resource_provider(&self, cache_size: usize) -> ResourceProvider {
        let mut builder = ResourceProvider::builder().cache_size(cache_size);
        for store in &self.resources {
            builder = match store {
                StoreDescriptor::Directory { path } => builder.directory(self.resolve_dir(path)),
                StoreDescriptor::Alias { mount, path } => {
                    builder.alias(mount, Arc::new(DirectoryStore::new(self.resolve_dir(path))))
                }
            };
        }
        builder.build()
    }

    /// A builder preloaded from the descriptor. Registrations are applied
    /// by a configuration callback during `initialize()`.
    pub fn to_builder(&self, instantiator: Instantiator) -> Result<ApplicationBuilder, ConfigError> {
        self.validate()?;
        let config = EngineConfig::from_env().with_overrides(&self.engine);
        Ok(Application::builder(self.name.clone())
            .context_path(self.context_path.clone())
            .config(config)
            .resources(self.resource_provider(config.resource_cache_size))
            .delegation_policy(self.delegation)
            .instantiator(instantiator)
            .serve_static(self.serve_static)
            .callback(DescriptorCallback {
                descriptor: self.clone(),
            }))
    }
}

/// Applies a descriptor's registrations during `initialize()`.
#[derive(Debug)]
struct DescriptorCallback {
    descriptor: ApplicationDescriptor,
}

impl ConfigCallback for DescriptorCallback {
    fn name(&self) -> &str {
        "descriptor"
    }

    fn on_startup(&self, registrar: &mut Registrar<'_>) -> anyhow::Result<()> {
        let d = &self.descriptor;
        for handler in &d.handlers {
            let mut registration = HandlerRegistration::class(&handler.name, &handler.class)
                .patterns(handler.url_patterns.iter().cloned())
                .async_supported(handler.async_supported);
            for (key, value) in &handler.init_params {
                registration = registration.init_param(key, value);
            }
            if let Some(order) = handler.load_on_startup {
                registration = registration.load_on_startup(order);
            }
            registrar.add_handler(registration)?;
        }

        for unit in &d.middleware {
            let mut registration = MiddlewareRegistration::class(&unit.name, &unit.class)
                .async_supported(unit.async_supported);
            for pattern in &unit.url_patterns {
                registration = registration.pattern(pattern);
            }
            for handler in &unit.handler_names {
                registration = registration.handler_name(handler);
            }
            if !unit.dispatch_kinds.is_empty() {
                let kinds = unit
                    .dispatch_kinds
                    .iter()
                    .fold(DispatchKinds::NONE, |acc, kind| acc.with(*kind));
                registration = registration.kinds(kinds);
            }
            for (key, value) in &unit.init_params {
                registration = registration.init_param(key, value);
            }
            registrar.add_middleware(registration)?;
        }

        for page in &d.error_pages {
            registrar.add_error_page(page.key(), page.location.clone());
        }
        for file in &d.welcome_files {
            registrar.add_welcome_file(file.clone());
        }
        info!(
            app = %registrar.application(),
            handlers = d.handlers.len(),
            middleware = d.middleware.len(),
            "Descriptor registrations applied"
        );
        Ok(())
    }
}

impl Application {
    /// Build an application from a descriptor. Class names are resolved
    /// through `instantiator` at start.
    pub fn from_descriptor(
        descriptor: &ApplicationDescriptor,
        instantiator: Instantiator,
    ) -> Result<Application, ConfigError> {
        descriptor.to_builder(instantiator)?.build()
    }
}
