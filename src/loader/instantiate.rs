use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::class::{Class, MemoryClassSource};
use crate::error::ConfigError;
use crate::handler::Handler;
use crate::middleware::{MetricsMiddleware, Middleware, TracingMiddleware};
use crate::static_files::StaticFiles;

/// Class name of the built-in static content handler.
pub const STATIC_FILES_CLASS: &str = "brrtcontainer.StaticFiles";
/// Class name of [`TracingMiddleware`].
pub const TRACING_CLASS: &str = "brrtcontainer.TracingMiddleware";
/// Class name of [`MetricsMiddleware`].
pub const METRICS_CLASS: &str = "brrtcontainer.MetricsMiddleware";

type HandlerFactory = dyn Fn(&Class) -> Arc<dyn Handler> + Send + Sync;
type MiddlewareFactory = dyn Fn(&Class) -> Arc<dyn Middleware> + Send + Sync;

/// Per-application factory table turning loaded classes into unit
/// instances.
///
/// A registration that names a class is resolved in two steps at start:
/// the application's loader finds the class (own resources or a delegate),
/// then the factory registered under the class name builds the instance.
/// The factory receives the loaded [`Class`] so the instance can depend on
/// whichever definition the loader picked.
#[derive(Clone, Default)]
pub struct Instantiator {
    handlers: HashMap<String, Arc<HandlerFactory>>,
    middleware: HashMap<String, Arc<MiddlewareFactory>>,
}

impl fmt::Debug for Instantiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        handlers.sort_unstable();
        let mut middleware: Vec<&str> = self.middleware.keys().map(String::as_str).collect();
        middleware.sort_unstable();
        f.debug_struct("Instantiator")
            .field("handlers", &handlers)
            .field("middleware", &middleware)
            .finish()
    }
}

impl Instantiator {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding factories for the engine's own units.
    pub fn with_builtins() -> Self {
        Self::new()
            .handler_factory(STATIC_FILES_CLASS, |_| Arc::new(StaticFiles::new()))
            .middleware_factory(TRACING_CLASS, |_| Arc::new(TracingMiddleware::new()))
            .middleware_factory(METRICS_CLASS, |_| Arc::new(MetricsMiddleware::new()))
    }

    #[must_use]
    pub fn handler_factory<F>(mut self, class_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Class) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.handlers.insert(class_name.into(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn middleware_factory<F>(mut self, class_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Class) -> Arc<dyn Middleware> + Send + Sync + 'static,
    {
        self.middleware.insert(class_name.into(), Arc::new(factory));
        self
    }

    pub fn handler(&self, class: &Class) -> Result<Arc<dyn Handler>, ConfigError> {
        let factory = self
            .handlers
            .get(class.name())
            .ok_or_else(|| ConfigError::UnknownFactory(class.name().to_string()))?;
        debug!(class = %class.name(), defined_by = %class.defined_by(), "Instantiating handler");
        Ok(factory(class))
    }

    pub fn middleware(&self, class: &Class) -> Result<Arc<dyn Middleware>, ConfigError> {
        let factory = self
            .middleware
            .get(class.name())
            .ok_or_else(|| ConfigError::UnknownFactory(class.name().to_string()))?;
        debug!(class = %class.name(), defined_by = %class.defined_by(), "Instantiating middleware");
        Ok(factory(class))
    }
}

/// The engine's class source: definitions for the built-in units, appended
/// as the last delegate of every application loader.
pub fn engine_classes() -> MemoryClassSource {
    MemoryClassSource::new("engine")
        .with_class(STATIC_FILES_CLASS, STATIC_FILES_CLASS.as_bytes())
        .with_class(TRACING_CLASS, TRACING_CLASS.as_bytes())
        .with_class(METRICS_CLASS, METRICS_CLASS.as_bytes())
}
