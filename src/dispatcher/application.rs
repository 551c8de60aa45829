use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::attributes::ApplicationAttributes;
use super::error_pages::{ErrorPageKey, ErrorPages};
use super::exchange::CancelToken;
use super::lifecycle::{
    CallbackDiscovery, ConfigCallback, DrainReport, InFlight, LifecycleEvent, LifecycleListener,
    LifecycleState, Registrar, StateCell,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, LifecycleError, UnitError};
use crate::handler::{Handler, UnitConfig};
use crate::loader::{
    engine_classes, ClassSource, DelegationPolicy, Instantiator, IsolatingClassLoader,
};
use crate::pipeline::{Pipeline, PipelineTable};
use crate::registry::{
    AvailabilityState, DispatchKind, HandlerRegistration, MiddlewareRegistration, Registry,
    Resolution, UnitSource, UrlMatcher,
};
use crate::resource::{normalize, ResourceProvider};
use crate::runtime_config::{DrainPolicy, EngineConfig};
use crate::static_files::StaticFiles;

/// Registration name of the built-in static content handler.
pub const STATIC_HANDLER: &str = "brrtcontainer.static";

/// Registrations collected before start.
#[derive(Debug, Default)]
struct Pending {
    registry: Registry,
    error_pages: ErrorPages,
    welcome_files: Vec<String>,
}

/// Immutable serving state built by `start()`.
pub(super) struct Runtime {
    pub(super) matcher: UrlMatcher,
    pub(super) table: PipelineTable,
    pub(super) error_pages: ErrorPages,
    pub(super) static_files: Option<(Arc<StaticFiles>, Arc<HandlerRegistration>)>,
}

/// Outcome of looking a path up in a started application.
pub(super) enum Lookup {
    Found(Resolution),
    Unavailable {
        handler: String,
        retry_after: Duration,
    },
    NotFound,
}

pub(super) struct AppInner {
    pub(super) name: String,
    pub(super) context_path: String,
    pub(super) config: EngineConfig,
    pub(super) state: StateCell,
    failed: AtomicBool,
    pending: Mutex<Option<Pending>>,
    pub(super) runtime: OnceCell<Runtime>,
    callbacks: Vec<Arc<dyn ConfigCallback>>,
    discovery: Vec<Arc<dyn CallbackDiscovery>>,
    executed: Mutex<Vec<Arc<dyn ConfigCallback>>>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    pub(super) attributes: ApplicationAttributes,
    pub(super) resources: Arc<ResourceProvider>,
    pub(super) loader: Arc<IsolatingClassLoader>,
    instantiator: Instantiator,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) in_flight: Arc<InFlight>,
    pub(super) cancel: CancelToken,
    serve_static: bool,
}

/// One hosted application: registrations, lifecycle, class loader,
/// resources and application-scoped attributes.
///
/// Cheap to clone; clones share the same application.
///
/// ```rust
/// use brrtcontainer::dispatcher::{Application, Exchange};
/// use brrtcontainer::handler::handler_fn;
/// use brrtcontainer::registry::HandlerRegistration;
/// use brrtcontainer::server::{CapturedResponse, HttpRequest};
///
/// let app = Application::builder("demo").build().unwrap();
/// app.add_handler(
///     HandlerRegistration::new("echo", handler_fn(|cx| {
///         cx.write_str("hello")?;
///         Ok(())
///     }))
///     .pattern("/echo"),
/// )
/// .unwrap();
/// app.initialize().unwrap();
/// app.start().unwrap();
///
/// let sink = CapturedResponse::new();
/// let exchange = Exchange::new(HttpRequest::get("/echo"), sink.response(1024));
/// let done = app.service(exchange).unwrap().wait().unwrap();
/// assert_eq!(done.status(), 200);
/// assert_eq!(sink.snapshot().body_str(), "hello");
/// ```
#[derive(Clone)]
pub struct Application {
    pub(super) inner: Arc<AppInner>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.inner.name)
            .field("context_path", &self.inner.context_path)
            .field("state", &self.state())
            .finish()
    }
}

impl Application {
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `""` for the root application, otherwise `/segment[/segment...]`.
    #[must_use]
    pub fn context_path(&self) -> &str {
        &self.inner.context_path
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn attributes(&self) -> &ApplicationAttributes {
        &self.inner.attributes
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceProvider> {
        &self.inner.resources
    }

    #[must_use]
    pub fn class_loader(&self) -> &Arc<IsolatingClassLoader> {
        &self.inner.loader
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Requests currently being served, suspended ones included.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.current()
    }

    /// Same application behind both handles.
    #[must_use]
    pub fn ptr_eq(&self, other: &Application) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- registration -------------------------------------------------

    fn with_pending<T>(
        &self,
        f: impl FnOnce(&mut Pending) -> Result<T, ConfigError>,
    ) -> Result<T, LifecycleError> {
        let state = self.state();
        if !state.accepts_registrations() {
            return Err(LifecycleError::Frozen(state));
        }
        let mut guard = self.inner.pending.lock();
        let pending = guard.as_mut().ok_or(LifecycleError::Frozen(state))?;
        Ok(f(pending)?)
    }

    pub fn add_handler(&self, registration: HandlerRegistration) -> Result<(), LifecycleError> {
        self.with_pending(|p| p.registry.add_handler(registration))
    }

    pub fn add_mapping(&self, handler_name: &str, pattern: &str) -> Result<(), LifecycleError> {
        self.with_pending(|p| p.registry.add_mapping(handler_name, pattern))
    }

    pub fn add_middleware(
        &self,
        registration: MiddlewareRegistration,
    ) -> Result<(), LifecycleError> {
        self.with_pending(|p| p.registry.add_middleware(registration))
    }

    pub fn add_error_page(
        &self,
        key: ErrorPageKey,
        location: impl Into<String>,
    ) -> Result<(), LifecycleError> {
        let location = location.into();
        self.with_pending(|p| {
            p.error_pages.insert(key, location);
            Ok(())
        })
    }

    pub fn add_welcome_file(&self, name: impl Into<String>) -> Result<(), LifecycleError> {
        let name = name.into();
        self.with_pending(|p| {
            p.welcome_files.push(name);
            Ok(())
        })
    }

    // ---- lifecycle ----------------------------------------------------

    fn notify(&self, event: LifecycleEvent) {
        for listener in &self.inner.listeners {
            listener.on_event(&self.inner.name, event);
        }
    }

    fn fail(&self, err: LifecycleError) -> LifecycleError {
        self.inner.failed.store(true, Ordering::Release);
        error!(app = %self.inner.name, error = %err, "Application failed to come up");
        err
    }

    /// `UNCONFIGURED → INITIALIZED`: run configuration callbacks in order,
    /// builder callbacks first, then discovered ones.
    pub fn initialize(&self) -> Result<(), LifecycleError> {
        if self.inner.failed.load(Ordering::Acquire) {
            return Err(LifecycleError::InitializationFailed(self.inner.name.clone()));
        }
        let state = self.state();
        if state != LifecycleState::Unconfigured {
            return Err(LifecycleError::InvalidTransition {
                from: state,
                to: LifecycleState::Initialized,
            });
        }
        let started = Instant::now();

        let mut callbacks = self.inner.callbacks.clone();
        for discovery in &self.inner.discovery {
            match discovery.discover() {
                Ok(found) => callbacks.extend(found),
                Err(source) => {
                    return Err(self.fail(LifecycleError::Callback {
                        name: "discovery".to_string(),
                        source,
                    }))
                }
            }
        }

        {
            let mut guard = self.inner.pending.lock();
            let pending = guard.as_mut().ok_or(LifecycleError::Frozen(state))?;
            let mut executed = self.inner.executed.lock();
            for callback in callbacks {
                let mut registrar = Registrar {
                    application: &self.inner.name,
                    registry: &mut pending.registry,
                    error_pages: &mut pending.error_pages,
                    welcome_files: &mut pending.welcome_files,
                };
                debug!(app = %self.inner.name, callback = %callback.name(), "Running configuration callback");
                if let Err(source) = callback.on_startup(&mut registrar) {
                    return Err(self.fail(LifecycleError::Callback {
                        name: callback.name().to_string(),
                        source,
                    }));
                }
                executed.push(callback);
            }
        }

        self.inner
            .state
            .advance(LifecycleState::Unconfigured, LifecycleState::Initialized)?;
        info!(
            app = %self.inner.name,
            duration_ms = started.elapsed().as_millis() as u64,
            "Application initialized"
        );
        self.notify(LifecycleEvent::Initialized);
        Ok(())
    }

    /// `INITIALIZED → STARTED`: freeze registrations, instantiate class
    /// units, build the matcher and pipeline table, initialize startup
    /// handlers and every processing unit.
    pub fn start(&self) -> Result<(), LifecycleError> {
        if self.inner.failed.load(Ordering::Acquire) {
            return Err(LifecycleError::InitializationFailed(self.inner.name.clone()));
        }
        let state = self.state();
        if state != LifecycleState::Initialized {
            return Err(LifecycleError::InvalidTransition {
                from: state,
                to: LifecycleState::Started,
            });
        }
        let started = Instant::now();
        let pending = self
            .inner
            .pending
            .lock()
            .take()
            .ok_or(LifecycleError::Frozen(state))?;

        let runtime = self.build_runtime(pending).map_err(|e| self.fail(e))?;
        let handlers = runtime.matcher.handlers().len();
        let units = runtime.table.units().len();
        if self.inner.runtime.set(runtime).is_err() {
            return Err(LifecycleError::Frozen(state));
        }

        self.inner
            .state
            .advance(LifecycleState::Initialized, LifecycleState::Started)?;
        info!(
            app = %self.inner.name,
            context_path = %self.inner.context_path,
            handlers,
            middleware = units,
            duration_ms = started.elapsed().as_millis() as u64,
            "Application started"
        );
        self.notify(LifecycleEvent::Started);
        Ok(())
    }

    fn build_runtime(&self, pending: Pending) -> Result<Runtime, LifecycleError> {
        let Pending {
            registry,
            error_pages,
            welcome_files,
        } = pending;
        let (handlers, middleware) = registry.into_parts();

        for handler in &handlers {
            match handler.source() {
                UnitSource::Instance(_) => handler.attach_declared_instance(),
                UnitSource::Class(class_name) => {
                    let class = self.inner.loader.load_class(class_name)?;
                    handler.attach(self.inner.instantiator.handler(&class)?);
                }
            }
        }
        for unit in &middleware {
            match unit.source() {
                UnitSource::Instance(_) => unit.attach_declared_instance(),
                UnitSource::Class(class_name) => {
                    let class = self.inner.loader.load_class(class_name)?;
                    unit.attach(self.inner.instantiator.middleware(&class)?);
                }
            }
        }

        let handlers: Vec<Arc<HandlerRegistration>> = handlers.into_iter().map(Arc::new).collect();
        let middleware: Vec<Arc<MiddlewareRegistration>> =
            middleware.into_iter().map(Arc::new).collect();

        // Ascending order, ties by registration order.
        let mut startup: Vec<(i32, usize)> = handlers
            .iter()
            .enumerate()
            .filter_map(|(idx, h)| h.startup_order().map(|order| (order, idx)))
            .collect();
        startup.sort_unstable();
        for (_, idx) in startup {
            let Some(handler) = handlers.get(idx) else {
                continue;
            };
            let config = self.unit_config(handler.name(), handler.init_params());
            match handler.ensure_initialized(&config, self.inner.clock.now()) {
                Ok(_) => {}
                Err(UnitError::Unavailable { retry_after }) => warn!(
                    app = %self.inner.name,
                    handler_name = %handler.name(),
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "Startup handler reported itself unavailable"
                ),
                Err(source) => {
                    return Err(LifecycleError::UnitStart {
                        name: handler.name().to_string(),
                        source: Box::new(source),
                    })
                }
            }
        }

        for unit in &middleware {
            let config = self.unit_config(unit.name(), unit.init_params());
            unit.initialize(&config)
                .map_err(|source| LifecycleError::UnitStart {
                    name: unit.name().to_string(),
                    source: Box::new(source),
                })?;
        }

        let static_files = self.inner.serve_static.then(|| {
            let files = Arc::new(
                StaticFiles::new()
                    .welcome_files(welcome_files)
                    .protect(format!("{}/", self.inner.loader.class_root()))
                    .protect("/META-INF/"),
            );
            let as_handler: Arc<dyn Handler> = Arc::clone(&files) as Arc<dyn Handler>;
            let registration =
                HandlerRegistration::from_arc(STATIC_HANDLER, as_handler).async_supported(true);
            registration.attach_declared_instance();
            (files, Arc::new(registration))
        });

        Ok(Runtime {
            matcher: UrlMatcher::new(handlers),
            table: PipelineTable::new(middleware),
            error_pages,
            static_files,
        })
    }

    /// `STARTED → STOPPED`. New `service` calls are refused from here on;
    /// in-flight ones are handled per the drain policy.
    pub fn stop(&self) -> Result<DrainReport, LifecycleError> {
        self.inner
            .state
            .advance(LifecycleState::Started, LifecycleState::Stopped)?;
        self.notify(LifecycleEvent::Stopping);
        let started = Instant::now();
        let policy = self.inner.config.drain_policy;
        let drained = match policy {
            DrainPolicy::Drain { timeout } => self.inner.in_flight.wait_idle(timeout),
            DrainPolicy::FailFast => {
                self.inner.cancel.cancel();
                self.inner.in_flight.current() == 0
            }
        };
        let report = DrainReport {
            policy,
            drained,
            remaining: self.inner.in_flight.current(),
            waited: started.elapsed(),
        };
        if report.drained {
            info!(app = %self.inner.name, waited_ms = report.waited.as_millis() as u64, "Application stopped");
        } else {
            warn!(
                app = %self.inner.name,
                remaining = report.remaining,
                policy = ?policy,
                "Application stopped with requests still in flight"
            );
        }
        self.notify(LifecycleEvent::Stopped);
        Ok(report)
    }

    /// Tear everything down. A started application is stopped first.
    pub fn destroy(&self) -> Result<(), LifecycleError> {
        if self.state() == LifecycleState::Started {
            self.stop()?;
        }
        let state = self.state();
        self.inner.state.advance(state, LifecycleState::Destroyed)?;

        if let Some(runtime) = self.inner.runtime.get() {
            for handler in runtime.matcher.handlers().iter().rev() {
                handler.destroy();
            }
            if let Some((_, registration)) = &runtime.static_files {
                registration.destroy();
            }
            for unit in runtime.table.units().iter().rev() {
                unit.destroy();
            }
        }
        let executed = std::mem::take(&mut *self.inner.executed.lock());
        for callback in executed.iter().rev() {
            callback.on_destroy();
        }
        self.inner.pending.lock().take();
        self.notify(LifecycleEvent::Destroyed);

        self.inner.loader.release();
        self.inner.resources.release();
        self.inner.attributes.clear();
        info!(app = %self.inner.name, "Application destroyed");
        Ok(())
    }

    // ---- runtime queries ----------------------------------------------

    pub(super) fn runtime(&self) -> Option<&Runtime> {
        self.inner.runtime.get()
    }

    pub(super) fn unit_config<'a>(
        &'a self,
        name: &'a str,
        params: &'a BTreeMap<String, String>,
    ) -> UnitConfig<'a> {
        UnitConfig {
            name,
            params,
            application: &self.inner.name,
            attributes: &self.inner.attributes,
            resources: &self.inner.resources,
        }
    }

    /// Handler lookup followed by the static content fallback.
    pub(super) fn lookup(&self, runtime: &Runtime, path: &str) -> Lookup {
        if let Some(resolution) = runtime.matcher.resolve(path) {
            return match resolution
                .handler
                .availability()
                .state(self.inner.clock.now())
            {
                AvailabilityState::Available => Lookup::Found(resolution),
                AvailabilityState::Unavailable { retry_after } => Lookup::Unavailable {
                    handler: resolution.handler_name().to_string(),
                    retry_after,
                },
                AvailabilityState::Permanent => Lookup::NotFound,
            };
        }
        if let Some((files, registration)) = &runtime.static_files {
            if files.find(&self.inner.resources, path).is_some() {
                debug!(path = %path, "Serving static resource");
                return Lookup::Found(Resolution::fallback(Arc::clone(registration), path));
            }
        }
        Lookup::NotFound
    }

    /// Application-relative form of a full request path, `None` when the
    /// path is malformed or outside this application's context path.
    #[must_use]
    pub fn relative_path(&self, raw: &str) -> Option<String> {
        let normalized = normalize(raw)?;
        let ctx = &self.inner.context_path;
        let rel = if ctx.is_empty() {
            normalized
        } else if normalized == *ctx {
            "/".to_string()
        } else {
            let rest = normalized.strip_prefix(ctx.as_str())?;
            if !rest.starts_with('/') {
                return None;
            }
            rest.to_string()
        };
        Some(keep_trailing_slash(raw, rel))
    }

    /// Resolve an application-relative path the way `service` would,
    /// without running anything.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Resolution> {
        let runtime = self.runtime()?;
        match self.lookup(runtime, path) {
            Lookup::Found(resolution) => Some(resolution),
            Lookup::Unavailable { .. } => runtime.matcher.resolve(path),
            Lookup::NotFound => None,
        }
    }

    /// The pipeline a dispatch of `kind` to `path` would run.
    #[must_use]
    pub fn pipeline(&self, path: &str, kind: DispatchKind) -> Option<Pipeline> {
        let runtime = self.runtime()?;
        let resolution = self.resolve(path)?;
        Some(runtime.table.build(&resolution, path, kind))
    }

    fn find_handler(&self, name: &str) -> Option<&Arc<HandlerRegistration>> {
        self.runtime()?
            .matcher
            .handlers()
            .iter()
            .find(|h| h.name() == name)
    }

    /// Mark a started handler unavailable for `duration`, or permanently
    /// for `None`. Returns `false` when no such handler exists.
    pub fn mark_unavailable(&self, handler_name: &str, duration: Option<Duration>) -> bool {
        let Some(handler) = self.find_handler(handler_name) else {
            return false;
        };
        handler
            .availability()
            .mark_unavailable(self.inner.clock.now(), duration);
        warn!(
            app = %self.inner.name,
            handler_name = %handler_name,
            duration_ms = duration.map(|d| d.as_millis() as u64),
            permanent = duration.is_none(),
            "Handler marked unavailable"
        );
        true
    }

    /// Clear a temporary unavailability mark.
    pub fn mark_available(&self, handler_name: &str) -> bool {
        let Some(handler) = self.find_handler(handler_name) else {
            return false;
        };
        handler.availability().mark_available();
        true
    }

    #[must_use]
    pub fn availability(&self, handler_name: &str) -> Option<AvailabilityState> {
        self.find_handler(handler_name)
            .map(|h| h.availability().state(self.inner.clock.now()))
    }
}

/// Normalized target keeping a trailing `/`, which marks a directory.
pub(super) fn normalize_target(raw: &str) -> Option<String> {
    let normalized = normalize(raw)?;
    Some(keep_trailing_slash(raw, normalized))
}

fn keep_trailing_slash(raw: &str, mut path: String) -> String {
    if raw.ends_with('/') && !path.ends_with('/') {
        path.push('/');
    }
    path
}

fn valid_context_path(path: &str) -> bool {
    path.is_empty() || (path != "/" && normalize(path).as_deref() == Some(path))
}

/// Builder for [`Application`].
pub struct ApplicationBuilder {
    name: String,
    context_path: String,
    config: EngineConfig,
    resources: Option<Arc<ResourceProvider>>,
    policy: DelegationPolicy,
    delegates: Vec<Arc<dyn ClassSource>>,
    instantiator: Instantiator,
    clock: Arc<dyn Clock>,
    callbacks: Vec<Arc<dyn ConfigCallback>>,
    discovery: Vec<Arc<dyn CallbackDiscovery>>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    serve_static: bool,
}

impl fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("name", &self.name)
            .field("context_path", &self.context_path)
            .field("policy", &self.policy)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ApplicationBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context_path: String::new(),
            config: EngineConfig::default(),
            resources: None,
            policy: DelegationPolicy::default(),
            delegates: Vec::new(),
            instantiator: Instantiator::with_builtins(),
            clock: Arc::new(SystemClock::new()),
            callbacks: Vec::new(),
            discovery: Vec::new(),
            listeners: Vec::new(),
            serve_static: true,
        }
    }

    #[must_use]
    pub fn context_path(mut self, path: impl Into<String>) -> Self {
        self.context_path = path.into();
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn resources(self, resources: ResourceProvider) -> Self {
        self.shared_resources(Arc::new(resources))
    }

    #[must_use]
    pub fn shared_resources(mut self, resources: Arc<ResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    #[must_use]
    pub fn delegation_policy(mut self, policy: DelegationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Parent class source, consulted in the order added.
    #[must_use]
    pub fn class_delegate(mut self, delegate: Arc<dyn ClassSource>) -> Self {
        self.delegates.push(delegate);
        self
    }

    #[must_use]
    pub fn instantiator(mut self, instantiator: Instantiator) -> Self {
        self.instantiator = instantiator;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn callback(mut self, callback: impl ConfigCallback) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn shared_callback(mut self, callback: Arc<dyn ConfigCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    #[must_use]
    pub fn discovery(mut self, discovery: impl CallbackDiscovery) -> Self {
        self.discovery.push(Arc::new(discovery));
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: impl LifecycleListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Turn the static content fallback off.
    #[must_use]
    pub fn serve_static(mut self, enabled: bool) -> Self {
        self.serve_static = enabled;
        self
    }

    pub fn build(self) -> Result<Application, ConfigError> {
        if !valid_context_path(&self.context_path) {
            return Err(ConfigError::InvalidContextPath(self.context_path));
        }
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(ResourceProvider::empty()));

        let mut loader = IsolatingClassLoader::builder(self.name.clone(), Arc::clone(&resources))
            .policy(self.policy);
        for delegate in self.delegates {
            loader = loader.delegate(delegate);
        }
        let engine: Arc<dyn ClassSource> = Arc::new(engine_classes());
        let loader = loader.delegate(engine).build();

        debug!(
            app = %self.name,
            context_path = %self.context_path,
            policy = ?self.policy,
            stores = ?resources.store_labels(),
            "Application built"
        );

        Ok(Application {
            inner: Arc::new(AppInner {
                name: self.name,
                context_path: self.context_path,
                config: self.config,
                state: StateCell::default(),
                failed: AtomicBool::new(false),
                pending: Mutex::new(Some(Pending::default())),
                runtime: OnceCell::new(),
                callbacks: self.callbacks,
                discovery: self.discovery,
                executed: Mutex::new(Vec::new()),
                listeners: self.listeners,
                attributes: ApplicationAttributes::new(),
                resources,
                loader: Arc::new(loader),
                instantiator: self.instantiator,
                clock: self.clock,
                in_flight: Arc::new(InFlight::default()),
                cancel: CancelToken::new(),
                serve_static: self.serve_static,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn app(ctx: &str) -> Application {
        Application::builder("t").context_path(ctx).build().unwrap()
    }

    #[test]
    fn test_context_path_validation() {
        assert!(Application::builder("a").context_path("/").build().is_err());
        assert!(Application::builder("a").context_path("shop").build().is_err());
        assert!(Application::builder("a").context_path("/shop/").build().is_err());
        assert!(Application::builder("a").context_path("/shop/v1").build().is_ok());
    }

    #[test]
    fn test_relative_path_strips_context_on_segment_boundary() {
        let a = app("/shop");
        assert_eq!(a.relative_path("/shop/items").as_deref(), Some("/items"));
        assert_eq!(a.relative_path("/shop").as_deref(), Some("/"));
        assert_eq!(a.relative_path("/shop/").as_deref(), Some("/"));
        assert_eq!(a.relative_path("/shop/docs/").as_deref(), Some("/docs/"));
        assert!(a.relative_path("/shopping").is_none());
        assert!(a.relative_path("/shop/../etc").is_none());
        assert_eq!(app("").relative_path("/x").as_deref(), Some("/x"));
    }

    #[test]
    fn test_registration_frozen_after_start() {
        let a = app("");
        a.add_handler(HandlerRegistration::new("h", handler_fn(|_| Ok(()))).pattern("/h"))
            .unwrap();
        a.initialize().unwrap();
        a.add_handler(HandlerRegistration::new("late", handler_fn(|_| Ok(()))).pattern("/late"))
            .unwrap();
        a.start().unwrap();
        let err = a
            .add_handler(HandlerRegistration::new("x", handler_fn(|_| Ok(()))))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Frozen(LifecycleState::Started)));
        assert!(a.resolve("/late").is_some());
    }

    #[test]
    fn test_start_requires_initialize() {
        let a = app("");
        assert!(matches!(
            a.start(),
            Err(LifecycleError::InvalidTransition {
                from: LifecycleState::Unconfigured,
                to: LifecycleState::Started
            })
        ));
    }
}
