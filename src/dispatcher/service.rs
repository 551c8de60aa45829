//! The service driver: top-level dispatch, sub-dispatch, error dispatch and
//! the [`Dispatch`] handle units work through.

use std::any::Any;
use std::fmt;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::application::{normalize_target, Application, Lookup};
use super::async_support::{Action, AsyncContext, AsyncShared, RootState, Suspension};
use super::attributes::{keys, ApplicationAttributes};
use super::context::{DispatchStack, Entered, RequestContext};
use super::exchange::Exchange;
use super::lifecycle::LifecycleState;
use super::request_id::RequestId;
use crate::error::{DispatchError, UnitError};
use crate::loader::IsolatingClassLoader;
use crate::pipeline::Next;
use crate::registry::{DispatchKind, MatchKind};
use crate::resource::ResourceProvider;
use crate::server::{parse_query, split_target, status_reason, Headers};

/// How a `service` call ended.
#[derive(Debug)]
pub enum Outcome {
    /// The pipeline ran; `status` is what the response carries.
    Ok { status: u16 },
    /// Nothing matched and no static resource exists.
    NotFound,
    /// The matched handler is temporarily unavailable.
    Unavailable {
        handler: String,
        retry_after: Duration,
    },
    /// A unit failed; the response is a 500 or the mapped error page.
    ServerError { cause: UnitError },
    Cancelled,
    /// Error dispatch itself failed. The connection layer should treat the
    /// response as broken.
    Fatal { message: String },
}

impl Outcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ok { .. } => "ok",
            Outcome::NotFound => "not_found",
            Outcome::Unavailable { .. } => "unavailable",
            Outcome::ServerError { .. } => "server_error",
            Outcome::Cancelled => "cancelled",
            Outcome::Fatal { .. } => "fatal",
        }
    }
}

/// A finished `service` call.
#[derive(Debug)]
pub struct Completed {
    pub exchange: Exchange,
    pub outcome: Outcome,
    pub latency: Duration,
}

impl Completed {
    #[must_use]
    pub fn status(&self) -> u16 {
        self.exchange.response().status()
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.exchange.request_id()
    }
}

/// Result of handing an exchange to an application.
#[derive(Debug)]
pub enum Served {
    Complete(Completed),
    /// A unit started asynchronous processing; the request finishes when
    /// its [`AsyncContext`] is resumed, completed or cancelled.
    Suspended(Suspension),
}

impl Served {
    /// Block until the request is complete.
    pub fn wait(self) -> Result<Completed, DispatchError> {
        match self {
            Served::Complete(completed) => Ok(completed),
            Served::Suspended(suspension) => suspension.wait(),
        }
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Served::Suspended(_))
    }
}

/// Anything that accepts exchanges: one application or a host of them.
pub trait Service: Send + Sync {
    fn service(&self, exchange: Exchange) -> Result<Served, DispatchError>;
}

impl Service for Application {
    fn service(&self, exchange: Exchange) -> Result<Served, DispatchError> {
        Application::service(self, exchange)
    }
}

/// The per-call handle handlers and processing units work through.
///
/// Carries the exchange, the dispatch stack and the owning application.
/// Attribute writes made inside a forward or include stay in that
/// sub-dispatch's overlay and disappear when it returns.
pub struct Dispatch<'a> {
    app: &'a Application,
    pub(super) exchange: Exchange,
    pub(super) stack: DispatchStack,
    pub(super) suspended: Option<usize>,
    pub(super) async_shared: Option<Arc<AsyncShared>>,
}

impl fmt::Debug for Dispatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("app", &self.app.name())
            .field("exchange", &self.exchange)
            .field("stack", &self.stack.kinds())
            .field("suspended", &self.suspended)
            .finish()
    }
}

impl<'a> Dispatch<'a> {
    pub(super) fn new(app: &'a Application, exchange: Exchange) -> Self {
        Self {
            app,
            exchange,
            stack: DispatchStack::default(),
            suspended: None,
            async_shared: None,
        }
    }

    pub(super) fn resumed(
        app: &'a Application,
        exchange: Exchange,
        stack: DispatchStack,
        shared: Arc<AsyncShared>,
    ) -> Self {
        Self {
            app,
            exchange,
            stack,
            suspended: None,
            async_shared: Some(shared),
        }
    }

    // ---- request ------------------------------------------------------

    #[must_use]
    pub fn application(&self) -> &Application {
        self.app
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.exchange.request_id()
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        self.exchange.request().method()
    }

    /// Application-relative path of the current dispatch.
    #[must_use]
    pub fn path(&self) -> &str {
        self.stack.current().map_or("", RequestContext::path)
    }

    /// Path of the original request, context path included.
    #[must_use]
    pub fn request_uri(&self) -> &str {
        self.exchange.request().path()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.exchange.request().headers().get(name)
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        self.exchange.request().headers()
    }

    /// Query parameter, parameters from sub-dispatch targets first.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.stack.param_lookup(name).or_else(|| {
            self.exchange
                .query_params()
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        })
    }

    /// Every visible query parameter, shadowed names removed.
    #[must_use]
    pub fn query_params(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = Vec::new();
        let frame_params = self
            .stack
            .frames()
            .iter()
            .rev()
            .flat_map(|f| f.params.iter());
        for (k, v) in frame_params.chain(self.exchange.query_params().iter()) {
            if !out.iter().any(|(seen, _)| *seen == k.as_str()) {
                out.push((k, v));
            }
        }
        out
    }

    pub fn body(&mut self) -> &mut dyn Read {
        self.exchange.request_mut().body()
    }

    pub fn read_body(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.body().read_to_end(&mut buf)?;
        Ok(buf)
    }

    // ---- attributes ---------------------------------------------------

    /// Request attribute, looked up through sub-dispatch overlays first.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        match self.stack.overlay_lookup(key) {
            Some(found) => found,
            None => self.exchange.attribute(key),
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.stack.depth() > 1 {
            if let Some(frame) = self.stack.current_mut() {
                frame.overlay.insert(key, Some(value));
            }
            return;
        }
        if let Some(frame) = self.stack.current_mut() {
            frame.overlay.remove(&key);
        }
        self.exchange.set_attribute(key, value);
    }

    pub fn remove_attribute(&mut self, key: &str) {
        if self.stack.depth() > 1 {
            if let Some(frame) = self.stack.current_mut() {
                frame.overlay.insert(key.to_string(), None);
            }
            return;
        }
        if let Some(frame) = self.stack.current_mut() {
            frame.overlay.remove(key);
        }
        self.exchange.remove_attribute(key);
    }

    #[must_use]
    pub fn application_attributes(&self) -> &'a ApplicationAttributes {
        self.app.attributes()
    }

    #[must_use]
    pub fn resources(&self) -> &'a ResourceProvider {
        self.app.resources()
    }

    #[must_use]
    pub fn class_loader(&self) -> &'a IsolatingClassLoader {
        self.app.class_loader()
    }

    // ---- response -----------------------------------------------------

    #[must_use]
    pub fn status(&self) -> u16 {
        self.exchange.response().status()
    }

    /// Ignored during an include.
    pub fn set_status(&mut self, status: u16) {
        self.exchange.set_status(status);
    }

    /// Ignored during an include and once committed.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.exchange.set_header(name, value.into());
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.exchange.append_header(name, value.into());
    }

    #[must_use]
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.exchange.response().headers().get(name)
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.exchange.write(bytes)
    }

    pub fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.exchange.write(text.as_bytes())
    }

    /// Commit the response now.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.exchange.is_output_closed() {
            return Ok(());
        }
        self.exchange.response_mut().flush()
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.exchange.response().is_committed()
    }

    /// Replace the response with an error for `status`. The error page (or
    /// a minimal body) is produced once the pipeline returns.
    pub fn send_error(&mut self, status: u16, message: impl Into<String>) -> Result<(), UnitError> {
        if self.exchange.send_error(status, message.into()) {
            Ok(())
        } else {
            Err(DispatchError::AlreadyCommitted.into())
        }
    }

    // ---- dispatch state -----------------------------------------------

    #[must_use]
    pub fn dispatch_kind(&self) -> DispatchKind {
        self.stack
            .current()
            .map_or(DispatchKind::Request, RequestContext::dispatch_kind)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    #[must_use]
    pub fn handler_name(&self) -> &str {
        self.stack.current().map_or("", RequestContext::handler_name)
    }

    #[must_use]
    pub fn handler_path(&self) -> &str {
        self.stack.current().map_or("", RequestContext::handler_path)
    }

    #[must_use]
    pub fn path_info(&self) -> Option<&str> {
        self.stack.current().and_then(RequestContext::path_info)
    }

    #[must_use]
    pub fn match_kind(&self) -> Option<MatchKind> {
        self.stack.current().map(RequestContext::match_kind)
    }

    #[must_use]
    pub fn stack(&self) -> &DispatchStack {
        &self.stack
    }

    /// Cancelled by the connection layer or by a fail-fast stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.exchange.is_cancelled() || self.app.inner.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), UnitError> {
        if self.is_cancelled() {
            Err(UnitError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ---- sub-dispatch -------------------------------------------------

    /// Hand the request to another path. Uncommitted body bytes are
    /// discarded first; once the target returns the response is closed.
    pub fn forward(&mut self, target: &str) -> Result<(), UnitError> {
        self.sub_dispatch(DispatchKind::Forward, target)
    }

    /// Run another path's pipeline and append its body output.
    pub fn include(&mut self, target: &str) -> Result<(), UnitError> {
        self.sub_dispatch(DispatchKind::Include, target)
    }

    fn sub_dispatch(&mut self, kind: DispatchKind, target: &str) -> Result<(), UnitError> {
        let app = self.app;
        let max = app.inner.config.max_dispatch_depth;
        let depth = self.stack.depth() + 1;
        if depth > max {
            warn!(
                request_id = %self.request_id(),
                target = %target,
                depth,
                max,
                "Dispatch depth exceeded"
            );
            return Err(DispatchError::DepthExceeded { max }.into());
        }
        self.check_cancelled()?;

        let (raw_path, query) = split_target(target);
        let path = resolve_target(self.path(), raw_path)
            .ok_or_else(|| DispatchError::NotFound(target.to_string()))?;
        let runtime = app
            .runtime()
            .ok_or(DispatchError::NotStarted(app.state()))?;
        let resolution = match app.lookup(runtime, &path) {
            Lookup::Found(resolution) => resolution,
            Lookup::Unavailable {
                handler,
                retry_after,
            } => {
                return Err(DispatchError::Unavailable {
                    handler,
                    retry_after: Some(retry_after),
                }
                .into())
            }
            Lookup::NotFound => return Err(DispatchError::NotFound(path).into()),
        };

        if kind == DispatchKind::Forward {
            if self.exchange.response().is_committed() {
                return Err(DispatchError::AlreadyCommitted.into());
            }
            self.exchange.reset_buffer();
        }

        let pipeline = Arc::new(runtime.table.build(&resolution, &path, kind));
        let request_uri = format!("{}{}", app.context_path(), path);
        let mut frame = RequestContext::new(
            depth,
            kind,
            path,
            request_uri,
            query.map(str::to_string),
            resolution,
            pipeline,
        );
        if let Some(query) = query {
            frame.params = parse_query(query);
        }
        match kind {
            DispatchKind::Forward => {
                if let Some(root) = self.stack.root() {
                    insert_location(
                        &mut frame.overlay,
                        [
                            keys::FORWARD_REQUEST_URI,
                            keys::FORWARD_HANDLER_PATH,
                            keys::FORWARD_PATH_INFO,
                            keys::FORWARD_QUERY_STRING,
                        ],
                        root,
                    );
                }
            }
            DispatchKind::Include => {
                let own = location_values(&frame);
                for (key, value) in [
                    keys::INCLUDE_REQUEST_URI,
                    keys::INCLUDE_HANDLER_PATH,
                    keys::INCLUDE_PATH_INFO,
                    keys::INCLUDE_QUERY_STRING,
                ]
                .into_iter()
                .zip(own)
                {
                    frame.overlay.insert(key.to_string(), Some(value));
                }
                self.exchange.enter_include();
            }
            _ => {}
        }

        debug!(
            request_id = %self.request_id(),
            dispatch_kind = %kind,
            depth,
            path = %frame.path(),
            handler_name = %frame.handler_name(),
            "Sub-dispatch"
        );
        self.stack.push(frame);
        let result = self.run_from(0);
        self.pop_frame();

        match kind {
            DispatchKind::Include => self.exchange.leave_include(),
            DispatchKind::Forward => self.exchange.close_output(),
            _ => {}
        }
        result
    }

    // ---- async --------------------------------------------------------

    /// Suspend this request once the pipeline returns. Only allowed in the
    /// top-level dispatch, and only when the handler and every unit entered
    /// so far support it.
    pub fn start_async(&mut self) -> Result<AsyncContext, UnitError> {
        let frame = self
            .stack
            .current()
            .ok_or_else(|| not_async("no active dispatch"))?;
        if self.stack.depth() != 1
            || !matches!(
                frame.dispatch_kind(),
                DispatchKind::Request | DispatchKind::AsyncResume
            )
        {
            return Err(not_async(&format!(
                "cannot start async processing inside a {} dispatch",
                frame.dispatch_kind()
            )));
        }
        if let Some(unit) = frame.entered.iter().find(|e| !e.async_supported) {
            return Err(not_async(&format!(
                "processing unit '{}' does not support async processing",
                unit.name
            )));
        }
        if !frame.pipeline.handler().is_async_supported() {
            return Err(not_async(&format!(
                "handler '{}' does not support async processing",
                frame.handler_name()
            )));
        }
        if self.suspended.is_some() {
            return Err(not_async("async processing already started"));
        }
        let position = frame.position;

        let shared = match &self.async_shared {
            Some(shared) => {
                shared.rearm();
                Arc::clone(shared)
            }
            None => {
                let shared = Arc::new(AsyncShared::new());
                self.async_shared = Some(Arc::clone(&shared));
                shared
            }
        };
        self.suspended = Some(position);
        debug!(request_id = %self.request_id(), position, "Async processing started");
        Ok(AsyncContext::new(self.app.clone(), shared, self.request_id()))
    }

    #[must_use]
    pub fn is_async_started(&self) -> bool {
        self.suspended.is_some()
    }

    // ---- driver -------------------------------------------------------

    pub(crate) fn proceed(&mut self, next: Next) -> Result<(), UnitError> {
        if next.depth() != self.stack.depth() {
            return Err(UnitError::failed(
                "pipeline",
                "next was invoked outside the dispatch that created it",
            ));
        }
        self.run_from(next.position())
    }

    /// Run the current frame's pipeline from `position`.
    pub(super) fn run_from(&mut self, position: usize) -> Result<(), UnitError> {
        self.check_cancelled()?;
        let app = self.app;
        let depth = self.stack.depth();
        let frame = self
            .stack
            .current_mut()
            .ok_or_else(|| UnitError::failed("pipeline", "no active dispatch"))?;
        frame.position = position;
        let pipeline = Arc::clone(&frame.pipeline);

        if let Some(registration) = pipeline.unit(position) {
            let unit = registration.instance()?;
            if !frame.entered.iter().any(|e| e.position == position) {
                frame.entered.push(Entered {
                    position,
                    name: registration.name().to_string(),
                    unit: Arc::clone(&unit),
                    async_supported: registration.is_async_supported(),
                    started: Instant::now(),
                });
            }
            let result = unit.handle(self, Next::new(position + 1, depth));
            // Downstream stages moved the cursor; point it back at this unit.
            if self.stack.depth() == depth {
                if let Some(frame) = self.stack.current_mut() {
                    frame.position = position;
                }
            }
            return result;
        }

        let registration = Arc::clone(pipeline.handler());
        let config = app.unit_config(registration.name(), registration.init_params());
        let handler = registration.ensure_initialized(&config, app.inner.clock.now())?;
        let result = handler.service(self);
        if let Err(UnitError::Unavailable { retry_after }) = &result {
            registration
                .availability()
                .mark_unavailable(app.inner.clock.now(), *retry_after);
            warn!(
                request_id = %self.request_id(),
                handler_name = %registration.name(),
                permanent = retry_after.is_none(),
                "Handler reported itself unavailable"
            );
        }
        result
    }

    /// [`run_from`](Self::run_from) with panics turned into faults. Frames
    /// the panic skipped are torn down here.
    pub(super) fn run_guarded(&mut self, position: usize) -> Result<(), UnitError> {
        let base = self.stack.depth();
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_from(position))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let backtrace = std::backtrace::Backtrace::capture();
                error!(
                    request_id = %self.request_id(),
                    handler_name = %self.handler_name(),
                    panic_message = %message,
                    backtrace = %backtrace,
                    "Unit panicked - CRITICAL"
                );
                while self.stack.depth() > base {
                    self.pop_frame();
                }
                self.exchange.reopen();
                Err(UnitError::failed("panic", message))
            }
        }
    }

    /// Run teardown hooks of the current frame, most recent first.
    pub(super) fn teardown_current(&mut self) {
        let entered = match self.stack.current_mut() {
            Some(frame) => std::mem::take(&mut frame.entered),
            None => return,
        };
        for unit in entered.into_iter().rev() {
            unit.unit.after(self, unit.started.elapsed());
        }
    }

    pub(super) fn pop_frame(&mut self) -> Option<RequestContext> {
        self.teardown_current();
        self.stack.pop()
    }

    /// Resume, complete or cancel a suspended root frame.
    pub(super) fn apply(&mut self, action: Action, position: usize) -> Result<(), UnitError> {
        match action {
            Action::Resume(value) => {
                if let Some((key, value)) = value {
                    self.exchange.set_attribute(key, value);
                }
                if let Some(frame) = self.stack.current_mut() {
                    frame.set_dispatch_kind(DispatchKind::AsyncResume);
                }
                debug!(request_id = %self.request_id(), position, "Resuming suspended request");
                self.run_guarded(position)
            }
            Action::Complete => Ok(()),
            Action::Cancel => Err(UnitError::Cancelled),
        }
    }

    /// Pop the root frame and turn the pipeline result into an outcome,
    /// running error dispatch where needed.
    ///
    /// Teardown hooks of the root frame run last, so they observe the final
    /// status.
    pub(super) fn complete_root(&mut self, result: Result<(), UnitError>) -> Outcome {
        let handler_name = self.handler_name().to_string();
        let path = self.path().to_string();
        let root = self.stack.pop();
        let outcome = self.outcome_for(result, &handler_name, &path);
        if let Some(root) = root {
            self.stack.push(root);
            self.pop_frame();
        }
        outcome
    }

    fn outcome_for(
        &mut self,
        result: Result<(), UnitError>,
        handler_name: &str,
        path: &str,
    ) -> Outcome {
        match result {
            Ok(()) => match self.exchange.take_error() {
                Some(err) => self.error_response(
                    err.status,
                    &err.message,
                    None,
                    Some(handler_name),
                    Outcome::Ok { status: err.status },
                ),
                None => Outcome::Ok {
                    status: self.status(),
                },
            },
            Err(UnitError::Cancelled) => {
                info!(request_id = %self.request_id(), path = %path, "Request cancelled");
                Outcome::Cancelled
            }
            Err(UnitError::Unavailable {
                retry_after: Some(retry_after),
            }) => self.unavailable(handler_name, retry_after),
            Err(UnitError::Unavailable { retry_after: None }) => self.not_found(path),
            Err(cause) => {
                error!(
                    request_id = %self.request_id(),
                    handler_name = %handler_name,
                    category = %cause.category(),
                    error = %cause,
                    "Dispatch failed"
                );
                if matches!(
                    cause.dispatch_error(),
                    Some(DispatchError::DepthExceeded { .. })
                ) {
                    self.exchange.reopen();
                    if !self.is_committed() {
                        self.exchange.reset_buffer();
                        self.exchange.set_status(500);
                        self.write_minimal(500);
                    }
                    return Outcome::ServerError { cause };
                }
                let message = cause.to_string();
                let category = cause.category().to_string();
                self.error_response(
                    500,
                    &message,
                    Some(&category),
                    Some(handler_name),
                    Outcome::ServerError { cause },
                )
            }
        }
    }

    pub(super) fn not_found(&mut self, path: &str) -> Outcome {
        let message = format!("no handler or resource for '{path}'");
        self.error_response(404, &message, None, None, Outcome::NotFound)
    }

    pub(super) fn unavailable(&mut self, handler: &str, retry_after: Duration) -> Outcome {
        warn!(
            request_id = %self.request_id(),
            handler_name = %handler,
            retry_after_ms = retry_after.as_millis() as u64,
            "Handler unavailable"
        );
        if !self.is_committed() {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            self.exchange.reopen();
            self.exchange.set_header("retry-after", secs.max(1).to_string());
        }
        let message = format!("handler '{handler}' is unavailable");
        self.error_response(
            503,
            &message,
            Some("unavailable"),
            Some(handler),
            Outcome::Unavailable {
                handler: handler.to_string(),
                retry_after,
            },
        )
    }

    /// Produce the error response and return `outcome`, or a fatal outcome
    /// when the error dispatch itself fails.
    fn error_response(
        &mut self,
        status: u16,
        message: &str,
        category: Option<&str>,
        handler_name: Option<&str>,
        outcome: Outcome,
    ) -> Outcome {
        match self.error_dispatch(status, message, category, handler_name) {
            Ok(()) => outcome,
            Err(fatal) => {
                error!(
                    request_id = %self.request_id(),
                    status,
                    error = %fatal,
                    "Error dispatch failed"
                );
                if !self.is_committed() {
                    self.exchange.reset_buffer();
                    self.exchange.set_status(500);
                    self.write_minimal(500);
                }
                Outcome::Fatal {
                    message: fatal.to_string(),
                }
            }
        }
    }

    fn error_dispatch(
        &mut self,
        status: u16,
        message: &str,
        category: Option<&str>,
        handler_name: Option<&str>,
    ) -> Result<(), DispatchError> {
        self.exchange.reopen();
        if self.is_committed() {
            warn!(
                request_id = %self.request_id(),
                status,
                "Response already committed, error status not delivered"
            );
            return Ok(());
        }
        self.exchange.reset_buffer();
        self.exchange.set_status(status);

        let app = self.app;
        let location = app
            .runtime()
            .and_then(|rt| rt.error_pages.lookup(category, status));
        let (Some(runtime), Some(location)) = (app.runtime(), location) else {
            self.write_minimal(status);
            return Ok(());
        };

        let failed = |reason: String| DispatchError::ErrorDispatchFailed {
            location: location.to_string(),
            message: reason,
        };
        let path = normalize_target(location).ok_or_else(|| failed("malformed location".into()))?;
        let resolution = match app.lookup(runtime, &path) {
            Lookup::Found(resolution) => resolution,
            Lookup::Unavailable { handler, .. } => {
                return Err(failed(format!("handler '{handler}' is unavailable")))
            }
            Lookup::NotFound => return Err(failed("no handler for location".into())),
        };

        let pipeline = Arc::new(runtime.table.build(&resolution, &path, DispatchKind::Error));
        let request_uri = format!("{}{}", app.context_path(), path);
        let mut frame = RequestContext::new(
            1,
            DispatchKind::Error,
            path,
            request_uri,
            None,
            resolution,
            pipeline,
        );
        let original_uri = self.request_uri().to_string();
        for (key, value) in [
            (keys::ERROR_STATUS_CODE, Value::from(status)),
            (keys::ERROR_MESSAGE, Value::from(message)),
            (
                keys::ERROR_CATEGORY,
                category.map_or(Value::Null, Value::from),
            ),
            (keys::ERROR_REQUEST_URI, Value::from(original_uri)),
            (
                keys::ERROR_HANDLER_NAME,
                handler_name.map_or(Value::Null, Value::from),
            ),
        ] {
            frame.overlay.insert(key.to_string(), Some(value));
        }

        debug!(
            request_id = %self.request_id(),
            status,
            location = %location,
            "Error dispatch"
        );
        self.stack.push(frame);
        let result = self.run_guarded(0);
        self.pop_frame();
        self.exchange.take_error();
        result.map_err(|err| failed(err.to_string()))
    }

    fn write_minimal(&mut self, status: u16) {
        self.exchange
            .set_header("content-type", "text/plain; charset=utf-8".to_string());
        if *self.method() == Method::HEAD {
            return;
        }
        let body = format!("{status} {}\n", status_reason(status));
        if let Err(err) = self.exchange.write(body.as_bytes()) {
            debug!(error = %err, "Could not write error body");
        }
    }

    pub(super) fn into_exchange(self) -> Exchange {
        self.exchange
    }

    pub(super) fn into_parts(self) -> (Exchange, DispatchStack) {
        (self.exchange, self.stack)
    }
}

fn not_async(reason: &str) -> UnitError {
    DispatchError::AsyncNotSupported(reason.to_string()).into()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Absolute targets are used as given; relative ones are resolved against
/// the directory of the current path.
fn resolve_target(current: &str, target: &str) -> Option<String> {
    if target.starts_with('/') {
        return normalize_target(target);
    }
    let base = current.rsplit_once('/').map_or("", |(dir, _)| dir);
    normalize_target(&format!("{base}/{target}"))
}

fn location_values(frame: &RequestContext) -> [Value; 4] {
    [
        Value::from(frame.request_uri()),
        Value::from(frame.handler_path()),
        frame.path_info().map_or(Value::Null, Value::from),
        frame.query_string().map_or(Value::Null, Value::from),
    ]
}

fn insert_location(
    overlay: &mut std::collections::HashMap<String, Option<Value>>,
    names: [&str; 4],
    source: &RequestContext,
) {
    for (key, value) in names.into_iter().zip(location_values(source)) {
        overlay.insert(key.to_string(), Some(value));
    }
}

impl Application {
    /// Serve one exchange.
    ///
    /// Returns `Err` only when the application is not started. Every other
    /// result, faults included, is an [`Outcome`] on the completed call.
    ///
    /// The response buffer is resized to the configured
    /// `response_buffer_size` unless the front-end already wrote to it.
    pub fn service(&self, mut exchange: Exchange) -> Result<Served, DispatchError> {
        let state = self.state();
        if state != LifecycleState::Started {
            warn!(app = %self.name(), state = %state, "Request refused, application not started");
            return Err(DispatchError::NotStarted(state));
        }
        let guard = self.inner.in_flight.enter();
        let state = self.state();
        let runtime = match self.runtime() {
            Some(runtime) if state == LifecycleState::Started => runtime,
            _ => return Err(DispatchError::NotStarted(state)),
        };

        if !exchange.set_buffer_size(self.config().response_buffer_size) {
            debug!(app = %self.name(), "Response already in use, keeping its buffer size");
        }

        let started = Instant::now();
        let request_id = exchange.request_id();
        let raw_path = exchange.request().path().to_string();
        debug!(
            request_id = %request_id,
            app = %self.name(),
            method = %exchange.request().method(),
            path = %raw_path,
            "Service request"
        );

        let mut cx = Dispatch::new(self, exchange);
        let outcome = match self.relative_path(&raw_path) {
            None => cx.not_found(&raw_path),
            Some(path) => match self.lookup(runtime, &path) {
                Lookup::NotFound => cx.not_found(&path),
                Lookup::Unavailable {
                    handler,
                    retry_after,
                } => cx.unavailable(&handler, retry_after),
                Lookup::Found(resolution) => {
                    let query = cx.exchange.request().query().map(str::to_string);
                    let pipeline =
                        Arc::new(runtime.table.build(&resolution, &path, DispatchKind::Request));
                    cx.stack.push(RequestContext::new(
                        1,
                        DispatchKind::Request,
                        path,
                        raw_path.clone(),
                        query,
                        resolution,
                        pipeline,
                    ));
                    let result = cx.run_guarded(0);
                    return match self.settle_root(cx, result, started, guard) {
                        RootState::Done(completed) => Ok(Served::Complete(completed)),
                        RootState::Parked(shared) => match shared.take_receiver() {
                            Some(rx) => Ok(Served::Suspended(Suspension::new(
                                rx,
                                AsyncContext::new(self.clone(), shared, request_id),
                            ))),
                            None => Err(DispatchError::AsyncNotSupported(
                                "suspension already handed out".to_string(),
                            )),
                        },
                    };
                }
            },
        };
        let completed = self.finish(cx, outcome, started);
        drop(guard);
        Ok(Served::Complete(completed))
    }

    /// Flush and close the response and log the call.
    pub(super) fn finish(&self, mut cx: Dispatch<'_>, outcome: Outcome, started: Instant) -> Completed {
        if let Err(err) = cx.exchange.finish() {
            warn!(request_id = %cx.request_id(), error = %err, "Response finish failed");
        }
        let latency = started.elapsed();
        let status = cx.status();
        let request_id = cx.request_id();
        let latency_us = latency.as_micros() as u64;
        if latency > self.inner.config.slow_dispatch {
            warn!(
                request_id = %request_id,
                app = %self.name(),
                path = %cx.request_uri(),
                status,
                outcome = outcome.label(),
                latency_us,
                "Slow request"
            );
        } else {
            info!(
                request_id = %request_id,
                app = %self.name(),
                path = %cx.request_uri(),
                status,
                outcome = outcome.label(),
                latency_us,
                "Request completed"
            );
        }
        Completed {
            exchange: cx.into_exchange(),
            outcome,
            latency,
        }
    }
}
