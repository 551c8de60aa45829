//! # brrtcontainer
//!
//! **brrtcontainer** is a request-dispatch engine for a multi-application HTTP server, built on
//! the `may` coroutine runtime.
//!
//! ## Overview
//!
//! Given an inbound request, the engine picks the hosted application, resolves exactly one
//! handler by URL pattern, assembles the ordered middleware pipeline in front of it and runs it.
//! Handlers can forward or include other paths re-entrantly, suspend and resume their dispatch,
//! and report themselves unavailable. Each application loads its code through its own isolating
//! class loader and serves static content from its own resource provider.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - **[`resource`]** - Resource provider over ordered backing stores (directory, memory, alias)
//! - **[`loader`]** - Child-first isolating class loader and the class factory table
//! - **[`registry`]** - Handler and middleware registrations, URL patterns and the matcher
//! - **[`pipeline`]** - Pipeline builder and the middleware chain runner
//! - **[`dispatcher`]** - Applications, lifecycle, request dispatch, forward/include, async
//! - **[`server`]** - Raw request/response boundary, `http` adapters and the worker pool
//! - **[`host`]** - Several applications served under their context paths
//! - **[`descriptor`]** - Applications declared in YAML, TOML or JSON
//! - **[`redeploy`]** - Redeploy an application when its descriptor changes
//! - **[`middleware`]** - Middleware trait plus built-in tracing and metrics middleware
//! - **[`static_files`]** - The built-in static content handler
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Front as Front-end<br/>(WorkerPool / adapter)
//!     participant Host as Host
//!     participant App as Application
//!     participant Matcher as UrlMatcher
//!     participant Table as PipelineTable
//!     participant Chain as Middleware Chain
//!     participant Handler as Handler
//!
//!     Front->>Host: service(exchange)
//!     Host->>Host: Longest context path match
//!     alt No application
//!         Host-->>Front: NotFound
//!     end
//!     Host->>App: service(exchange)
//!     App->>Matcher: resolve(path)
//!     Note over Matcher: exact, longest prefix,<br/>extension, default
//!     alt No handler
//!         App->>App: Static content fallback
//!         App-->>Front: 404 (error page if mapped)
//!     end
//!     App->>Table: build(resolution, path, REQUEST)
//!     Table-->>App: Pattern-bound units, then name-bound units
//!     App->>Chain: run(0)
//!     Chain->>Handler: service(cx)
//!     alt forward / include
//!         Handler->>App: sub-dispatch with child frame
//!         App-->>Handler: return to caller
//!     end
//!     alt start_async
//!         Handler-->>App: Suspended
//!         App-->>Front: Served::Suspended
//!         Note over App: resume() re-enters the<br/>same pipeline position
//!     end
//!     alt Handler faults or panics
//!         App->>App: ERROR dispatch to error page
//!     end
//!     App-->>Front: Completed (status, latency)
//! ```
//!
//! ### Key Architectural Patterns
//!
//! 1. **Frozen After Start**: registrations are mutable while configuring and become an
//!    immutable matcher and pipeline table at start, so serving reads take no locks
//! 2. **Coroutine-Based Concurrency**: the worker pool drives `service` calls on `may` coroutines
//! 3. **Re-entrant Dispatch**: forward, include and error dispatches push a frame on a bounded
//!    per-request stack and share the request and response
//! 4. **Lock-Free Host Swaps**: deploy and redeploy replace the host table atomically
//!
//! ## Quick Start
//!
//! ```rust
//! use brrtcontainer::dispatcher::{Application, Exchange};
//! use brrtcontainer::handler::handler_fn;
//! use brrtcontainer::middleware::TracingMiddleware;
//! use brrtcontainer::registry::{HandlerRegistration, MiddlewareRegistration};
//! use brrtcontainer::server::{CapturedResponse, HttpRequest};
//!
//! let app = Application::builder("greeter").context_path("/greet").build().unwrap();
//! app.add_handler(
//!     HandlerRegistration::new("hello", handler_fn(|cx| {
//!         let name = cx.path_info().unwrap_or("/world").trim_start_matches('/').to_string();
//!         cx.set_header("content-type", "text/plain");
//!         cx.write_str(&format!("hello {name}"))?;
//!         Ok(())
//!     }))
//!     .pattern("/hello/*"),
//! )
//! .unwrap();
//! app.add_middleware(MiddlewareRegistration::new("trace", TracingMiddleware::new()).pattern("/*"))
//!     .unwrap();
//! app.initialize().unwrap();
//! app.start().unwrap();
//!
//! let sink = CapturedResponse::new();
//! let exchange = Exchange::new(HttpRequest::get("/greet/hello/ada"), sink.response(1024));
//! let done = app.service(exchange).unwrap().wait().unwrap();
//! assert_eq!(done.status(), 200);
//! assert_eq!(sink.snapshot().body_str(), "hello ada");
//! ```
//!
//! ## Runtime Considerations
//!
//! - Worker coroutines are spawned by [`server::WorkerPool`]; their stack size is configurable
//!   via `BRRTC_STACK_SIZE`
//! - Engine limits (dispatch depth, drain policy, buffer sizes) come from `BRRTC_*` environment
//!   variables, see [`runtime_config`]
//! - Logging is structured `tracing` output, see [`telemetry`]
//! - Panics inside handlers and middleware are caught and turned into error dispatches

pub mod clock;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod host;
pub mod loader;
pub mod middleware;
pub mod pipeline;
pub mod redeploy;
pub mod registry;
pub mod resource;
pub mod runtime_config;
pub mod server;
pub mod static_files;
pub mod telemetry;

pub use descriptor::ApplicationDescriptor;
pub use dispatcher::{Application, ApplicationBuilder, Dispatch, Exchange, Outcome, Service};
pub use error::{ConfigError, DispatchError, HostError, LifecycleError, UnitError};
pub use handler::{handler_fn, Handler};
pub use host::Host;
pub use middleware::{middleware_fn, Middleware};
pub use registry::{DispatchKind, HandlerRegistration, MiddlewareRegistration};
pub use runtime_config::EngineConfig;
