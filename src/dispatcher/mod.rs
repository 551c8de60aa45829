//! # Dispatcher Module
//!
//! The application dispatcher: one [`Application`] per deployed web
//! application, owning its registrations, resources, class loader and
//! attributes, and driving every request through the matched pipeline.
//!
//! ## Request Flow
//!
//! 1. The context path is stripped and the remainder normalized
//! 2. The URL matcher resolves a handler, falling back to static content
//! 3. The pipeline for the resolution and dispatch kind is built
//! 4. Units run in order, each deciding whether to call `next`
//! 5. Teardown hooks run in reverse once the pipeline returns
//! 6. Faults become an [`Outcome`]; error pages are dispatched if mapped
//!
//! Forward and include run nested pipelines on the same exchange through
//! [`Dispatch::forward`] and [`Dispatch::include`]. A unit may suspend the
//! request with [`Dispatch::start_async`] and continue it later from any
//! thread through the returned [`AsyncContext`].
//!
//! ## Panics
//!
//! A panicking unit is caught at the application boundary, logged, and
//! turned into a 500 the same way a returned fault is.

mod application;
mod async_support;
mod attributes;
mod context;
mod error_pages;
mod exchange;
mod lifecycle;
mod request_id;
mod service;

pub use application::{Application, ApplicationBuilder, STATIC_HANDLER};
pub use async_support::{AsyncContext, Suspension};
pub use attributes::{keys, ApplicationAttributes};
pub use context::{DispatchStack, RequestContext};
pub use error_pages::{ErrorPageKey, ErrorPages};
pub use exchange::{CancelToken, ErrorStatus, Exchange};
pub use lifecycle::{
    callback_fn, CallbackDiscovery, ConfigCallback, DrainReport, FnCallback, LifecycleEvent,
    LifecycleListener, LifecycleState, Registrar,
};
pub use request_id::{IdOrigin, RequestId, REQUEST_ID_HEADER};
pub use service::{Completed, Dispatch, Outcome, Served, Service};
