//! # Middleware Module
//!
//! Processing units that run in front of a handler. A unit receives the
//! [`Dispatch`](crate::dispatcher::Dispatch) handle and a [`Next`](crate::pipeline::Next)
//! token; calling `next.run(cx)` continues the chain, returning without it
//! short-circuits. Teardown hooks run in reverse order once the pipeline
//! is done.
//!
//! Built-in units:
//!
//! - [`TracingMiddleware`] - one span per dispatch plus a completion event
//! - [`MetricsMiddleware`] - atomic counters with Prometheus text rendering

mod core;
mod metrics;
mod tracing;

pub use self::core::{middleware_fn, FnMiddleware, Middleware};
pub use self::metrics::MetricsMiddleware;
pub use self::tracing::TracingMiddleware;
