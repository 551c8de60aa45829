//! # Server Boundary
//!
//! The request and response abstractions the engine dispatches against,
//! adapters to the `http` crate, and the coroutine worker pool that fronts
//! a [`Service`](crate::dispatcher::Service).
//!
//! - [`RawRequest`] / [`RawResponse`] are what the engine reads and writes.
//! - [`HttpRequest`] is the owned request used by adapters and tests.
//! - [`BufferedResponse`] buffers output over a [`ResponseSink`] and commits
//!   when the buffer fills or is flushed.
//! - [`CapturedResponse`] is an in-memory sink.

mod adapter;
mod headers;
mod request;
mod response;
mod worker_pool;

pub use adapter::{exchange_from_http, request_from_http, response_to_http, serve_http};
pub use headers::{Headers, MAX_INLINE_HEADERS};
pub use request::{parse_query, split_target, HttpRequest, RawRequest};
pub use response::{
    status_reason, BufferedResponse, Captured, CapturedResponse, RawResponse, ResponseSink,
};
pub use worker_pool::{
    BackpressureMode, Rejected, Ticket, WorkerPool, WorkerPoolConfig, WorkerPoolMetrics,
};
