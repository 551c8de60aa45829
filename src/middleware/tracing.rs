use std::time::Duration;

use tracing::{info, info_span};

use super::Middleware;
use crate::dispatcher::Dispatch;
use crate::error::UnitError;
use crate::pipeline::Next;

/// Opens a span around the rest of the pipeline and logs one event per
/// dispatch once its teardown runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

impl TracingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for TracingMiddleware {
    fn handle(&self, cx: &mut Dispatch<'_>, next: Next) -> Result<(), UnitError> {
        let span = info_span!(
            "dispatch",
            request_id = %cx.request_id(),
            app = %cx.application().name(),
            kind = %cx.dispatch_kind(),
            depth = cx.depth(),
            method = %cx.method(),
            path = %cx.path(),
            handler = %cx.handler_name(),
        );
        span.in_scope(|| next.run(cx))
    }

    fn after(&self, cx: &mut Dispatch<'_>, latency: Duration) {
        info!(
            request_id = %cx.request_id(),
            kind = %cx.dispatch_kind(),
            path = %cx.path(),
            handler = %cx.handler_name(),
            status = cx.status(),
            latency_ms = latency.as_millis() as u64,
            "Dispatch finished"
        );
    }
}
