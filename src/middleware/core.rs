use std::time::Duration;

use crate::dispatcher::Dispatch;
use crate::error::UnitError;
use crate::handler::UnitConfig;
use crate::pipeline::Next;

/// A processing unit in front of a handler.
///
/// `handle` decides whether the rest of the chain runs: calling
/// `next.run(cx)` delegates forward, returning without calling it
/// short-circuits the chain and the handler never runs.
///
/// `after` is the teardown hook. It runs for every unit that was entered,
/// in reverse order, once the whole pipeline is done. That includes
/// short-circuited, failed, cancelled and resumed-after-suspension runs.
pub trait Middleware: Send + Sync + 'static {
    fn init(&self, _config: &UnitConfig<'_>) -> Result<(), UnitError> {
        Ok(())
    }

    fn handle(&self, cx: &mut Dispatch<'_>, next: Next) -> Result<(), UnitError> {
        next.run(cx)
    }

    fn after(&self, _cx: &mut Dispatch<'_>, _latency: Duration) {}

    fn destroy(&self) {}
}

/// Adapter turning a closure into a [`Middleware`].
pub struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Dispatch<'_>, Next) -> Result<(), UnitError> + Send + Sync + 'static,
{
    fn handle(&self, cx: &mut Dispatch<'_>, next: Next) -> Result<(), UnitError> {
        (self.0)(cx, next)
    }
}

/// Wrap a closure as a middleware.
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut Dispatch<'_>, Next) -> Result<(), UnitError> + Send + Sync + 'static,
{
    FnMiddleware(f)
}
