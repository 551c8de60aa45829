use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::dispatcher::Dispatch;
use crate::error::UnitError;
use crate::registry::{DispatchKind, HandlerRegistration, MiddlewareRegistration};

/// Ordered processing units followed by the handler.
pub struct Pipeline {
    units: SmallVec<[Arc<MiddlewareRegistration>; 8]>,
    handler: Arc<HandlerRegistration>,
    kind: DispatchKind,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Pipeline {
    pub(crate) fn new(
        units: SmallVec<[Arc<MiddlewareRegistration>; 8]>,
        handler: Arc<HandlerRegistration>,
        kind: DispatchKind,
    ) -> Self {
        Self {
            units,
            handler,
            kind,
        }
    }

    #[must_use]
    pub fn units(&self) -> &[Arc<MiddlewareRegistration>] {
        &self.units
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<HandlerRegistration> {
        &self.handler
    }

    #[must_use]
    pub fn dispatch_kind(&self) -> DispatchKind {
        self.kind
    }

    /// Stage count including the handler.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len() + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Unit names in run order, handler last.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.units
            .iter()
            .map(|u| u.name())
            .chain(std::iter::once(self.handler.name()))
            .collect()
    }

    /// Position of the handler.
    #[must_use]
    pub fn handler_position(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn unit(&self, position: usize) -> Option<&Arc<MiddlewareRegistration>> {
        self.units.get(position)
    }
}

/// Permission to run the rest of the chain.
///
/// Handed to [`Middleware::handle`](crate::middleware::Middleware::handle).
/// Consumed by [`run`](Next::run), so a unit delegates at most once. Dropping
/// it short-circuits the chain.
#[derive(Debug)]
#[must_use = "dropping Next short-circuits the pipeline"]
pub struct Next {
    position: usize,
    depth: usize,
}

impl Next {
    pub(crate) fn new(position: usize, depth: usize) -> Self {
        Self { position, depth }
    }

    /// Stage this `Next` will run.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Run the remaining stages.
    pub fn run(self, cx: &mut Dispatch<'_>) -> Result<(), UnitError> {
        cx.proceed(self)
    }
}
