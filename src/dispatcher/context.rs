use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use smallvec::SmallVec;

use crate::middleware::Middleware;
use crate::pipeline::Pipeline;
use crate::registry::{DispatchKind, MatchKind, Resolution};

/// A processing unit whose `handle` has been called in this frame.
pub(crate) struct Entered {
    pub(crate) position: usize,
    pub(crate) name: String,
    pub(crate) unit: Arc<dyn Middleware>,
    pub(crate) async_supported: bool,
    pub(crate) started: Instant,
}

impl fmt::Debug for Entered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entered")
            .field("position", &self.position)
            .field("name", &self.name)
            .finish()
    }
}

/// One level of dispatch: the top-level request, a forward, an include or
/// an error dispatch.
///
/// Frames link to their parent through the [`DispatchStack`] that owns them
/// rather than through pointers, so the chain can never form a cycle.
pub struct RequestContext {
    depth: usize,
    kind: DispatchKind,
    path: String,
    request_uri: String,
    query: Option<String>,
    resolution: Resolution,
    pub(crate) params: Vec<(String, String)>,
    /// `None` marks an attribute removed at this level.
    pub(crate) overlay: HashMap<String, Option<Value>>,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) entered: SmallVec<[Entered; 8]>,
    pub(crate) position: usize,
    pub(crate) started: Instant,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("depth", &self.depth)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("handler_name", &self.handler_name())
            .field("match_kind", &self.resolution.kind)
            .field("overlay", &self.overlay.len())
            .finish()
    }
}

impl RequestContext {
    pub(crate) fn new(
        depth: usize,
        kind: DispatchKind,
        path: String,
        request_uri: String,
        query: Option<String>,
        resolution: Resolution,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            depth,
            kind,
            path,
            request_uri,
            query,
            resolution,
            params: Vec::new(),
            overlay: HashMap::new(),
            pipeline,
            entered: SmallVec::new(),
            position: 0,
            started: Instant::now(),
        }
    }

    /// 1 for the top-level dispatch.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn dispatch_kind(&self) -> DispatchKind {
        self.kind
    }

    pub(crate) fn set_dispatch_kind(&mut self, kind: DispatchKind) {
        self.kind = kind;
    }

    /// Application-relative path this frame was dispatched to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Context path plus [`path`](Self::path).
    #[must_use]
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    #[must_use]
    pub fn handler_name(&self) -> &str {
        self.resolution.handler_name()
    }

    #[must_use]
    pub fn handler_path(&self) -> &str {
        &self.resolution.handler_path
    }

    #[must_use]
    pub fn path_info(&self) -> Option<&str> {
        self.resolution.path_info.as_deref()
    }

    #[must_use]
    pub fn match_kind(&self) -> MatchKind {
        self.resolution.kind
    }

    #[must_use]
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Stage names of the pipeline running in this frame.
    #[must_use]
    pub fn pipeline_stages(&self) -> Vec<&str> {
        self.pipeline.stage_names()
    }

    /// Attribute visible at this level only, `Some(None)` when removed here.
    #[must_use]
    pub fn overlay_attribute(&self, key: &str) -> Option<Option<&Value>> {
        self.overlay.get(key).map(Option::as_ref)
    }
}

/// Frames of one `service` call, outermost first.
#[derive(Debug, Default)]
pub struct DispatchStack {
    frames: SmallVec<[RequestContext; 4]>,
}

impl DispatchStack {
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn frames(&self) -> &[RequestContext] {
        &self.frames
    }

    /// Frame currently running.
    #[must_use]
    pub fn current(&self) -> Option<&RequestContext> {
        self.frames.last()
    }

    /// Frame that started the current one.
    #[must_use]
    pub fn parent(&self) -> Option<&RequestContext> {
        self.frames.len().checked_sub(2).and_then(|i| self.frames.get(i))
    }

    #[must_use]
    pub fn root(&self) -> Option<&RequestContext> {
        self.frames.first()
    }

    /// Dispatch kinds from the outermost frame inwards.
    #[must_use]
    pub fn kinds(&self) -> Vec<DispatchKind> {
        self.frames.iter().map(RequestContext::dispatch_kind).collect()
    }

    pub(crate) fn push(&mut self, frame: RequestContext) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<RequestContext> {
        self.frames.pop()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut RequestContext> {
        self.frames.last_mut()
    }

    /// Attribute lookup through the overlays, innermost first. `Some(None)`
    /// means an overlay removed the key; `None` means no overlay knows it.
    pub(crate) fn overlay_lookup(&self, key: &str) -> Option<Option<&Value>> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.overlay.get(key))
            .map(Option::as_ref)
    }

    /// Query parameter lookup through frame parameters, innermost first.
    pub(crate) fn param_lookup(&self, name: &str) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| {
            frame
                .params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        })
    }
}
