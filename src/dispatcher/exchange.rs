use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use super::request_id::RequestId;
use crate::server::{parse_query, RawRequest, RawResponse};

/// Cooperative cancellation flag shared between the connection layer and
/// the units serving a request. Nothing is ever interrupted forcibly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An error status recorded by `send_error`, turned into an error page once
/// the pipeline has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStatus {
    pub status: u16,
    pub message: String,
}

/// One request/response pair plus everything owned by that single call:
/// request attributes, the cancellation token and the request id.
///
/// Units never touch the raw response directly. Writes go through the
/// exchange so that include (status and headers frozen) and post-forward
/// (output closed) rules hold whatever the unit does.
pub struct Exchange {
    request: Box<dyn RawRequest>,
    response: Box<dyn RawResponse>,
    attributes: HashMap<String, Value>,
    query_params: Vec<(String, String)>,
    request_id: RequestId,
    cancel: CancelToken,
    include_depth: usize,
    output_closed: bool,
    error: Option<ErrorStatus>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("request_id", &self.request_id)
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("status", &self.response.status())
            .field("committed", &self.response.is_committed())
            .finish()
    }
}

impl Exchange {
    pub fn new(request: impl RawRequest + 'static, response: impl RawResponse + 'static) -> Self {
        Self::from_boxes(Box::new(request), Box::new(response))
    }

    /// The request id is adopted from `x-request-id` when it holds a ULID
    /// and is echoed on the response.
    #[must_use]
    pub fn from_boxes(request: Box<dyn RawRequest>, mut response: Box<dyn RawResponse>) -> Self {
        let request_id = RequestId::for_request(request.as_ref());
        if !response.is_committed() {
            request_id.echo(response.headers_mut());
        }
        let query_params = request.query().map(parse_query).unwrap_or_default();
        Self {
            request,
            response,
            attributes: HashMap::new(),
            query_params,
            request_id,
            cancel: CancelToken::new(),
            include_depth: 0,
            output_closed: false,
            error: None,
        }
    }

    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    #[must_use]
    pub fn request(&self) -> &dyn RawRequest {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> &mut dyn RawRequest {
        self.request.as_mut()
    }

    #[must_use]
    pub fn response(&self) -> &dyn RawResponse {
        self.response.as_ref()
    }

    /// Direct access for the connection layer. Bypasses include and
    /// closed-output rules.
    pub fn response_mut(&mut self) -> &mut dyn RawResponse {
        self.response.as_mut()
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(key.into(), value)
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    #[must_use]
    pub fn error_status(&self) -> Option<&ErrorStatus> {
        self.error.as_ref()
    }

    pub fn into_parts(self) -> (Box<dyn RawRequest>, Box<dyn RawResponse>) {
        (self.request, self.response)
    }

    pub(crate) fn attribute_keys(&self) -> impl Iterator<Item = &String> {
        self.attributes.keys()
    }

    pub(crate) fn is_including(&self) -> bool {
        self.include_depth > 0
    }

    pub(crate) fn enter_include(&mut self) {
        self.include_depth += 1;
    }

    pub(crate) fn leave_include(&mut self) {
        self.include_depth = self.include_depth.saturating_sub(1);
    }

    pub(crate) fn close_output(&mut self) {
        self.output_closed = true;
    }

    pub(crate) fn is_output_closed(&self) -> bool {
        self.output_closed
    }

    /// Lift include and closed-output restrictions before error dispatch.
    pub(crate) fn reopen(&mut self) {
        self.output_closed = false;
        self.include_depth = 0;
    }

    /// Body write. Silently dropped once a forward closed the output.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.output_closed {
            return Ok(());
        }
        self.response.write(bytes)
    }

    pub(crate) fn set_status(&mut self, status: u16) {
        if !self.is_including() && !self.output_closed {
            self.response.set_status(status);
        }
    }

    pub(crate) fn set_header(&mut self, name: &str, value: String) {
        if !self.is_including() && !self.output_closed && !self.response.is_committed() {
            self.response.headers_mut().set(name, value);
        }
    }

    pub(crate) fn append_header(&mut self, name: &str, value: String) {
        if !self.is_including() && !self.output_closed && !self.response.is_committed() {
            self.response.headers_mut().append(name, value);
        }
    }

    /// Record an error status. Ignored during include. Returns `false` when
    /// the response is already committed.
    pub(crate) fn send_error(&mut self, status: u16, message: String) -> bool {
        if self.is_including() {
            return true;
        }
        if self.response.is_committed() {
            return false;
        }
        self.response.reset_buffer();
        self.response.set_status(status);
        self.error = Some(ErrorStatus { status, message });
        true
    }

    pub(crate) fn take_error(&mut self) -> Option<ErrorStatus> {
        self.error.take()
    }

    pub(crate) fn reset_buffer(&mut self) -> bool {
        self.response.reset_buffer()
    }

    pub(crate) fn set_buffer_size(&mut self, size: usize) -> bool {
        self.response.set_buffer_size(size)
    }

    pub(crate) fn finish(&mut self) -> io::Result<()> {
        self.response.finish()
    }
}
