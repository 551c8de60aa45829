use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::headers::Headers;

/// Canonical reason phrase for `status`, `"Unknown"` for unregistered codes.
#[must_use]
pub fn status_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}

/// Outbound response as the engine sees it.
///
/// Status and headers can change freely until the response is committed.
/// Commit happens on [`flush`](RawResponse::flush), or on its own once the
/// body outgrows the buffer. After that only body bytes can still be
/// written.
pub trait RawResponse: Send {
    fn status(&self) -> u16;
    fn set_status(&mut self, status: u16);
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Commit status and headers and push buffered bytes downstream.
    fn flush(&mut self) -> io::Result<()>;
    fn is_committed(&self) -> bool;
    /// Drop buffered body bytes. `false` once committed.
    fn reset_buffer(&mut self) -> bool;
    /// Drop status, headers and body. `false` once committed.
    fn reset(&mut self) -> bool;
    /// Body bytes waiting in the buffer.
    fn buffered(&self) -> usize;
    /// Buffer capacity before an automatic commit.
    fn buffer_size(&self) -> usize;
    /// Resize the buffer. `false` once committed or once body bytes are
    /// buffered.
    fn set_buffer_size(&mut self, size: usize) -> bool;
    /// Flush and close. Further writes fail.
    fn finish(&mut self) -> io::Result<()>;
}

/// Where committed bytes go: a socket in production, memory in tests.
pub trait ResponseSink: Send {
    fn commit(&mut self, status: u16, headers: &Headers) -> io::Result<()>;
    fn write_body(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// [`RawResponse`] with a bounded body buffer in front of a sink.
pub struct BufferedResponse<S: ResponseSink> {
    status: u16,
    headers: Headers,
    buffer: Vec<u8>,
    capacity: usize,
    committed: bool,
    finished: bool,
    sink: S,
}

impl<S: ResponseSink> fmt::Debug for BufferedResponse<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("buffered", &self.buffer.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl<S: ResponseSink> BufferedResponse<S> {
    pub fn new(sink: S, capacity: usize) -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            buffer: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
            committed: false,
            finished: false,
            sink,
        }
    }

    fn commit(&mut self) -> io::Result<()> {
        if !self.committed {
            self.committed = true;
            self.sink.commit(self.status, &self.headers)?;
        }
        Ok(())
    }
}

impl<S: ResponseSink> RawResponse for BufferedResponse<S> {
    fn status(&self) -> u16 {
        self.status
    }

    fn set_status(&mut self, status: u16) {
        if !self.committed {
            self.status = status;
        }
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "response is finished"));
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit()?;
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            self.sink.write_body(&pending)?;
        }
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.committed
    }

    fn reset_buffer(&mut self) -> bool {
        if self.committed {
            return false;
        }
        self.buffer.clear();
        true
    }

    fn reset(&mut self) -> bool {
        if self.committed {
            return false;
        }
        self.buffer.clear();
        self.headers.clear();
        self.status = 200;
        true
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn buffer_size(&self) -> usize {
        self.capacity
    }

    fn set_buffer_size(&mut self, size: usize) -> bool {
        if self.committed || !self.buffer.is_empty() {
            return false;
        }
        self.capacity = size;
        true
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush()?;
        self.finished = true;
        self.sink.finish()
    }
}

/// What a [`CapturedResponse`] saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Committed status, `None` until commit.
    pub status: Option<u16>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub finished: bool,
}

impl Captured {
    #[must_use]
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// In-memory sink. Clones share the same capture, so the caller can keep
/// one handle while the engine owns the response.
#[derive(Debug, Clone, Default)]
pub struct CapturedResponse {
    inner: Arc<Mutex<Captured>>,
}

impl CapturedResponse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a clone of this capture in a buffered response.
    #[must_use]
    pub fn response(&self, capacity: usize) -> BufferedResponse<CapturedResponse> {
        BufferedResponse::new(self.clone(), capacity)
    }

    #[must_use]
    pub fn snapshot(&self) -> Captured {
        self.inner.lock().clone()
    }
}

impl ResponseSink for CapturedResponse {
    fn commit(&mut self, status: u16, headers: &Headers) -> io::Result<()> {
        let mut captured = self.inner.lock();
        captured.status = Some(status);
        captured.headers = headers.clone();
        Ok(())
    }

    fn write_body(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.lock().body.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.lock().finished = true;
        Ok(())
    }
}
