#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use brrtcontainer::dispatcher::{Application, Completed, Exchange};
use brrtcontainer::handler::{handler_fn, Handler};
use brrtcontainer::middleware::{middleware_fn, Middleware};
use brrtcontainer::server::{Captured, CapturedResponse, HttpRequest};

pub const BUFFER: usize = 1024;

/// Shared log of what units ran, in order.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Handler that records `label` and writes it as the body.
pub fn recording_handler(rec: &Recorder, label: &'static str) -> impl Handler {
    let rec = rec.clone();
    handler_fn(move |cx| {
        rec.push(label);
        cx.write_str(label)?;
        Ok(())
    })
}

/// Middleware that records `label` and delegates forward.
pub fn recording_middleware(rec: &Recorder, label: &'static str) -> impl Middleware {
    let rec = rec.clone();
    middleware_fn(move |cx, next| {
        rec.push(label);
        next.run(cx)
    })
}

/// Handler writing a fixed body.
pub fn text_handler(body: &'static str) -> impl Handler {
    handler_fn(move |cx| {
        cx.write_str(body)?;
        Ok(())
    })
}

pub fn start(app: &Application) {
    app.initialize().unwrap();
    app.start().unwrap();
}

/// Serve `req`, waiting out any suspension.
pub fn send(app: &Application, req: HttpRequest) -> (Completed, Captured) {
    let sink = CapturedResponse::new();
    let exchange = Exchange::new(req, sink.response(BUFFER));
    let done = app.service(exchange).unwrap().wait().unwrap();
    (done, sink.snapshot())
}

pub fn get(app: &Application, target: &str) -> (Completed, Captured) {
    send(app, HttpRequest::get(target))
}

pub mod test_server {
    use std::sync::Once;

    /// Ensures May coroutines are configured only once
    static MAY_INIT: Once = Once::new();

    pub fn setup_may_runtime() {
        MAY_INIT.call_once(|| {
            may::config().set_stack_size(0x8000);
        });
    }
}
