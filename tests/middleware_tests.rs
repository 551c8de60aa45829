#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use brrtcontainer::dispatcher::{Application, Dispatch};
use brrtcontainer::error::UnitError;
use brrtcontainer::handler::handler_fn;
use brrtcontainer::middleware::{MetricsMiddleware, Middleware, TracingMiddleware};
use brrtcontainer::pipeline::Next;
use brrtcontainer::registry::{DispatchKind, DispatchKinds, HandlerRegistration, MiddlewareRegistration};
use common::{get, start, text_handler, Recorder};

fn shop() -> Application {
    let app = Application::builder("shop").build().unwrap();
    app.add_handler(HandlerRegistration::new("ok", text_handler("ok")).pattern("/ok"))
        .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "fail",
            handler_fn(|_| Err(UnitError::failed("inventory", "stock service down"))),
        )
        .pattern("/fail"),
    )
    .unwrap();
    app.add_handler(HandlerRegistration::new("fwd", handler_fn(|cx| cx.forward("/ok"))).pattern("/fwd"))
        .unwrap();
    app
}

#[test]
fn test_metrics_count_dispatches_statuses_and_faults() {
    let metrics = Arc::new(MetricsMiddleware::new());
    let app = shop();
    app.add_middleware(
        MiddlewareRegistration::from_arc("metrics", Arc::clone(&metrics) as Arc<dyn Middleware>)
            .pattern("/*")
            .kinds(DispatchKinds::all()),
    )
    .unwrap();
    start(&app);

    assert_eq!(get(&app, "/ok").0.status(), 200);
    assert_eq!(get(&app, "/fail").0.status(), 500);
    assert_eq!(get(&app, "/fwd").1.body_str(), "ok");
    // Nothing matched, so no pipeline ran.
    assert_eq!(get(&app, "/missing").0.status(), 404);

    assert_eq!(metrics.dispatch_count(DispatchKind::Request), 3);
    assert_eq!(metrics.dispatch_count(DispatchKind::Forward), 1);
    assert_eq!(metrics.request_count(), 4);
    assert_eq!(metrics.completed_count(), 4);
    assert_eq!(metrics.status_class_count(2), 3);
    assert_eq!(metrics.status_class_count(5), 1);
    assert_eq!(metrics.status_class_count(4), 0);
    assert_eq!(metrics.fault_count(), 1);
    assert!(metrics.max_latency() >= metrics.average_latency());

    let text = metrics.render_prometheus("shop");
    assert!(text.contains("# TYPE brrtc_dispatches_total counter"));
    assert!(text.contains("brrtc_dispatches_total{app=\"shop\",kind=\"REQUEST\"} 3"));
    assert!(text.contains("brrtc_dispatches_total{app=\"shop\",kind=\"FORWARD\"} 1"));
    assert!(text.contains("brrtc_responses_total{app=\"shop\",class=\"2xx\"} 3"));
    assert!(text.contains("brrtc_responses_total{app=\"shop\",class=\"5xx\"} 1"));
    assert!(text.contains("brrtc_faults_total{app=\"shop\"} 1"));
    assert!(text.contains("brrtc_latency_seconds_count{app=\"shop\"} 4"));
    assert!(text.contains("brrtc_coroutine_stack_bytes{app=\"shop\"}"));
}

#[test]
fn test_prometheus_labels_are_escaped() {
    let text = MetricsMiddleware::new().render_prometheus("we\"ird");
    assert!(text.contains("app=\"we\\\"ird\""));
}

/// Records entry and teardown under its label.
struct Layer(&'static str, Recorder);

impl Middleware for Layer {
    fn handle(&self, cx: &mut Dispatch<'_>, next: Next) -> Result<(), UnitError> {
        self.1.push(self.0);
        next.run(cx)
    }

    fn after(&self, cx: &mut Dispatch<'_>, _latency: Duration) {
        self.1.push(format!("after:{}:{}", self.0, cx.status()));
    }
}

#[test]
fn test_teardown_runs_in_reverse_with_final_status() {
    let rec = Recorder::new();
    let app = shop();
    for label in ["outer", "middle", "inner"] {
        app.add_middleware(MiddlewareRegistration::new(label, Layer(label, rec.clone())).pattern("/*"))
            .unwrap();
    }
    start(&app);

    get(&app, "/fail");
    assert_eq!(
        rec.take(),
        vec![
            "outer",
            "middle",
            "inner",
            "after:inner:500",
            "after:middle:500",
            "after:outer:500",
        ]
    );
}

#[test]
fn test_short_circuit_tears_down_only_entered_units() {
    let rec = Recorder::new();
    let app = shop();
    app.add_middleware(MiddlewareRegistration::new("outer", Layer("outer", rec.clone())).pattern("/*"))
        .unwrap();
    app.add_middleware(
        MiddlewareRegistration::new(
            "gate",
            brrtcontainer::middleware_fn(|cx, _next| {
                cx.set_status(401);
                Ok(())
            }),
        )
        .pattern("/*"),
    )
    .unwrap();
    app.add_middleware(MiddlewareRegistration::new("inner", Layer("inner", rec.clone())).pattern("/*"))
        .unwrap();
    start(&app);

    assert_eq!(get(&app, "/ok").0.status(), 401);
    assert_eq!(rec.take(), vec!["outer", "after:outer:401"]);
}

#[derive(Clone, Default)]
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_tracing_middleware_logs_completion() {
    let sink = LogSink::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let app = shop();
    app.add_middleware(MiddlewareRegistration::new("trace", TracingMiddleware::new()).pattern("/*"))
        .unwrap();
    start(&app);

    tracing::subscriber::with_default(subscriber, || {
        assert_eq!(get(&app, "/ok").0.status(), 200);
        assert_eq!(get(&app, "/fail").0.status(), 500);
    });

    let logs = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    let finished: Vec<&str> = logs
        .lines()
        .filter(|line| line.contains("Dispatch finished"))
        .collect();
    assert_eq!(finished.len(), 2, "{logs}");
    assert!(finished[0].contains("path=/ok"));
    assert!(finished[0].contains("status=200"));
    assert!(finished[1].contains("handler=fail"));
    assert!(finished[1].contains("status=500"));
}
