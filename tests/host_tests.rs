#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use brrtcontainer::dispatcher::{Application, Exchange, LifecycleState, Served, Service};
use brrtcontainer::error::DispatchError;
use brrtcontainer::handler::handler_fn;
use brrtcontainer::host::Host;
use brrtcontainer::registry::{DispatchKind, HandlerRegistration};
use brrtcontainer::runtime_config::EngineConfig;
use brrtcontainer::server::{serve_http, CapturedResponse, HttpRequest};
use common::{text_handler, BUFFER};

fn named(name: &'static str, ctx: &str) -> Application {
    let app = Application::builder(name).context_path(ctx).build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "whoami",
            handler_fn(move |cx| {
                let limit = cx.query_param("limit").unwrap_or("-").to_string();
                cx.set_header("content-type", "text/plain");
                cx.write_str(&format!("{name}:{}:{limit}", cx.path()))?;
                Ok(())
            }),
        )
        .pattern("/*"),
    )
    .unwrap();
    app
}

fn body_of(host: &Host, target: &str) -> String {
    let sink = CapturedResponse::new();
    host.service(Exchange::new(HttpRequest::get(target), sink.response(BUFFER)))
        .unwrap()
        .wait()
        .unwrap();
    sink.snapshot().body_str()
}

#[test]
fn test_host_routes_by_context_path() {
    let host = Host::new();
    host.deploy(named("shop", "/shop")).unwrap();
    host.deploy(named("admin", "/shop/admin")).unwrap();

    assert_eq!(body_of(&host, "/shop/cart"), "shop:/cart:-");
    assert_eq!(body_of(&host, "/shop/admin/users"), "admin:/users:-");
    assert_eq!(body_of(&host, "/shop"), "shop:/:-");

    let sink = CapturedResponse::new();
    let err = host
        .service(Exchange::new(HttpRequest::get("/shopping"), sink.response(BUFFER)))
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(ref path) if path == "/shopping"));

    host.deploy(named("root", "")).unwrap();
    assert_eq!(body_of(&host, "/shopping"), "root:/shopping:-");
}

#[test]
fn test_serve_http_adapter_round_trip() {
    let host = Host::new();
    host.deploy(named("shop", "/shop")).unwrap();

    let req = http::Request::builder()
        .method("GET")
        .uri("/shop/items?limit=2")
        .body(Vec::new())
        .unwrap();
    let resp = serve_http(&host, req).unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/plain");
    assert_eq!(resp.body(), b"shop:/items:2");

    let req = http::Request::builder()
        .uri("/elsewhere")
        .body(Vec::new())
        .unwrap();
    assert!(matches!(
        serve_http(&host, req),
        Err(DispatchError::NotFound(_))
    ));
}

/// Writes six bytes, then asks for 201 and reports whether the response
/// had already gone out.
fn late_status(ctx: &str, response_buffer_size: usize) -> Application {
    let config = EngineConfig {
        response_buffer_size,
        ..EngineConfig::default()
    };
    let app = Application::builder("late")
        .context_path(ctx)
        .config(config)
        .build()
        .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "late",
            handler_fn(|cx| {
                cx.write_str("abcdef")?;
                let committed = cx.is_committed();
                cx.set_status(201);
                cx.write_str(if committed { ":committed" } else { ":buffered" })?;
                Ok(())
            }),
        )
        .pattern("/*"),
    )
    .unwrap();
    app
}

#[test]
fn test_configured_response_buffer_size_applies() {
    let host = Host::new();
    host.deploy(late_status("/small", 4)).unwrap();
    host.deploy(late_status("/large", 1024)).unwrap();

    let req = http::Request::get("/small/x").body(Vec::new()).unwrap();
    let resp = serve_http(&host, req).unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(resp.body(), b"abcdef:committed");

    let req = http::Request::get("/large/x").body(Vec::new()).unwrap();
    let resp = serve_http(&host, req).unwrap();
    assert_eq!(resp.status(), http::StatusCode::CREATED);
    assert_eq!(resp.body(), b"abcdef:buffered");

    // The application's setting wins over the front-end's initial capacity.
    let sink = CapturedResponse::new();
    host.service(Exchange::new(HttpRequest::get("/small/y"), sink.response(BUFFER)))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(sink.snapshot().status, Some(200));
}

#[test]
fn test_undeployed_application_stops_receiving_requests() {
    let host = Host::new();
    let shop = named("shop", "/shop");
    host.deploy(shop.clone()).unwrap();
    host.deploy(named("root", "")).unwrap();

    host.undeploy("/shop").unwrap();
    assert_eq!(shop.state(), LifecycleState::Destroyed);
    assert_eq!(body_of(&host, "/shop/cart"), "root:/shop/cart:-");
    assert_eq!(host.context_paths(), vec![""]);
}

/// An application whose only handler parks every request until resumed.
fn parking(name: &'static str) -> Application {
    let app = Application::builder(name).context_path("/live").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "park",
            handler_fn(move |cx| {
                if cx.dispatch_kind() == DispatchKind::AsyncResume {
                    cx.write_str(name)?;
                } else {
                    cx.start_async()?;
                }
                Ok(())
            }),
        )
        .pattern("/park")
        .async_supported(true),
    )
    .unwrap();
    app.add_handler(HandlerRegistration::new("ping", text_handler(name)).pattern("/ping"))
        .unwrap();
    app
}

#[test]
fn test_redeploy_while_serving_drains_old_version() {
    let host = Arc::new(Host::new());
    let v1 = parking("v1");
    host.deploy(v1.clone()).unwrap();

    let sink = CapturedResponse::new();
    let suspension = match host
        .service(Exchange::new(HttpRequest::get("/live/park"), sink.response(BUFFER)))
        .unwrap()
    {
        Served::Suspended(s) => s,
        Served::Complete(done) => panic!("expected suspension, got {:?}", done.outcome),
    };
    assert_eq!(v1.in_flight(), 1);

    let ctx = suspension.context();
    let observer = {
        let host = Arc::clone(&host);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            // The replacement is already live while v1 drains.
            let seen = body_of(&host, "/live/ping");
            ctx.resume().unwrap();
            seen
        })
    };

    let v2 = parking("v2");
    let report = host.redeploy(v2.clone()).unwrap().unwrap();
    assert_eq!(observer.join().unwrap(), "v2");
    assert!(report.drained);
    assert_eq!(report.remaining, 0);

    // The in-flight request finished on the version it started on.
    assert_eq!(suspension.wait().unwrap().status(), 200);
    assert_eq!(sink.snapshot().body_str(), "v1");
    assert_eq!(v1.state(), LifecycleState::Destroyed);
    assert!(host.application("/live").unwrap().ptr_eq(&v2));
}

#[test]
fn test_shutdown_undeploys_everything() {
    let host = Host::new();
    let a = named("a", "/a");
    let b = named("b", "/a/b");
    host.deploy(a.clone()).unwrap();
    host.deploy(b.clone()).unwrap();

    let results = host.shutdown();
    let order: Vec<&str> = results.iter().map(|(ctx, _)| ctx.as_str()).collect();
    assert_eq!(order, vec!["/a/b", "/a"]);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert!(host.context_paths().is_empty());
    assert_eq!(a.state(), LifecycleState::Destroyed);
    assert_eq!(b.state(), LifecycleState::Destroyed);
}
