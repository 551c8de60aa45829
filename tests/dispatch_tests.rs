#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use brrtcontainer::clock::ManualClock;
use brrtcontainer::dispatcher::{keys, Application, ErrorPageKey, IdOrigin, Outcome, REQUEST_ID_HEADER};
use brrtcontainer::error::{DispatchError, UnitError};
use brrtcontainer::handler::handler_fn;
use brrtcontainer::registry::{AvailabilityState, DispatchKind, HandlerRegistration, MiddlewareRegistration};
use brrtcontainer::runtime_config::EngineConfig;
use brrtcontainer::server::HttpRequest;
use common::{get, recording_middleware, send, start, text_handler, Recorder};
use serde_json::json;

#[test]
fn test_unavailable_for_a_window_then_served() {
    let clock = Arc::new(ManualClock::new());
    clock.set(Duration::from_secs(1_000));
    let app = Application::builder("clocked")
        .clock(Arc::clone(&clock) as Arc<dyn brrtcontainer::clock::Clock>)
        .build()
        .unwrap();
    app.add_handler(HandlerRegistration::new("report", text_handler("report")).pattern("/report"))
        .unwrap();
    start(&app);

    assert!(app.mark_unavailable("report", Some(Duration::from_secs(5))));
    clock.advance(Duration::from_secs(1));

    let (done, captured) = get(&app, "/report");
    assert_eq!(done.status(), 503);
    assert!(matches!(
        done.outcome,
        Outcome::Unavailable { ref handler, retry_after } if handler == "report" && retry_after == Duration::from_secs(4)
    ));
    assert_eq!(captured.headers.get("retry-after"), Some("4"));
    assert_eq!(captured.body_str(), "503 Service Unavailable\n");

    clock.advance(Duration::from_secs(5));
    assert_eq!(app.availability("report"), Some(AvailabilityState::Available));
    let (done, captured) = get(&app, "/report");
    assert_eq!(done.status(), 200);
    assert_eq!(captured.body_str(), "report");
}

#[test]
fn test_permanently_unavailable_handler_is_not_matched() {
    let app = Application::builder("gone").build().unwrap();
    app.add_handler(HandlerRegistration::new("old", text_handler("old")).pattern("/old"))
        .unwrap();
    start(&app);
    app.mark_unavailable("old", None);
    let (done, _) = get(&app, "/old");
    assert!(matches!(done.outcome, Outcome::NotFound));
    assert_eq!(done.status(), 404);
    // Permanent marks are not cleared.
    app.mark_available("old");
    assert_eq!(app.availability("old"), Some(AvailabilityState::Permanent));
}

#[test]
fn test_handler_reporting_unavailable_is_marked() {
    let clock = Arc::new(ManualClock::new());
    let app = Application::builder("flaky")
        .clock(Arc::clone(&clock) as Arc<dyn brrtcontainer::clock::Clock>)
        .build()
        .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "flaky",
            handler_fn(|_| {
                Err(UnitError::Unavailable {
                    retry_after: Some(Duration::from_secs(30)),
                })
            }),
        )
        .pattern("/flaky"),
    )
    .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/flaky");
    assert_eq!(done.status(), 503);
    assert_eq!(captured.headers.get("retry-after"), Some("30"));
    assert!(matches!(
        app.availability("flaky"),
        Some(AvailabilityState::Unavailable { .. })
    ));
}

#[test]
fn test_forward_chain_records_stack() {
    let rec = Recorder::new();
    let app = Application::builder("chain").context_path("/app").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "a",
            handler_fn(|cx| {
                cx.write_str("discarded")?;
                cx.forward("/b?step=2")
            }),
        )
        .pattern("/a"),
    )
    .unwrap();
    app.add_handler(HandlerRegistration::new("b", handler_fn(|cx| cx.forward("/c"))).pattern("/b"))
        .unwrap();
    {
        let rec = rec.clone();
        app.add_handler(
            HandlerRegistration::new(
                "c",
                handler_fn(move |cx| {
                    rec.push(format!("depth={}", cx.depth()));
                    rec.push(format!("kinds={:?}", cx.stack().kinds()));
                    rec.push(format!("step={:?}", cx.query_param("step")));
                    rec.push(format!("origin={:?}", cx.attribute(keys::FORWARD_REQUEST_URI)));
                    cx.write_str("from c")?;
                    Ok(())
                }),
            )
            .pattern("/c"),
        )
        .unwrap();
    }
    start(&app);

    let (done, captured) = get(&app, "/app/a");
    assert_eq!(done.status(), 200);
    assert_eq!(captured.body_str(), "from c");
    assert_eq!(
        rec.take(),
        vec![
            "depth=3".to_string(),
            format!(
                "kinds={:?}",
                vec![DispatchKind::Request, DispatchKind::Forward, DispatchKind::Forward]
            ),
            "step=Some(\"2\")".to_string(),
            format!("origin={:?}", Some(&json!("/app/a"))),
        ]
    );
}

#[test]
fn test_self_forward_exceeds_depth() {
    let config = EngineConfig {
        max_dispatch_depth: 4,
        ..EngineConfig::default()
    };
    let app = Application::builder("loop").config(config).build().unwrap();
    app.add_handler(HandlerRegistration::new("a", handler_fn(|cx| cx.forward("/a"))).pattern("/a"))
        .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/a");
    assert_eq!(done.status(), 500);
    match &done.outcome {
        Outcome::ServerError { cause } => assert!(matches!(
            cause.dispatch_error(),
            Some(DispatchError::DepthExceeded { max: 4 })
        )),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(captured.body_str(), "500 Internal Server Error\n");
}

#[test]
fn test_forward_discards_buffer_and_closes_output() {
    let app = Application::builder("fwd").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "front",
            handler_fn(|cx| {
                cx.set_header("x-front", "yes");
                cx.write_str("front-before ")?;
                cx.forward("/back")?;
                cx.set_status(500);
                cx.write_str("front-after")?;
                Ok(())
            }),
        )
        .pattern("/front"),
    )
    .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "back",
            handler_fn(|cx| {
                cx.set_status(201);
                cx.write_str("back")?;
                Ok(())
            }),
        )
        .pattern("/back"),
    )
    .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/front");
    assert_eq!(done.status(), 201);
    assert_eq!(captured.body_str(), "back");
}

#[test]
fn test_forward_after_commit_fails() {
    let app = Application::builder("late").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "early",
            handler_fn(|cx| {
                cx.write_str("sent")?;
                cx.flush()?;
                match cx.forward("/other") {
                    Err(err) => {
                        assert!(matches!(err.dispatch_error(), Some(DispatchError::AlreadyCommitted)));
                        cx.write_str(" still mine")?;
                        Ok(())
                    }
                    Ok(()) => panic!("forward after commit must fail"),
                }
            }),
        )
        .pattern("/early"),
    )
    .unwrap();
    app.add_handler(HandlerRegistration::new("other", text_handler("other")).pattern("/other"))
        .unwrap();
    start(&app);

    let (_, captured) = get(&app, "/early");
    assert_eq!(captured.body_str(), "sent still mine");
}

#[test]
fn test_include_appends_and_ignores_status_and_headers() {
    let app = Application::builder("inc").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "page",
            handler_fn(|cx| {
                cx.write_str("<header>")?;
                cx.include("fragment?part=nav")?;
                cx.write_str("</header>")?;
                Ok(())
            }),
        )
        .pattern("/site/page"),
    )
    .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "fragment",
            handler_fn(|cx| {
                cx.set_status(404);
                cx.set_header("x-fragment", "1");
                let part = cx.query_param("part").unwrap_or("none").to_string();
                let uri = cx
                    .attribute(keys::INCLUDE_REQUEST_URI)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                cx.write_str(&format!("[{part} via {uri}]"))?;
                Ok(())
            }),
        )
        .pattern("/site/fragment"),
    )
    .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/site/page");
    assert_eq!(done.status(), 200);
    assert_eq!(captured.headers.get("x-fragment"), None);
    assert_eq!(
        captured.body_str(),
        "<header>[nav via /site/fragment]</header>"
    );
}

#[test]
fn test_sub_dispatch_attributes_stay_in_overlay() {
    let rec = Recorder::new();
    let app = Application::builder("overlay").build().unwrap();
    {
        let rec = rec.clone();
        app.add_handler(
            HandlerRegistration::new(
                "outer",
                handler_fn(move |cx| {
                    cx.set_attribute("shared", json!(1));
                    cx.include("/inner")?;
                    rec.push(format!("outer shared={:?}", cx.attribute("shared")));
                    rec.push(format!("outer inner_only={:?}", cx.attribute("inner_only")));
                    rec.push(format!(
                        "outer include uri={:?}",
                        cx.attribute(keys::INCLUDE_REQUEST_URI)
                    ));
                    Ok(())
                }),
            )
            .pattern("/outer"),
        )
        .unwrap();
    }
    {
        let rec = rec.clone();
        app.add_handler(
            HandlerRegistration::new(
                "inner",
                handler_fn(move |cx| {
                    rec.push(format!("inner sees shared={:?}", cx.attribute("shared")));
                    cx.set_attribute("shared", json!(2));
                    cx.set_attribute("inner_only", json!(true));
                    cx.remove_attribute("absent");
                    rec.push(format!("inner shared={:?}", cx.attribute("shared")));
                    Ok(())
                }),
            )
            .pattern("/inner"),
        )
        .unwrap();
    }
    start(&app);

    get(&app, "/outer");
    assert_eq!(
        rec.take(),
        vec![
            format!("inner sees shared={:?}", Some(&json!(1))),
            format!("inner shared={:?}", Some(&json!(2))),
            format!("outer shared={:?}", Some(&json!(1))),
            "outer inner_only=None".to_string(),
            "outer include uri=None".to_string(),
        ]
    );
}

#[test]
fn test_relative_forward_target() {
    let app = Application::builder("rel").build().unwrap();
    app.add_handler(HandlerRegistration::new("list", handler_fn(|cx| cx.forward("detail"))).pattern("/shop/list"))
        .unwrap();
    app.add_handler(HandlerRegistration::new("detail", text_handler("detail")).pattern("/shop/detail"))
        .unwrap();
    start(&app);
    let (_, captured) = get(&app, "/shop/list");
    assert_eq!(captured.body_str(), "detail");
}

#[test]
fn test_not_found_minimal_body() {
    let app = Application::builder("empty").build().unwrap();
    start(&app);
    let (done, captured) = get(&app, "/nothing/here");
    assert!(matches!(done.outcome, Outcome::NotFound));
    assert_eq!(captured.status, Some(404));
    assert_eq!(captured.body_str(), "404 Not Found\n");
    assert_eq!(
        captured.headers.get("content-type"),
        Some("text/plain; charset=utf-8")
    );
    assert!(captured.finished);
}

#[test]
fn test_path_outside_context_is_not_found() {
    let app = Application::builder("ctx").context_path("/shop").build().unwrap();
    app.add_handler(HandlerRegistration::new("all", text_handler("all")).pattern("/"))
        .unwrap();
    start(&app);
    let (done, _) = get(&app, "/shopping");
    assert_eq!(done.status(), 404);
    let (done, captured) = get(&app, "/shop/anything");
    assert_eq!(done.status(), 200);
    assert_eq!(captured.body_str(), "all");
}

#[test]
fn test_status_error_page_sees_error_attributes() {
    let app = Application::builder("pages").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "errors",
            handler_fn(|cx| {
                let status = cx.attribute(keys::ERROR_STATUS_CODE).cloned();
                let uri = cx.attribute(keys::ERROR_REQUEST_URI).cloned();
                let kind = cx.dispatch_kind();
                cx.write_str(&format!("{kind} {status:?} {uri:?}"))?;
                Ok(())
            }),
        )
        .pattern("/errors/*"),
    )
    .unwrap();
    app.add_error_page(ErrorPageKey::Status(404), "/errors/404")
        .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/missing");
    assert!(matches!(done.outcome, Outcome::NotFound));
    assert_eq!(done.status(), 404);
    assert_eq!(
        captured.body_str(),
        format!(
            "{} {:?} {:?}",
            DispatchKind::Error,
            Some(json!(404)),
            Some(json!("/missing"))
        )
    );
}

#[test]
fn test_category_page_preferred_over_status_page() {
    let app = Application::builder("cats").build().unwrap();
    app.add_handler(
        HandlerRegistration::new("db", handler_fn(|_| Err(UnitError::failed("db", "connection refused"))))
            .pattern("/orders"),
    )
    .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "db-page",
            handler_fn(|cx| {
                let message = cx
                    .attribute(keys::ERROR_MESSAGE)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let handler = cx
                    .attribute(keys::ERROR_HANDLER_NAME)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                cx.write_str(&format!("db down ({message}) in {handler}"))?;
                Ok(())
            }),
        )
        .pattern("/errors/db"),
    )
    .unwrap();
    app.add_handler(HandlerRegistration::new("generic", text_handler("generic 500")).pattern("/errors/500"))
        .unwrap();
    app.add_error_page(ErrorPageKey::Status(500), "/errors/500").unwrap();
    app.add_error_page(ErrorPageKey::Category("db".into()), "/errors/db")
        .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/orders");
    assert_eq!(done.status(), 500);
    assert!(matches!(done.outcome, Outcome::ServerError { .. }));
    assert_eq!(
        captured.body_str(),
        "db down (db: connection refused) in db"
    );
}

#[test]
fn test_default_error_page_and_send_error() {
    let app = Application::builder("teapot").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "denied",
            handler_fn(|cx| {
                cx.write_str("partial output")?;
                cx.send_error(403, "no entry")
            }),
        )
        .pattern("/denied"),
    )
    .unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "fallback-page",
            handler_fn(|cx| {
                let message = cx
                    .attribute(keys::ERROR_MESSAGE)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                cx.write_str(&format!("sorry: {message}"))?;
                Ok(())
            }),
        )
        .pattern("/oops"),
    )
    .unwrap();
    app.add_error_page(ErrorPageKey::Default, "/oops").unwrap();
    start(&app);

    let (done, captured) = get(&app, "/denied");
    assert_eq!(done.status(), 403);
    assert!(matches!(done.outcome, Outcome::Ok { status: 403 }));
    assert_eq!(captured.body_str(), "sorry: no entry");
}

#[test]
fn test_broken_error_page_is_fatal() {
    let app = Application::builder("fatal").build().unwrap();
    app.add_handler(HandlerRegistration::new("boom", handler_fn(|_| Err(UnitError::failed("x", "y")))).pattern("/boom"))
        .unwrap();
    app.add_error_page(ErrorPageKey::Status(500), "/no/such/page").unwrap();
    start(&app);

    let (done, captured) = get(&app, "/boom");
    assert!(matches!(done.outcome, Outcome::Fatal { .. }));
    assert_eq!(done.status(), 500);
    assert_eq!(captured.body_str(), "500 Internal Server Error\n");
}

#[test]
fn test_panic_becomes_server_error() {
    let rec = Recorder::new();
    let app = Application::builder("panics").build().unwrap();
    app.add_handler(
        HandlerRegistration::new("panicky", handler_fn(|_| panic!("handler blew up"))).pattern("/panic"),
    )
    .unwrap();
    app.add_middleware(MiddlewareRegistration::new("watch", recording_middleware(&rec, "watch")).pattern("/*"))
        .unwrap();
    start(&app);

    let (done, captured) = get(&app, "/panic");
    assert_eq!(done.status(), 500);
    match &done.outcome {
        Outcome::ServerError { cause } => {
            assert_eq!(cause.category(), "panic");
            assert!(cause.to_string().contains("handler blew up"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(captured.body_str(), "500 Internal Server Error\n");
    assert_eq!(rec.take(), vec!["watch"]);

    // The application keeps serving afterwards.
    let (done, _) = get(&app, "/panic");
    assert_eq!(done.status(), 500);
}

#[test]
fn test_head_error_has_no_body() {
    let app = Application::builder("head").build().unwrap();
    start(&app);
    let (done, captured) = send(&app, HttpRequest::new(http::Method::HEAD, "/missing"));
    assert_eq!(done.status(), 404);
    assert!(captured.body.is_empty());
}

#[test]
fn test_request_body_and_query() {
    let app = Application::builder("body").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "upload",
            handler_fn(|cx| {
                let body = cx.read_body()?;
                let name = cx.query_param("name").unwrap_or("anon").to_string();
                let params = cx.query_params().len();
                cx.write_str(&format!(
                    "{name}:{}:{params}:{}",
                    String::from_utf8_lossy(&body),
                    cx.method()
                ))?;
                Ok(())
            }),
        )
        .pattern("/upload"),
    )
    .unwrap();
    start(&app);
    let (_, captured) = send(
        &app,
        HttpRequest::post("/upload?name=ada&tag=x").with_body("payload"),
    );
    assert_eq!(captured.body_str(), "ada:payload:2:POST");
}

#[test]
fn test_cancelled_exchange_reports_cancelled() {
    let app = Application::builder("cancel").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "slow",
            handler_fn(|cx| {
                cx.check_cancelled()?;
                cx.write_str("not reached")?;
                Ok(())
            }),
        )
        .pattern("/slow"),
    )
    .unwrap();
    start(&app);

    let token = brrtcontainer::dispatcher::CancelToken::new();
    token.cancel();
    let sink = brrtcontainer::server::CapturedResponse::new();
    let exchange = brrtcontainer::Exchange::new(HttpRequest::get("/slow"), sink.response(common::BUFFER))
        .with_cancel_token(token);
    let done = app.service(exchange).unwrap().wait().unwrap();
    assert!(matches!(done.outcome, Outcome::Cancelled));
    assert!(sink.snapshot().body.is_empty());
}

#[test]
fn test_request_id_is_adopted_and_echoed() {
    let app = Application::builder("ids").build().unwrap();
    app.add_handler(
        HandlerRegistration::new(
            "whoami",
            handler_fn(|cx| {
                let id = cx.request_id().to_string();
                cx.write_str(&id)?;
                Ok(())
            }),
        )
        .pattern("/whoami"),
    )
    .unwrap();
    start(&app);

    let upstream = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    let (done, captured) = send(&app, HttpRequest::get("/whoami").header("X-Request-Id", upstream));
    assert_eq!(done.request_id().origin(), IdOrigin::Inbound);
    assert_eq!(captured.body_str(), upstream);
    assert_eq!(captured.headers.get(REQUEST_ID_HEADER), Some(upstream));

    // Minted ids also reach error responses.
    let (done, captured) = send(&app, HttpRequest::get("/missing").header(REQUEST_ID_HEADER, "junk"));
    assert_eq!(done.status(), 404);
    assert_eq!(done.request_id().origin(), IdOrigin::Minted);
    let minted = done.request_id().to_string();
    assert_eq!(captured.headers.get(REQUEST_ID_HEADER), Some(minted.as_str()));
}

/// Panic capture is only meaningful while every shipped profile unwinds.
#[test]
fn test_no_profile_aborts_on_panic() {
    let manifest: toml::Table = toml::from_str(include_str!("../Cargo.toml")).unwrap();
    let Some(profiles) = manifest.get("profile").and_then(toml::Value::as_table) else {
        return;
    };
    for (name, profile) in profiles {
        let strategy = profile.get("panic").and_then(toml::Value::as_str);
        assert_ne!(strategy, Some("abort"), "profile '{name}' aborts on panic");
    }
}
