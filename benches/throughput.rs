use std::hint::black_box;

use brrtcontainer::dispatcher::{Application, Exchange, Service};
use brrtcontainer::handler::handler_fn;
use brrtcontainer::host::Host;
use brrtcontainer::middleware::{middleware_fn, MetricsMiddleware};
use brrtcontainer::registry::{HandlerRegistration, MiddlewareRegistration};
use brrtcontainer::server::{CapturedResponse, HttpRequest};
use criterion::{criterion_group, criterion_main, Criterion};

fn zoo() -> Application {
    let app = Application::builder("zoo").context_path("/zoo").build().expect("app");
    let patterns: [(&str, &str); 6] = [
        ("animals", "/animals/*"),
        ("toys", "/animals/toys/*"),
        ("health", "/health"),
        ("jsp", "*.jsp"),
        ("inventory", "/inventory/feeds/items/*"),
        ("default", "/"),
    ];
    for (name, pattern) in patterns {
        app.add_handler(
            HandlerRegistration::new(
                name,
                handler_fn(move |cx| {
                    cx.write_str(name)?;
                    Ok(())
                }),
            )
            .pattern(pattern),
        )
        .expect("handler");
    }
    app.add_middleware(
        MiddlewareRegistration::new("pass", middleware_fn(|cx, next| next.run(cx))).pattern("/*"),
    )
    .expect("middleware");
    app.add_middleware(MiddlewareRegistration::new("metrics", MetricsMiddleware::new()).pattern("/*"))
        .expect("middleware");
    app.initialize().expect("initialize");
    app.start().expect("start");
    app
}

fn bench_resolve(c: &mut Criterion) {
    let app = zoo();
    let paths = [
        "/animals/123",
        "/animals/toys/456",
        "/health",
        "/cages/lion.jsp",
        "/inventory/feeds/items/3",
        "/nowhere/at/all",
    ];
    c.bench_function("resolve", |b| {
        b.iter(|| {
            for path in paths.iter() {
                black_box(app.resolve(path));
            }
        })
    });
}

fn bench_service(c: &mut Criterion) {
    let app = zoo();
    let host = Host::new();
    host.deploy(app).expect("deploy");
    c.bench_function("host_service", |b| {
        b.iter(|| {
            let sink = CapturedResponse::new();
            let exchange = Exchange::new(HttpRequest::get("/zoo/animals/123"), sink.response(1024));
            let done = host
                .service(exchange)
                .expect("routed")
                .wait()
                .expect("completed");
            black_box(done.status());
        })
    });
}

criterion_group!(benches, bench_resolve, bench_service);
criterion_main!(benches);
