//! Boundary adapters between the `http` crate's types and the engine's
//! request/response abstractions.

use std::io;

use http::header::{HeaderName, HeaderValue};
use tracing::warn;

use super::headers::Headers;
use super::request::HttpRequest;
use super::response::{Captured, CapturedResponse};
use crate::dispatcher::{Exchange, Service};
use crate::error::DispatchError;
use crate::runtime_config::EngineConfig;

/// Convert an `http::Request` into an owned [`HttpRequest`]. Header values
/// that are not visible ASCII are dropped.
pub fn request_from_http<B: Into<Vec<u8>>>(req: http::Request<B>) -> HttpRequest {
    let (parts, body) = req.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    let mut headers = Headers::new();
    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(v) => headers.append(name.as_str(), v),
            Err(_) => warn!(header = %name, "Dropping non-ASCII request header value"),
        }
    }

    HttpRequest::new(parts.method, &target)
        .with_headers(headers)
        .with_body(body)
}

/// Build an `http::Response` from a captured response. An uncommitted
/// capture yields a bare 500.
pub fn response_to_http(captured: Captured) -> Result<http::Response<Vec<u8>>, http::Error> {
    let status = captured.status.unwrap_or(500);
    let mut builder = http::Response::builder().status(status);
    for (name, value) in captured.headers.iter() {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!(header = %name, "Dropping invalid response header");
            continue;
        };
        builder = builder.header(name, value);
    }
    builder.body(captured.body)
}

/// Wrap an `http::Request` in an [`Exchange`] writing into a capture.
pub fn exchange_from_http<B: Into<Vec<u8>>>(
    req: http::Request<B>,
    buffer_size: usize,
) -> (Exchange, CapturedResponse) {
    let capture = CapturedResponse::new();
    let exchange = Exchange::new(request_from_http(req), capture.response(buffer_size));
    (exchange, capture)
}

/// Serve one `http::Request` end to end, waiting out any suspension.
///
/// The response buffer takes the serving application's
/// `response_buffer_size`.
pub fn serve_http<B: Into<Vec<u8>>>(
    service: &dyn Service,
    req: http::Request<B>,
) -> Result<http::Response<Vec<u8>>, DispatchError> {
    let (exchange, capture) =
        exchange_from_http(req, EngineConfig::default().response_buffer_size);
    service.service(exchange)?.wait()?;
    response_to_http(capture.snapshot()).map_err(|e| DispatchError::Io(io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::server::RawRequest;

    #[test]
    fn test_request_conversion_keeps_target_and_headers() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/shop/items?limit=2")
            .header("X-Trace", "abc")
            .body("payload")
            .unwrap();
        let mut converted = request_from_http(req);
        assert_eq!(*converted.method(), http::Method::POST);
        assert_eq!(converted.path(), "/shop/items");
        assert_eq!(converted.query(), Some("limit=2"));
        assert_eq!(converted.headers().get("x-trace"), Some("abc"));
        let mut body = String::new();
        converted.body().read_to_string(&mut body).unwrap();
        assert_eq!(body, "payload");
    }

    #[test]
    fn test_response_conversion() {
        let mut headers = Headers::new();
        headers.append("content-type", "text/plain");
        let captured = Captured {
            status: Some(201),
            headers,
            body: b"made".to_vec(),
            finished: true,
        };
        let resp = response_to_http(captured).unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(resp.body(), b"made");
    }

    #[test]
    fn test_uncommitted_capture_is_500() {
        let resp = response_to_http(Captured::default()).unwrap();
        assert_eq!(resp.status(), 500);
    }
}
