use std::fmt;
use std::io::{self, Cursor, Read};

use http::Method;

use super::headers::Headers;

/// Inbound request as the connection layer hands it to the engine.
///
/// The engine never parses bytes off a socket; a front-end implements this
/// over whatever connection object it has.
pub trait RawRequest: Send {
    fn method(&self) -> &Method;
    /// Path without the query string, e.g. `/shop/items/42.json`.
    fn path(&self) -> &str;
    /// Raw query string without the leading `?`.
    fn query(&self) -> Option<&str>;
    fn headers(&self) -> &Headers;
    /// Request body stream. Each byte can be read once.
    fn body(&mut self) -> &mut dyn Read;
}

/// Owned [`RawRequest`] used by the adapters and by tests.
pub struct HttpRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Box<dyn Read + Send>,
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .finish()
    }
}

impl HttpRequest {
    /// Build from a request target such as `/items?limit=10`.
    #[must_use]
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path: path.to_string(),
            query: query.map(str::to_string),
            headers: Headers::new(),
            body: Box::new(io::empty()),
        }
    }

    #[must_use]
    pub fn get(target: &str) -> Self {
        Self::new(Method::GET, target)
    }

    #[must_use]
    pub fn post(target: &str) -> Self {
        Self::new(Method::POST, target)
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Box::new(Cursor::new(bytes.into()));
        self
    }

    #[must_use]
    pub fn with_reader(mut self, reader: impl Read + Send + 'static) -> Self {
        self.body = Box::new(reader);
        self
    }
}

impl RawRequest for HttpRequest {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.body
    }
}

/// Split `path?query` into its parts. An empty query is `None`.
#[must_use]
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path, Some(query)),
        Some((path, _)) => (path, None),
        None => (target, None),
    }
}

/// Decode a query string into ordered `(name, value)` pairs.
#[must_use]
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
