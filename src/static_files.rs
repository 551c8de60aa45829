//! Built-in handler serving an application's resources as static content.
//!
//! Every started application carries one instance as the fallback for paths
//! no registered pattern matches. Directory paths (trailing `/`) are served
//! through the welcome-file list. Class bytes and `/META-INF/` are never
//! served.

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::Method;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::dispatcher::Dispatch;
use crate::error::UnitError;
use crate::handler::{Handler, UnitConfig};
use crate::resource::{Resource, ResourceProvider};

/// Init parameter holding a comma-separated welcome-file list.
pub const WELCOME_FILES_PARAM: &str = "welcome-files";

const ETAG_CACHE_SIZE: usize = 256;

#[derive(Clone, PartialEq, Eq)]
struct Fingerprint {
    len: Option<u64>,
    modified: Option<SystemTime>,
}

pub struct StaticFiles {
    welcome_files: RwLock<Vec<String>>,
    protected: Vec<String>,
    etags: Mutex<LruCache<String, (Fingerprint, String)>>,
}

impl std::fmt::Debug for StaticFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFiles")
            .field("welcome_files", &*self.welcome_files.read())
            .field("protected", &self.protected)
            .finish()
    }
}

impl Default for StaticFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticFiles {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(ETAG_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            welcome_files: RwLock::new(vec!["index.html".to_string()]),
            protected: Vec::new(),
            etags: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Replace the welcome-file list. An empty list keeps the current one.
    #[must_use]
    pub fn welcome_files(self, files: Vec<String>) -> Self {
        if !files.is_empty() {
            *self.welcome_files.write() = files;
        }
        self
    }

    /// Never serve anything under `prefix`. Compared case-insensitively.
    #[must_use]
    pub fn protect(mut self, prefix: impl Into<String>) -> Self {
        self.protected.push(prefix.into().to_ascii_lowercase());
        self
    }

    fn is_protected(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        self.protected.iter().any(|prefix| {
            lower.starts_with(prefix.as_str()) || format!("{lower}/") == *prefix
        })
    }

    /// The resource `path` is served from, if any.
    pub fn find(&self, resources: &ResourceProvider, path: &str) -> Option<Resource> {
        if self.is_protected(path) {
            debug!(path = %path, "Refusing to serve protected resource");
            return None;
        }
        if path.ends_with('/') {
            let welcome = self.welcome_files.read();
            return welcome
                .iter()
                .find_map(|file| resources.resolve(&format!("{path}{file}")));
        }
        resources.resolve(path)
    }

    fn etag(&self, resource: &Resource, bytes: &[u8]) -> String {
        let fingerprint = Fingerprint {
            len: resource.len(),
            modified: resource.modified(),
        };
        let key = format!("{}:{}", resource.store(), resource.path());
        if let Some((seen, tag)) = self.etags.lock().get(&key) {
            if *seen == fingerprint && fingerprint.modified.is_some() {
                return tag.clone();
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let tag = format!("\"{}\"", URL_SAFE_NO_PAD.encode(hasher.finalize().as_slice()));
        self.etags.lock().put(key, (fingerprint, tag.clone()));
        tag
    }
}

/// Content type by file extension.
pub fn content_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn etag_matches(header: &str, tag: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == tag)
}

impl Handler for StaticFiles {
    fn init(&self, config: &UnitConfig<'_>) -> Result<(), UnitError> {
        if let Some(raw) = config.param(WELCOME_FILES_PARAM) {
            let files: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !files.is_empty() {
                *self.welcome_files.write() = files;
            }
        }
        Ok(())
    }

    fn service(&self, cx: &mut Dispatch<'_>) -> Result<(), UnitError> {
        let method = cx.method().clone();
        if method != Method::GET && method != Method::HEAD {
            cx.set_header("allow", "GET, HEAD");
            return cx.send_error(405, format!("method {method} not allowed"));
        }
        let path = cx.path().to_string();
        let Some(resource) = self.find(cx.resources(), &path) else {
            return cx.send_error(404, format!("no resource at '{path}'"));
        };
        let bytes = resource.read_all()?;
        let tag = self.etag(&resource, &bytes);

        if cx
            .header("if-none-match")
            .is_some_and(|header| etag_matches(header, &tag))
        {
            cx.set_status(304);
            cx.set_header("etag", tag);
            return Ok(());
        }

        cx.set_header("content-type", content_type(resource.path()));
        cx.set_header("content-length", bytes.len().to_string());
        cx.set_header("etag", tag);
        if method == Method::HEAD {
            return Ok(());
        }
        cx.write(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryStore;

    fn resources() -> ResourceProvider {
        ResourceProvider::builder()
            .memory(
                MemoryStore::new("app")
                    .with_entry("/index.html", "<h1>home</h1>")
                    .with_entry("/docs/start.html", "start")
                    .with_entry("/classes/app/Main.class", "secret")
                    .with_entry("/META-INF/manifest.toml", "name = 'x'"),
            )
            .build()
    }

    #[test]
    fn test_welcome_file_for_directory() {
        let files = StaticFiles::new();
        let found = files.find(&resources(), "/").unwrap();
        assert_eq!(found.path(), "/index.html");
        assert!(files.find(&resources(), "/docs/").is_none());
        let files = StaticFiles::new().welcome_files(vec!["start.html".into()]);
        assert_eq!(files.find(&resources(), "/docs/").unwrap().path(), "/docs/start.html");
    }

    #[test]
    fn test_protected_prefixes_hidden() {
        let files = StaticFiles::new().protect("/classes/").protect("/META-INF/");
        let res = resources();
        assert!(files.find(&res, "/classes/app/Main.class").is_none());
        assert!(files.find(&res, "/meta-inf/manifest.toml").is_none());
        assert!(files.find(&res, "/docs/start.html").is_some());
    }

    #[test]
    fn test_etag_list_matching() {
        assert!(etag_matches("\"a\", \"b\"", "\"b\""));
        assert!(etag_matches("W/\"b\"", "\"b\""));
        assert!(etag_matches("*", "\"z\""));
        assert!(!etag_matches("\"a\"", "\"b\""));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type("/a/b.HTML"), "text/html; charset=utf-8");
        assert_eq!(content_type("/logo.png"), "image/png");
        assert_eq!(content_type("/blob"), "application/octet-stream");
    }
}
