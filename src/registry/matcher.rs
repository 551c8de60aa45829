//! URL matcher: maps an application-relative path to exactly one handler.
//!
//! Tiers are tried in strict order and the first hit wins:
//!
//! 1. **Exact**: the path equals an exact pattern verbatim.
//! 2. **Longest prefix**: among `/p/*` patterns whose prefix is a
//!    segment-aligned leading part of the path, the one with the most
//!    segments. Prefixes live in a segment tree so the walk is O(k) in the
//!    number of path segments.
//! 3. **Extension**: the text after the last dot of the last segment.
//! 4. **Default**: the `/` pattern.
//!
//! Permanently unavailable handlers are invisible to every tier; the walk
//! simply continues as if their patterns were never registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use super::handler::HandlerRegistration;
use super::pattern::{extension_of, PatternKind, UrlPattern};

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    Exact,
    Prefix,
    Extension,
    Default,
    /// No handler matched and a static resource was found instead.
    Static,
}

impl From<PatternKind> for MatchKind {
    fn from(kind: PatternKind) -> Self {
        match kind {
            PatternKind::Exact => MatchKind::Exact,
            PatternKind::Prefix => MatchKind::Prefix,
            PatternKind::Extension => MatchKind::Extension,
            PatternKind::Default => MatchKind::Default,
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchKind::Exact => "exact",
            MatchKind::Prefix => "prefix",
            MatchKind::Extension => "extension",
            MatchKind::Default => "default",
            MatchKind::Static => "static",
        })
    }
}

/// Result of [`UrlMatcher::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub handler: Arc<HandlerRegistration>,
    /// The pattern that matched; `None` for static fallback.
    pub pattern: Option<UrlPattern>,
    pub kind: MatchKind,
    /// Part of the path the pattern consumed.
    pub handler_path: String,
    /// Remainder after a prefix match, e.g. `/bar` for `/foo/*` on `/foo/bar`.
    pub path_info: Option<String>,
}

impl Resolution {
    #[must_use]
    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    /// Resolution for content served by the static fallback handler.
    pub(crate) fn fallback(handler: Arc<HandlerRegistration>, path: &str) -> Self {
        Self {
            handler,
            pattern: None,
            kind: MatchKind::Static,
            handler_path: path.to_string(),
            path_info: None,
        }
    }
}

/// One segment of a prefix pattern.
#[derive(Debug, Default)]
struct PrefixNode {
    segment: String,
    /// Handler index when a prefix pattern ends at this node
    handler: Option<usize>,
    /// The full prefix string, kept for `handler_path`
    prefix: String,
    children: Vec<PrefixNode>,
}

impl PrefixNode {
    fn insert(&mut self, segments: &[&str], prefix: &str, handler: usize) {
        let Some((first, rest)) = segments.split_first() else {
            if self.handler.is_none() {
                self.handler = Some(handler);
                self.prefix = prefix.to_string();
            }
            return;
        };
        let idx = match self.children.iter().position(|c| c.segment == *first) {
            Some(idx) => idx,
            None => {
                self.children.push(PrefixNode {
                    segment: (*first).to_string(),
                    ..PrefixNode::default()
                });
                self.children.len() - 1
            }
        };
        self.children[idx].insert(rest, prefix, handler);
    }

    /// Nodes carrying a handler along the path, shallowest first.
    fn collect<'a>(&'a self, path: &str, out: &mut SmallVec<[&'a PrefixNode; 8]>) {
        if self.handler.is_some() {
            out.push(self);
        }
        let mut node = self;
        for segment in path.split('/').skip(1) {
            match node.children.iter().find(|c| c.segment == segment) {
                Some(child) => {
                    if child.handler.is_some() {
                        out.push(child);
                    }
                    node = child;
                }
                None => break,
            }
        }
    }
}

/// Immutable lookup structure built when an application starts.
pub struct UrlMatcher {
    handlers: Vec<Arc<HandlerRegistration>>,
    exact: HashMap<String, usize>,
    prefixes: PrefixNode,
    extensions: HashMap<String, usize>,
    default: Option<usize>,
    pattern_count: usize,
}

impl fmt::Debug for UrlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlMatcher")
            .field("handlers", &self.handlers.len())
            .field("exact", &self.exact.len())
            .field("extensions", &self.extensions.len())
            .field("default", &self.default)
            .finish()
    }
}

impl UrlMatcher {
    /// Build a matcher from handlers whose patterns were already checked for
    /// conflicts. When two handlers share a pattern anyway, the earlier one wins.
    #[must_use]
    pub fn new(handlers: Vec<Arc<HandlerRegistration>>) -> Self {
        let mut exact = HashMap::new();
        let mut prefixes = PrefixNode::default();
        let mut extensions = HashMap::new();
        let mut default = None;
        let mut pattern_count = 0;

        for (idx, handler) in handlers.iter().enumerate() {
            for pattern in handler.url_patterns() {
                pattern_count += 1;
                match pattern {
                    UrlPattern::Exact(p) => {
                        exact.entry(p.clone()).or_insert(idx);
                    }
                    UrlPattern::Prefix(p) => {
                        let segments: Vec<&str> = p.split('/').skip(1).collect();
                        prefixes.insert(&segments, p, idx);
                    }
                    UrlPattern::Extension(e) => {
                        extensions.entry(e.clone()).or_insert(idx);
                    }
                    UrlPattern::Default => {
                        default.get_or_insert(idx);
                    }
                }
            }
        }

        info!(
            handlers = handlers.len(),
            patterns = pattern_count,
            exact = exact.len(),
            extensions = extensions.len(),
            has_default = default.is_some(),
            "URL matcher built"
        );

        Self {
            handlers,
            exact,
            prefixes,
            extensions,
            default,
            pattern_count,
        }
    }

    #[must_use]
    pub fn handlers(&self) -> &[Arc<HandlerRegistration>] {
        &self.handlers
    }

    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    fn usable(&self, idx: usize) -> Option<&Arc<HandlerRegistration>> {
        self.handlers
            .get(idx)
            .filter(|h| !h.availability().is_permanent())
    }

    /// Resolve an application-relative path.
    ///
    /// Returns `None` when no tier matches; the caller then tries static
    /// content and finally reports not found.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Resolution> {
        let started = Instant::now();
        debug!(path = %path, "Handler match attempt");

        let found = self.resolve_inner(path);

        match &found {
            Some(res) => debug!(
                path = %path,
                handler_name = %res.handler_name(),
                match_kind = %res.kind,
                duration_us = started.elapsed().as_micros() as u64,
                "Handler matched"
            ),
            None => warn!(
                path = %path,
                duration_us = started.elapsed().as_micros() as u64,
                "No handler matched"
            ),
        }
        found
    }

    fn resolve_inner(&self, path: &str) -> Option<Resolution> {
        if let Some(handler) = self.exact.get(path).and_then(|idx| self.usable(*idx)) {
            return Some(Resolution {
                handler: Arc::clone(handler),
                pattern: Some(UrlPattern::Exact(path.to_string())),
                kind: MatchKind::Exact,
                handler_path: path.to_string(),
                path_info: None,
            });
        }

        let mut candidates: SmallVec<[&PrefixNode; 8]> = SmallVec::new();
        self.prefixes.collect(path, &mut candidates);
        for node in candidates.iter().rev() {
            let Some(handler) = node.handler.and_then(|idx| self.usable(idx)) else {
                continue;
            };
            let rest = &path[node.prefix.len().min(path.len())..];
            return Some(Resolution {
                handler: Arc::clone(handler),
                pattern: Some(UrlPattern::Prefix(node.prefix.clone())),
                kind: MatchKind::Prefix,
                handler_path: node.prefix.clone(),
                path_info: (!rest.is_empty()).then(|| rest.to_string()),
            });
        }

        if let Some(ext) = extension_of(path) {
            if let Some(handler) = self.extensions.get(ext).and_then(|idx| self.usable(*idx)) {
                return Some(Resolution {
                    handler: Arc::clone(handler),
                    pattern: Some(UrlPattern::Extension(ext.to_string())),
                    kind: MatchKind::Extension,
                    handler_path: path.to_string(),
                    path_info: None,
                });
            }
        }

        let handler = self.default.and_then(|idx| self.usable(idx))?;
        Some(Resolution {
            handler: Arc::clone(handler),
            pattern: Some(UrlPattern::Default),
            kind: MatchKind::Default,
            handler_path: path.to_string(),
            path_info: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn reg(name: &str, patterns: &[&str]) -> Arc<HandlerRegistration> {
        let mut h = HandlerRegistration::new(name, handler_fn(|_cx| Ok(())));
        for raw in patterns {
            h.push_pattern(UrlPattern::parse(raw).unwrap());
        }
        Arc::new(h)
    }

    fn matcher() -> UrlMatcher {
        UrlMatcher::new(vec![
            reg("exact", &["/foo/bar"]),
            reg("foo", &["/foo/*"]),
            reg("foobar", &["/foo/bar/*"]),
            reg("json", &["*.json"]),
            reg("root", &["/"]),
        ])
    }

    #[test]
    fn test_exact_beats_prefix() {
        let m = matcher();
        assert_eq!(m.resolve("/foo/bar").unwrap().handler_name(), "exact");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let m = matcher();
        let res = m.resolve("/foo/bar/baz").unwrap();
        assert_eq!(res.handler_name(), "foobar");
        assert_eq!(res.handler_path, "/foo/bar");
        assert_eq!(res.path_info.as_deref(), Some("/baz"));
        assert_eq!(m.resolve("/foo/qux").unwrap().handler_name(), "foo");
    }

    #[test]
    fn test_prefix_edge_cases() {
        let m = matcher();
        let bare = m.resolve("/foo").unwrap();
        assert_eq!(bare.handler_name(), "foo");
        assert_eq!(bare.path_info, None);
        let slash = m.resolve("/foo/").unwrap();
        assert_eq!(slash.handler_name(), "foo");
        assert_eq!(slash.path_info.as_deref(), Some("/"));
        assert_eq!(m.resolve("/foobar").unwrap().handler_name(), "root");
    }

    #[test]
    fn test_prefix_beats_extension() {
        let m = matcher();
        assert_eq!(m.resolve("/foo/x.json").unwrap().handler_name(), "foo");
        assert_eq!(m.resolve("/other/x.json").unwrap().kind, MatchKind::Extension);
    }

    #[test]
    fn test_root_prefix_shadows_default() {
        let m = UrlMatcher::new(vec![reg("all", &["/*"]), reg("root", &["/"])]);
        let res = m.resolve("/").unwrap();
        assert_eq!(res.handler_name(), "all");
        assert_eq!(res.path_info.as_deref(), Some("/"));
    }

    #[test]
    fn test_no_default_means_no_match() {
        let m = UrlMatcher::new(vec![reg("json", &["*.json"])]);
        assert!(m.resolve("/items/42").is_none());
    }

    #[test]
    fn test_permanently_unavailable_is_skipped() {
        let m = matcher();
        m.handlers()[2]
            .availability()
            .mark_unavailable(std::time::Duration::ZERO, None);
        assert_eq!(m.resolve("/foo/bar/baz").unwrap().handler_name(), "foo");
    }
}
