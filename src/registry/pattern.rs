use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ConfigError;

static EXTENSION_RE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_~+\-]+$"));

/// Which tier of the matching algorithm a pattern belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternKind {
    Exact,
    Prefix,
    Extension,
    Default,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatternKind::Exact => "exact",
            PatternKind::Prefix => "prefix",
            PatternKind::Extension => "extension",
            PatternKind::Default => "default",
        })
    }
}

/// A parsed URL pattern.
///
/// | pattern   | kind        | stored as |
/// |-----------|-------------|-----------|
/// | `/a/b`    | exact       | `/a/b`    |
/// | `/a/*`    | path prefix | `/a`      |
/// | `/*`      | path prefix | `` (root) |
/// | `*.json`  | extension   | `json`    |
/// | `/`       | default     |           |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UrlPattern {
    Exact(String),
    Prefix(String),
    Extension(String),
    Default,
}

impl UrlPattern {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("pattern contains whitespace"));
        }
        if raw == "/" {
            return Ok(UrlPattern::Default);
        }
        if let Some(ext) = raw.strip_prefix("*.") {
            let valid = match &*EXTENSION_RE {
                Ok(re) => re.is_match(ext),
                Err(_) => false,
            };
            if !valid {
                return Err(invalid(
                    "extension must be non-empty and may not contain '.', '/' or '*'",
                ));
            }
            return Ok(UrlPattern::Extension(ext.to_string()));
        }
        if !raw.starts_with('/') {
            return Err(invalid("pattern must start with '/' or '*.'"));
        }
        if let Some(prefix) = raw.strip_suffix("/*") {
            if prefix.contains('*') {
                return Err(invalid("'*' is only allowed as a trailing '/*' or a leading '*.'"));
            }
            if prefix.contains("//") || prefix.ends_with('/') {
                return Err(invalid("pattern contains an empty segment"));
            }
            return Ok(UrlPattern::Prefix(prefix.to_string()));
        }
        if raw.contains('*') {
            return Err(invalid("'*' is only allowed as a trailing '/*' or a leading '*.'"));
        }
        Ok(UrlPattern::Exact(raw.to_string()))
    }

    #[must_use]
    pub fn kind(&self) -> PatternKind {
        match self {
            UrlPattern::Exact(_) => PatternKind::Exact,
            UrlPattern::Prefix(_) => PatternKind::Prefix,
            UrlPattern::Extension(_) => PatternKind::Extension,
            UrlPattern::Default => PatternKind::Default,
        }
    }

    /// Does `path` match this pattern on its own?
    ///
    /// The default pattern never matches here: whether it applies depends on
    /// how the whole request was resolved, not on the path.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlPattern::Exact(p) => p == path,
            UrlPattern::Prefix(prefix) => prefix_matches(prefix, path),
            UrlPattern::Extension(ext) => extension_of(path) == Some(ext.as_str()),
            UrlPattern::Default => false,
        }
    }

    /// Number of path segments in a prefix pattern, used to rank prefixes.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        match self {
            UrlPattern::Exact(p) | UrlPattern::Prefix(p) => {
                p.split('/').filter(|s| !s.is_empty()).count()
            }
            _ => 0,
        }
    }
}

impl FromStr for UrlPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UrlPattern::parse(s)
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Exact(p) => f.write_str(p),
            UrlPattern::Prefix(p) => write!(f, "{p}/*"),
            UrlPattern::Extension(e) => write!(f, "*.{e}"),
            UrlPattern::Default => f.write_str("/"),
        }
    }
}

/// Segment-aligned prefix test: `/foo` matches `/foo`, `/foo/` and
/// `/foo/bar`, never `/foobar`.
pub(crate) fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Text after the last dot of the last segment, if that segment has a dot.
pub(crate) fn extension_of(path: &str) -> Option<&str> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_four_kinds() {
        assert_eq!(UrlPattern::parse("/echo").unwrap(), UrlPattern::Exact("/echo".into()));
        assert_eq!(UrlPattern::parse("/foo/*").unwrap(), UrlPattern::Prefix("/foo".into()));
        assert_eq!(UrlPattern::parse("/*").unwrap(), UrlPattern::Prefix(String::new()));
        assert_eq!(UrlPattern::parse("*.json").unwrap(), UrlPattern::Extension("json".into()));
        assert_eq!(UrlPattern::parse("/").unwrap(), UrlPattern::Default);
    }

    #[test]
    fn test_invalid_patterns() {
        for raw in ["", "echo", "/a/*/b", "*.", "*.tar.gz", "/a b", "/fo*", "*/x", "//*"] {
            assert!(
                matches!(UrlPattern::parse(raw), Err(ConfigError::InvalidPattern { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_display_round_trips_source() {
        for raw in ["/echo", "/foo/*", "/*", "*.json", "/"] {
            assert_eq!(UrlPattern::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_prefix_is_segment_aligned() {
        let p = UrlPattern::parse("/foo/*").unwrap();
        assert!(p.matches("/foo"));
        assert!(p.matches("/foo/"));
        assert!(p.matches("/foo/bar"));
        assert!(!p.matches("/foobar"));
    }

    #[test]
    fn test_extension_needs_dot_in_last_segment() {
        let p = UrlPattern::parse("*.json").unwrap();
        assert!(p.matches("/items/42.json"));
        assert!(!p.matches("/items.json/42"));
        assert!(!p.matches("/items/42"));
        assert_eq!(extension_of("/a/b."), None);
    }
}
