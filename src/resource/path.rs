//! Logical path normalization.
//!
//! Every lookup goes through [`normalize`]. Traversal segments make a path
//! unresolvable rather than an error: the caller simply sees *absent*.

/// Normalize a logical resource path.
///
/// - a missing leading `/` is added
/// - empty and `.` segments are dropped, so `//a/./b` becomes `/a/b`
/// - a trailing `/` is dropped (`/` itself stays `/`)
/// - `..` segments, their percent-encoded forms, backslash-separated
///   traversal and NUL bytes yield `None`
#[must_use]
pub fn normalize(path: &str) -> Option<String> {
    if path.contains('\0') {
        return None;
    }
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if is_encoded_traversal(s) => return None,
            s => {
                out.push('/');
                out.push_str(s);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

fn is_encoded_traversal(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "%2e%2e" | ".%2e" | "%2e." | "%2e"
    ) || lower.contains("%2f")
        || lower.contains("%5c")
}

/// Split a normalized path into its non-empty segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_leading_slash() {
        assert_eq!(normalize("index.html").as_deref(), Some("/index.html"));
    }

    #[test]
    fn test_collapses_redundant_segments() {
        assert_eq!(normalize("//a/./b/").as_deref(), Some("/a/b"));
        assert_eq!(normalize("").as_deref(), Some("/"));
        assert_eq!(normalize("/").as_deref(), Some("/"));
    }

    #[test]
    fn test_traversal_is_absent() {
        assert!(normalize("../Cargo.toml").is_none());
        assert!(normalize("/a/../../etc/passwd").is_none());
        assert!(normalize("..\\Cargo.toml").is_none());
        assert!(normalize("/a/%2e%2e/b").is_none());
        assert!(normalize("/a/..%2fb").is_none());
        assert!(normalize("/a\0b").is_none());
    }

    #[test]
    fn test_dots_inside_names_are_fine() {
        assert_eq!(normalize("/a/..b/c..").as_deref(), Some("/a/..b/c.."));
    }
}
