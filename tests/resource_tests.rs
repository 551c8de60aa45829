#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::sync::Arc;

use brrtcontainer::resource::{AliasStore, DirectoryStore, MemoryStore, ResourceProvider, ResourceStore};
use tempfile::TempDir;

fn site() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("css")).unwrap();
    fs::write(dir.path().join("index.html"), "<h1>disk</h1>").unwrap();
    fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
    dir
}

#[test]
fn test_directory_store_serves_files() {
    let dir = site();
    let provider = ResourceProvider::builder().directory(dir.path()).build();

    let index = provider.resolve("/index.html").unwrap();
    assert_eq!(index.read_all().unwrap(), b"<h1>disk</h1>");
    assert_eq!(index.len(), Some(13));
    assert!(index.modified().is_some());
    assert!(provider.exists("css/site.css"));
    assert!(provider.exists("//css/./site.css"));
    // Directories are not resources.
    assert!(!provider.exists("/css"));
    assert_eq!(provider.list(), vec!["/css/site.css", "/index.html"]);
}

#[test]
fn test_traversal_never_leaves_the_store() {
    let outer = tempfile::tempdir().unwrap();
    fs::write(outer.path().join("secret.txt"), "secret").unwrap();
    let root = outer.path().join("root");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("public.txt"), "public").unwrap();

    let provider = ResourceProvider::builder().directory(&root).build();
    assert!(provider.exists("/public.txt"));
    for attempt in [
        "/../secret.txt",
        "/a/../../secret.txt",
        "/%2e%2e/secret.txt",
        "/..%2fsecret.txt",
        "\\..\\secret.txt",
    ] {
        assert!(provider.resolve(attempt).is_none(), "{attempt}");
    }
}

#[cfg(unix)]
#[test]
fn test_symlink_out_of_the_store_is_absent() {
    let outer = tempfile::tempdir().unwrap();
    fs::write(outer.path().join("secret.txt"), "secret").unwrap();
    let root = outer.path().join("root");
    fs::create_dir_all(&root).unwrap();
    std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.txt")).unwrap();

    let provider = ResourceProvider::builder().directory(&root).build();
    assert!(provider.resolve("/link.txt").is_none());
}

#[test]
fn test_stores_are_consulted_in_order() {
    let dir = site();
    let overlay = MemoryStore::new("overlay").with_entry("/index.html", "<h1>memory</h1>");
    let provider = ResourceProvider::builder()
        .memory(overlay)
        .directory(dir.path())
        .cache_size(16)
        .build();

    let index = provider.resolve("/index.html").unwrap();
    assert_eq!(index.store(), "overlay");
    assert_eq!(index.read_all().unwrap(), b"<h1>memory</h1>");
    // Cached answers stay consistent.
    assert_eq!(provider.resolve("/index.html").unwrap().store(), "overlay");
    assert!(provider.resolve("/css/site.css").unwrap().store().starts_with("dir:"));
    assert_eq!(provider.store_labels().len(), 2);
}

#[test]
fn test_alias_mounts_a_store_under_a_subtree() {
    let dir = site();
    let docs: Arc<dyn ResourceStore> = Arc::new(DirectoryStore::new(dir.path()));
    let provider = ResourceProvider::builder()
        .memory(MemoryStore::new("app").with_entry("/index.html", "app"))
        .alias("/docs", docs)
        .build();

    let res = provider.resolve("/docs/css/site.css").unwrap();
    assert_eq!(res.path(), "/docs/css/site.css");
    assert_eq!(res.read_all().unwrap(), b"body{}");
    assert!(provider.resolve("/docsx/index.html").is_none());
    assert_eq!(
        provider.list(),
        vec!["/index.html", "/docs/css/site.css", "/docs/index.html"]
    );
}

#[test]
fn test_alias_store_standalone_label() {
    let inner: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new("lib").with_entry("/a.txt", "a"));
    let alias = AliasStore::new("static/", inner);
    assert_eq!(alias.label(), "alias:/static=>lib");
    assert!(alias.resolve("/static/a.txt").is_some());
    assert!(alias.resolve("/a.txt").is_none());
}

#[test]
fn test_release_stops_answering() {
    let dir = site();
    let provider = ResourceProvider::builder().directory(dir.path()).build();
    assert!(provider.exists("/index.html"));
    provider.release();
    assert!(provider.is_released());
    assert!(!provider.exists("/index.html"));
    assert!(provider.list().is_empty());
}
