//! Backing stores a [`ResourceProvider`](super::ResourceProvider) consults.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::path::{normalize, segments};

/// Where a resource's bytes come from.
#[derive(Debug, Clone)]
enum Content {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// A resolved resource. Bytes are read lazily through [`Resource::open`].
#[derive(Debug, Clone)]
pub struct Resource {
    path: String,
    store: Arc<str>,
    content: Content,
}

impl Resource {
    /// Logical path the resource was resolved under.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Label of the store that answered the lookup.
    #[must_use]
    pub fn store(&self) -> &str {
        &self.store
    }

    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match &self.content {
            Content::File(p) => fs::metadata(p).ok().map(|m| m.len()),
            Content::Memory(b) => Some(b.len() as u64),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    #[must_use]
    pub fn modified(&self) -> Option<SystemTime> {
        match &self.content {
            Content::File(p) => fs::metadata(p).and_then(|m| m.modified()).ok(),
            Content::Memory(_) => None,
        }
    }

    /// Open a fresh byte stream over the resource.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.content {
            Content::File(p) => Ok(Box::new(fs::File::open(p)?)),
            Content::Memory(b) => Ok(Box::new(Cursor::new(Arc::clone(b)))),
        }
    }

    /// Read the whole resource into memory.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        match &self.content {
            Content::File(p) => fs::read(p),
            Content::Memory(b) => Ok(b.to_vec()),
        }
    }

    fn relocated(mut self, path: String) -> Self {
        self.path = path;
        self
    }
}

/// One ordered source of resources.
///
/// `resolve` receives a path already normalized by the provider.
pub trait ResourceStore: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;
    fn resolve(&self, path: &str) -> Option<Resource>;
    /// Every logical path this store can resolve. Must be finite; each call
    /// starts over.
    fn list(&self) -> Vec<String>;
}

/// A directory tree on disk.
#[derive(Debug)]
pub struct DirectoryStore {
    label: Arc<str>,
    base_dir: PathBuf,
    canonical_base: Option<PathBuf>,
}

impl DirectoryStore {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        let base_dir = base.into();
        let label: Arc<str> = Arc::from(format!("dir:{}", base_dir.display()));
        let canonical_base = fs::canonicalize(&base_dir).ok();
        if canonical_base.is_none() {
            warn!(base_dir = %base_dir.display(), "Directory store base does not exist yet");
        }
        Self {
            label,
            base_dir,
            canonical_base,
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn map_path(&self, path: &str) -> PathBuf {
        let mut pb = self.base_dir.clone();
        for segment in segments(path) {
            pb.push(segment);
        }
        pb
    }

    /// Symlinks must not lead outside the base directory.
    fn contained(&self, candidate: &Path) -> bool {
        let base = match &self.canonical_base {
            Some(b) => b.clone(),
            None => match fs::canonicalize(&self.base_dir) {
                Ok(b) => b,
                Err(_) => return false,
            },
        };
        fs::canonicalize(candidate)
            .map(|c| c.starts_with(&base))
            .unwrap_or(false)
    }
}

impl ResourceStore for DirectoryStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn resolve(&self, path: &str) -> Option<Resource> {
        let candidate = self.map_path(path);
        if !candidate.is_file() {
            return None;
        }
        if !self.contained(&candidate) {
            warn!(
                store = %self.label,
                path = %path,
                "Resource escapes directory store through a link"
            );
            return None;
        }
        Some(Resource {
            path: path.to_string(),
            store: Arc::clone(&self.label),
            content: Content::File(candidate),
        })
    }

    fn list(&self) -> Vec<String> {
        let mut paths: Vec<String> = WalkDir::new(&self.base_dir)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    debug!(store = %self.label, error = %err, "Skipping unreadable entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&self.base_dir).ok()?;
                let joined = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                normalize(&joined)
            })
            .collect();
        paths.sort();
        paths
    }
}

/// An archive whose entries are already held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    label: Arc<str>,
    entries: BTreeMap<String, Arc<[u8]>>,
}

impl MemoryStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            entries: BTreeMap::new(),
        }
    }

    /// Add an entry. Entries with traversal segments are skipped.
    pub fn insert(&mut self, path: &str, bytes: impl Into<Vec<u8>>) -> &mut Self {
        match normalize(path) {
            Some(p) => {
                self.entries.insert(p, Arc::from(bytes.into()));
            }
            None => warn!(store = %self.label, path = %path, "Ignoring unsafe archive entry"),
        }
        self
    }

    #[must_use]
    pub fn with_entry(mut self, path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(path, bytes);
        self
    }
}

impl ResourceStore for MemoryStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn resolve(&self, path: &str) -> Option<Resource> {
        self.entries.get(path).map(|bytes| Resource {
            path: path.to_string(),
            store: Arc::clone(&self.label),
            content: Content::Memory(Arc::clone(bytes)),
        })
    }

    fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Mounts another store under a sub-tree, e.g. `/docs` → some directory.
#[derive(Debug)]
pub struct AliasStore {
    label: String,
    mount: String,
    inner: Arc<dyn ResourceStore>,
}

impl AliasStore {
    /// `mount` is normalized; `/` mounts at the root.
    pub fn new(mount: &str, inner: Arc<dyn ResourceStore>) -> Self {
        let mount = normalize(mount).unwrap_or_else(|| "/".to_string());
        let label = format!("alias:{}=>{}", mount, inner.label());
        Self {
            label,
            mount,
            inner,
        }
    }

    fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.mount == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.mount.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

impl ResourceStore for AliasStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn resolve(&self, path: &str) -> Option<Resource> {
        let inner_path = self.strip(path)?;
        self.inner
            .resolve(inner_path)
            .map(|r| r.relocated(path.to_string()))
    }

    fn list(&self) -> Vec<String> {
        self.inner
            .list()
            .into_iter()
            .map(|p| {
                if self.mount == "/" {
                    p
                } else {
                    format!("{}{}", self.mount, p)
                }
            })
            .collect()
    }
}
