use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::ClassNotFound;

/// A defined class: its name, its bytes, and the loader that defined it.
///
/// Identity is the `Arc` itself. Two loaders defining the same name yield two
/// distinct classes, which is what keeps applications apart.
pub struct Class {
    name: String,
    defined_by: Arc<str>,
    bytes: Arc<[u8]>,
    digest: String,
}

impl Class {
    pub fn define(name: &str, defined_by: &str, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        let mut hasher = Sha256::new();
        hasher.update(&bytes[..]);
        let digest = URL_SAFE_NO_PAD.encode(hasher.finalize().as_slice());
        Self {
            name: name.to_string(),
            defined_by: Arc::from(defined_by),
            bytes,
            digest,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the loader that defined this class.
    #[must_use]
    pub fn defined_by(&self) -> &str {
        &self.defined_by
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// SHA-256 of the bytes, base64url without padding.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("defined_by", &self.defined_by)
            .field("len", &self.bytes.len())
            .field("digest", &self.digest)
            .finish()
    }
}

/// Anything a loader can delegate to.
pub trait ClassSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn load_class(&self, name: &str) -> Result<Arc<Class>, ClassNotFound>;
}

/// A fixed set of classes defined up front. Plays the role of the shared
/// (server-level) loader that applications delegate to.
#[derive(Debug)]
pub struct MemoryClassSource {
    name: String,
    classes: HashMap<String, Arc<Class>>,
}

impl MemoryClassSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_class(mut self, class_name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let class = Class::define(class_name, &self.name, bytes);
        self.classes.insert(class_name.to_string(), Arc::new(class));
        self
    }
}

impl ClassSource for MemoryClassSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_class(&self, name: &str) -> Result<Arc<Class>, ClassNotFound> {
        self.classes
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| ClassNotFound {
                name: name.to_string(),
                loader: self.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = Class::define("app.Main", "l1", b"abc".to_vec());
        let b = Class::define("app.Main", "l2", b"abc".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.defined_by(), b.defined_by());
    }

    #[test]
    fn test_memory_source_returns_same_class() {
        let src = MemoryClassSource::new("shared").with_class("lib.Util", "u");
        let first = src.load_class("lib.Util").unwrap();
        let second = src.load_class("lib.Util").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(src.load_class("lib.Missing").is_err());
    }
}
