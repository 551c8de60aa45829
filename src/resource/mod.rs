//! # Resource Provider
//!
//! Resolves logical paths (`/index.html`, `/classes/app/Main.class`) to byte
//! content across an ordered list of backing stores. The same provider serves
//! static content and the class bytes read by the
//! [`IsolatingClassLoader`](crate::loader::IsolatingClassLoader).
//!
//! Paths are normalized before lookup; anything that tries to climb out of the
//! store root is treated as absent.

mod path;
mod provider;
mod store;

pub use path::normalize;
pub use provider::{ResourceProvider, ResourceProviderBuilder};
pub use store::{AliasStore, DirectoryStore, MemoryStore, Resource, ResourceStore};
