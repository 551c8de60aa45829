//! # Class Loading
//!
//! Every application gets an [`IsolatingClassLoader`] reading class bytes
//! from its own resources (`/classes/a/b/C.class` for `a.b.C`) and
//! delegating to shared [`ClassSource`]s. The default child-first policy
//! lets two applications carry different copies of the same library; the
//! engine's own classes are always reachable through the last delegate.
//!
//! Class-backed registrations are turned into instances by the
//! application's [`Instantiator`].

mod class;
mod class_loader;
mod instantiate;

pub use class::{Class, ClassSource, MemoryClassSource};
pub use class_loader::{
    ClassLoaderBuilder, DelegationPolicy, IsolatingClassLoader, CLASS_EXTENSION,
    DEFAULT_CLASS_ROOT,
};
pub use instantiate::{
    engine_classes, Instantiator, METRICS_CLASS, STATIC_FILES_CLASS, TRACING_CLASS,
};
