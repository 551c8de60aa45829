use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer};
use tracing::info;

use super::handler::UnitSource;
use super::pattern::UrlPattern;
use crate::error::UnitError;
use crate::handler::UnitConfig;
use crate::middleware::Middleware;

/// Why a dispatch is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    Request,
    Forward,
    Include,
    Error,
    AsyncResume,
}

impl DispatchKind {
    pub const ALL: [DispatchKind; 5] = [
        DispatchKind::Request,
        DispatchKind::Forward,
        DispatchKind::Include,
        DispatchKind::Error,
        DispatchKind::AsyncResume,
    ];

    fn bit(self) -> u8 {
        match self {
            DispatchKind::Request => 1,
            DispatchKind::Forward => 1 << 1,
            DispatchKind::Include => 1 << 2,
            DispatchKind::Error => 1 << 3,
            DispatchKind::AsyncResume => 1 << 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchKind::Request => "REQUEST",
            DispatchKind::Forward => "FORWARD",
            DispatchKind::Include => "INCLUDE",
            DispatchKind::Error => "ERROR",
            DispatchKind::AsyncResume => "ASYNC_RESUME",
        }
    }
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "REQUEST" => Ok(DispatchKind::Request),
            "FORWARD" => Ok(DispatchKind::Forward),
            "INCLUDE" => Ok(DispatchKind::Include),
            "ERROR" => Ok(DispatchKind::Error),
            "ASYNC" | "ASYNC_RESUME" => Ok(DispatchKind::AsyncResume),
            other => Err(format!("unknown dispatch kind '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for DispatchKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Set of dispatch kinds a middleware applies to. Defaults to `REQUEST`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKinds(u8);

impl DispatchKinds {
    pub const NONE: DispatchKinds = DispatchKinds(0);

    #[must_use]
    pub fn all() -> Self {
        DispatchKind::ALL.into_iter().collect()
    }

    #[must_use]
    pub fn only(kind: DispatchKind) -> Self {
        DispatchKinds(kind.bit())
    }

    #[must_use]
    pub fn with(self, kind: DispatchKind) -> Self {
        DispatchKinds(self.0 | kind.bit())
    }

    #[must_use]
    pub fn contains(self, kind: DispatchKind) -> bool {
        self.0 & kind.bit() != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = DispatchKind> {
        DispatchKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl Default for DispatchKinds {
    fn default() -> Self {
        DispatchKinds::only(DispatchKind::Request)
    }
}

impl FromIterator<DispatchKind> for DispatchKinds {
    fn from_iter<I: IntoIterator<Item = DispatchKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(DispatchKinds::NONE, DispatchKinds::with)
    }
}

impl fmt::Debug for DispatchKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A registered processing unit.
pub struct MiddlewareRegistration {
    name: String,
    source: UnitSource<dyn Middleware>,
    declared: Vec<String>,
    patterns: Vec<UrlPattern>,
    handler_names: Vec<String>,
    kinds: DispatchKinds,
    init_params: BTreeMap<String, String>,
    async_supported: bool,
    instance: OnceCell<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewareRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistration")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("patterns", &self.patterns)
            .field("handler_names", &self.handler_names)
            .field("kinds", &self.kinds)
            .finish()
    }
}

impl MiddlewareRegistration {
    pub fn new(name: impl Into<String>, middleware: impl Middleware) -> Self {
        Self::with_source(name, UnitSource::Instance(Arc::new(middleware)))
    }

    pub fn from_arc(name: impl Into<String>, middleware: Arc<dyn Middleware>) -> Self {
        Self::with_source(name, UnitSource::Instance(middleware))
    }

    pub fn class(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self::with_source(name, UnitSource::Class(class_name.into()))
    }

    fn with_source(name: impl Into<String>, source: UnitSource<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            source,
            declared: Vec::new(),
            patterns: Vec::new(),
            handler_names: Vec::new(),
            kinds: DispatchKinds::default(),
            init_params: BTreeMap::new(),
            async_supported: false,
            instance: OnceCell::new(),
        }
    }

    /// Bind to a URL pattern.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.declared.push(pattern.into());
        self
    }

    /// Bind to a handler by name; `*` binds to every handler.
    #[must_use]
    pub fn handler_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.handler_names.contains(&name) {
            self.handler_names.push(name);
        }
        self
    }

    /// Replace the dispatch kinds this unit applies to.
    #[must_use]
    pub fn kinds(mut self, kinds: DispatchKinds) -> Self {
        self.kinds = kinds;
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: DispatchKind) -> Self {
        self.kinds = self.kinds.with(kind);
        self
    }

    #[must_use]
    pub fn init_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn async_supported(mut self, supported: bool) -> Self {
        self.async_supported = supported;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source(&self) -> &UnitSource<dyn Middleware> {
        &self.source
    }

    #[must_use]
    pub fn url_patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    #[must_use]
    pub fn handler_names(&self) -> &[String] {
        &self.handler_names
    }

    #[must_use]
    pub fn dispatch_kinds(&self) -> DispatchKinds {
        self.kinds
    }

    #[must_use]
    pub fn init_params(&self) -> &BTreeMap<String, String> {
        &self.init_params
    }

    #[must_use]
    pub fn is_async_supported(&self) -> bool {
        self.async_supported
    }

    pub(crate) fn take_declared(&mut self) -> Vec<String> {
        std::mem::take(&mut self.declared)
    }

    pub(crate) fn push_pattern(&mut self, pattern: UrlPattern) {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    pub(crate) fn attach(&self, middleware: Arc<dyn Middleware>) {
        let _ = self.instance.set(middleware);
    }

    pub(crate) fn attach_declared_instance(&self) {
        if let UnitSource::Instance(mw) = &self.source {
            self.attach(Arc::clone(mw));
        }
    }

    /// Called once at start.
    pub(crate) fn initialize(&self, config: &UnitConfig<'_>) -> Result<(), UnitError> {
        let mw = self.instance()?;
        mw.init(config)?;
        info!(middleware = %self.name, "Middleware initialized");
        Ok(())
    }

    pub(crate) fn instance(&self) -> Result<Arc<dyn Middleware>, UnitError> {
        self.instance.get().map(Arc::clone).ok_or_else(|| {
            UnitError::failed("lifecycle", format!("middleware '{}' has no instance", self.name))
        })
    }

    pub(crate) fn destroy(&self) {
        if let Some(mw) = self.instance.get() {
            mw.destroy();
        }
    }
}
