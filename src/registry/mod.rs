//! # Handler Registry & URL Matcher
//!
//! Registrations are collected into a [`Registry`] while the application is
//! being configured. Pattern syntax and pattern conflicts are checked right
//! here, at registration time, so a broken registry never reaches `service`.
//! At start the registry is split into an immutable [`UrlMatcher`] and the
//! pipeline table.

mod handler;
mod matcher;
mod middleware;
mod pattern;

use std::collections::HashMap;

use tracing::debug;

pub use handler::{Availability, AvailabilityState, HandlerRegistration, UnitSource};
pub use matcher::{MatchKind, Resolution, UrlMatcher};
pub use middleware::{DispatchKind, DispatchKinds, MiddlewareRegistration};
pub use pattern::{PatternKind, UrlPattern};

pub(crate) use pattern::prefix_matches;

use crate::error::ConfigError;

/// Mutable registration set used before an application starts.
#[derive(Debug, Default)]
pub struct Registry {
    handlers: Vec<HandlerRegistration>,
    handler_index: HashMap<String, usize>,
    /// pattern -> name of the handler that claimed it
    claims: HashMap<UrlPattern, String>,
    middleware: Vec<MiddlewareRegistration>,
    middleware_index: HashMap<String, usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler and claim its patterns. Nothing is recorded when any of
    /// its patterns is invalid or already claimed by another handler.
    pub fn add_handler(&mut self, mut registration: HandlerRegistration) -> Result<(), ConfigError> {
        let name = registration.name().to_string();
        if self.handler_index.contains_key(&name) {
            return Err(ConfigError::DuplicateName {
                kind: "handler",
                name,
            });
        }

        let declared = registration.take_declared();
        let mut parsed = Vec::with_capacity(declared.len());
        for raw in &declared {
            let pattern = UrlPattern::parse(raw)?;
            self.check_claim(&pattern, &name)?;
            if !parsed.contains(&pattern) {
                parsed.push(pattern);
            }
        }

        for pattern in parsed {
            self.claims.insert(pattern.clone(), name.clone());
            registration.push_pattern(pattern);
        }
        debug!(
            handler_name = %name,
            patterns = ?registration.url_patterns(),
            "Handler registered"
        );
        self.handler_index.insert(name, self.handlers.len());
        self.handlers.push(registration);
        Ok(())
    }

    /// Map one more pattern to an existing handler. Mapping a pattern to the
    /// handler that already owns it is a no-op.
    pub fn add_mapping(&mut self, handler_name: &str, raw: &str) -> Result<(), ConfigError> {
        let idx = *self
            .handler_index
            .get(handler_name)
            .ok_or_else(|| ConfigError::UnknownHandler(handler_name.to_string()))?;
        let pattern = UrlPattern::parse(raw)?;
        self.check_claim(&pattern, handler_name)?;
        self.claims.insert(pattern.clone(), handler_name.to_string());
        self.handlers[idx].push_pattern(pattern);
        Ok(())
    }

    pub fn add_middleware(
        &mut self,
        mut registration: MiddlewareRegistration,
    ) -> Result<(), ConfigError> {
        let name = registration.name().to_string();
        if self.middleware_index.contains_key(&name) {
            return Err(ConfigError::DuplicateName {
                kind: "middleware",
                name,
            });
        }
        let declared = registration.take_declared();
        let parsed = declared
            .iter()
            .map(|raw| UrlPattern::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        for pattern in parsed {
            registration.push_pattern(pattern);
        }
        debug!(
            middleware = %name,
            patterns = ?registration.url_patterns(),
            handler_names = ?registration.handler_names(),
            kinds = ?registration.dispatch_kinds(),
            "Middleware registered"
        );
        self.middleware_index.insert(name, self.middleware.len());
        self.middleware.push(registration);
        Ok(())
    }

    #[must_use]
    pub fn handler(&self, name: &str) -> Option<&HandlerRegistration> {
        self.handler_index.get(name).map(|idx| &self.handlers[*idx])
    }

    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(HandlerRegistration::name).collect()
    }

    #[must_use]
    pub fn middleware_names(&self) -> Vec<&str> {
        self.middleware
            .iter()
            .map(MiddlewareRegistration::name)
            .collect()
    }

    /// Which handler owns `pattern`, if any.
    #[must_use]
    pub fn claimed_by(&self, pattern: &UrlPattern) -> Option<&str> {
        self.claims.get(pattern).map(String::as_str)
    }

    pub(crate) fn into_parts(self) -> (Vec<HandlerRegistration>, Vec<MiddlewareRegistration>) {
        (self.handlers, self.middleware)
    }

    fn check_claim(&self, pattern: &UrlPattern, handler: &str) -> Result<(), ConfigError> {
        match self.claims.get(pattern) {
            Some(existing) if existing != handler => Err(ConfigError::DuplicatePattern {
                pattern: pattern.to_string(),
                existing: existing.clone(),
                handler: handler.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
