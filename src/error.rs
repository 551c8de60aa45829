//! Error taxonomy for the dispatch engine.
//!
//! Configuration and lifecycle errors are fatal to startup/shutdown. Dispatch
//! errors are local to one `service` call and are turned into an
//! [`Outcome`](crate::dispatcher::Outcome) at the application boundary.
//! [`UnitError`] is what handler and middleware code returns.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::LifecycleState;

/// Raised while registrations are being added. Fatal to startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Two different handlers claimed the same URL pattern.
    #[error("pattern '{pattern}' is already mapped to handler '{existing}', cannot map it to '{handler}'")]
    DuplicatePattern {
        pattern: String,
        existing: String,
        handler: String,
    },
    /// The pattern string is not one of the four accepted shapes.
    #[error("invalid url pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    /// A handler or middleware name was registered twice.
    #[error("{kind} '{name}' is already registered")]
    DuplicateName { kind: &'static str, name: String },
    /// A mapping referenced a handler that does not exist.
    #[error("no handler named '{0}' is registered")]
    UnknownHandler(String),
    /// A class-backed unit has no factory in the application's instantiator.
    #[error("no factory registered for class '{0}'")]
    UnknownFactory(String),
    /// The context path is malformed.
    #[error("invalid context path '{0}': must be empty or start with '/' and not end with '/'")]
    InvalidContextPath(String),
    /// Semantic problems found in an application descriptor.
    #[error("descriptor validation failed: {}", .0.join("; "))]
    Descriptor(Vec<String>),
}

/// Raised by lifecycle transitions. Not recoverable.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// Registration attempted after the registry was frozen.
    #[error("registrations are frozen (application is {0})")]
    Frozen(LifecycleState),
    /// A previous initialization attempt failed; the application must be rebuilt.
    #[error("application '{0}' failed to initialize earlier and cannot be re-initialized")]
    InitializationFailed(String),
    /// A configuration callback returned an error.
    #[error("configuration callback '{name}' failed: {source}")]
    Callback {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start unit '{name}': {source}")]
    UnitStart {
        name: String,
        #[source]
        source: Box<UnitError>,
    },
    #[error(transparent)]
    ClassNotFound(#[from] ClassNotFound),
}

/// Errors local to a single `service` call or sub-dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("application is not serving requests (state {0})")]
    NotStarted(LifecycleState),
    #[error("dispatch depth exceeded the configured maximum of {max}")]
    DepthExceeded { max: usize },
    #[error("response is already committed")]
    AlreadyCommitted,
    #[error("asynchronous processing is not supported here: {0}")]
    AsyncNotSupported(String),
    #[error("handler '{handler}' is unavailable")]
    Unavailable {
        handler: String,
        retry_after: Option<Duration>,
    },
    #[error("no handler or resource for '{0}'")]
    NotFound(String),
    #[error("dispatch was cancelled")]
    Cancelled,
    #[error("error dispatch to '{location}' failed: {message}")]
    ErrorDispatchFailed { location: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What handler and middleware code returns.
#[derive(Debug, Error)]
pub enum UnitError {
    /// A fault with a category that error pages can be mapped against.
    #[error("{category}: {message}")]
    Failed { category: String, message: String },
    /// The unit is unavailable; `None` means permanently.
    #[error("unit unavailable")]
    Unavailable { retry_after: Option<Duration> },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Dispatch(Box<DispatchError>),
    #[error("cancelled")]
    Cancelled,
}

impl UnitError {
    /// Build a categorized failure.
    pub fn failed(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Category used for error page lookup.
    #[must_use]
    pub fn category(&self) -> &str {
        match self {
            UnitError::Failed { category, .. } => category,
            UnitError::Unavailable { .. } => "unavailable",
            UnitError::Io(_) => "io",
            UnitError::Dispatch(_) => "dispatch",
            UnitError::Cancelled => "cancelled",
        }
    }

    /// The innermost dispatch error, if this fault came out of a sub-dispatch.
    #[must_use]
    pub fn dispatch_error(&self) -> Option<&DispatchError> {
        match self {
            UnitError::Dispatch(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<DispatchError> for UnitError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Cancelled => UnitError::Cancelled,
            other => UnitError::Dispatch(Box::new(other)),
        }
    }
}

/// Raised by [`Host`](crate::host::Host) deployment operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("context path '{path}' is already served by application '{existing}'")]
    ContextPathInUse { path: String, existing: String },
    #[error("no application is deployed at context path '{0}'")]
    NotDeployed(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// `load_class` could not find the class locally or through any delegate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("class '{name}' not found by loader '{loader}'")]
pub struct ClassNotFound {
    pub name: String,
    pub loader: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_dispatch_maps_to_cancelled_unit_error() {
        let unit: UnitError = DispatchError::Cancelled.into();
        assert!(matches!(unit, UnitError::Cancelled));
    }

    #[test]
    fn test_depth_exceeded_is_preserved_through_unit_error() {
        let unit: UnitError = DispatchError::DepthExceeded { max: 4 }.into();
        assert!(matches!(
            unit.dispatch_error(),
            Some(DispatchError::DepthExceeded { max: 4 })
        ));
        assert_eq!(unit.category(), "dispatch");
    }

    #[test]
    fn test_duplicate_pattern_message() {
        let err = ConfigError::DuplicatePattern {
            pattern: "/echo".into(),
            existing: "a".into(),
            handler: "b".into(),
        };
        assert_eq!(
            err.to_string(),
            "pattern '/echo' is already mapped to handler 'a', cannot map it to 'b'"
        );
    }
}
