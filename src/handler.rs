//! Handler units: the terminal stage of a pipeline.

use std::collections::BTreeMap;

use crate::dispatcher::{ApplicationAttributes, Dispatch};
use crate::error::UnitError;
use crate::resource::ResourceProvider;

/// Produces the response for a matched request.
///
/// One instance serves every request routed to its registration, so
/// implementations must be `Send + Sync`. Per-request state lives on the
/// [`Dispatch`] handle.
pub trait Handler: Send + Sync + 'static {
    /// Called once before the first request (or at start for
    /// `load_on_startup` registrations). Returning
    /// [`UnitError::Unavailable`] marks the handler unavailable.
    fn init(&self, _config: &UnitConfig<'_>) -> Result<(), UnitError> {
        Ok(())
    }

    fn service(&self, cx: &mut Dispatch<'_>) -> Result<(), UnitError>;

    /// Called at destroy, only if `init` succeeded.
    fn destroy(&self) {}
}

/// What a unit sees at `init` time.
#[derive(Debug, Clone, Copy)]
pub struct UnitConfig<'a> {
    pub(crate) name: &'a str,
    pub(crate) params: &'a BTreeMap<String, String>,
    pub(crate) application: &'a str,
    pub(crate) attributes: &'a ApplicationAttributes,
    pub(crate) resources: &'a ResourceProvider,
}

impl<'a> UnitConfig<'a> {
    /// Registration name of the unit.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&'a str> {
        self.params.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn params(&self) -> &'a BTreeMap<String, String> {
        self.params
    }

    /// Name of the owning application.
    #[must_use]
    pub fn application(&self) -> &'a str {
        self.application
    }

    #[must_use]
    pub fn attributes(&self) -> &'a ApplicationAttributes {
        self.attributes
    }

    #[must_use]
    pub fn resources(&self) -> &'a ResourceProvider {
        self.resources
    }
}

/// Adapter turning a closure into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Dispatch<'_>) -> Result<(), UnitError> + Send + Sync + 'static,
{
    fn service(&self, cx: &mut Dispatch<'_>) -> Result<(), UnitError> {
        (self.0)(cx)
    }
}

/// Wrap a closure as a handler.
///
/// ```rust
/// use brrtcontainer::handler::handler_fn;
/// use brrtcontainer::registry::HandlerRegistration;
///
/// let echo = HandlerRegistration::new(
///     "echo",
///     handler_fn(|cx| {
///         let path = cx.path().to_string();
///         cx.write(path.as_bytes())?;
///         Ok(())
///     }),
/// )
/// .pattern("/echo");
/// assert_eq!(echo.name(), "echo");
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Dispatch<'_>) -> Result<(), UnitError> + Send + Sync + 'static,
{
    FnHandler(f)
}
