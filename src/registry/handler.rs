use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use super::pattern::UrlPattern;
use crate::error::UnitError;
use crate::handler::{Handler, UnitConfig};

/// Where a unit's implementation comes from.
pub enum UnitSource<T: ?Sized> {
    /// A ready instance supplied by the embedding code.
    Instance(Arc<T>),
    /// A class name resolved through the application's loader at start.
    Class(String),
}

impl<T: ?Sized> fmt::Debug for UnitSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitSource::Instance(_) => f.write_str("Instance"),
            UnitSource::Class(name) => f.debug_tuple("Class").field(name).finish(),
        }
    }
}

const AVAILABLE: u64 = 0;
const PERMANENT: u64 = u64::MAX;

/// Snapshot of a handler's availability at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Available,
    /// Present for matching, rejected by `service` for `retry_after`.
    Unavailable { retry_after: Duration },
    /// Removed from matching for good.
    Permanent,
}

/// Lock-free availability flag. Stores a deadline in clock milliseconds.
#[derive(Debug, Default)]
pub struct Availability {
    deadline_ms: AtomicU64,
}

impl Availability {
    #[must_use]
    pub fn state(&self, now: Duration) -> AvailabilityState {
        match self.deadline_ms.load(Ordering::Acquire) {
            AVAILABLE => AvailabilityState::Available,
            PERMANENT => AvailabilityState::Permanent,
            deadline => {
                let now_ms = now.as_millis() as u64;
                if now_ms >= deadline {
                    AvailabilityState::Available
                } else {
                    AvailabilityState::Unavailable {
                        retry_after: Duration::from_millis(deadline - now_ms),
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.deadline_ms.load(Ordering::Acquire) == PERMANENT
    }

    /// Mark unavailable for `duration` from `now`, or permanently for `None`.
    /// Permanent unavailability is never shortened.
    pub fn mark_unavailable(&self, now: Duration, duration: Option<Duration>) {
        let target = match duration {
            None => PERMANENT,
            Some(d) => (now + d).as_millis().clamp(1, u128::from(PERMANENT - 1)) as u64,
        };
        let _ = self
            .deadline_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == PERMANENT {
                    None
                } else {
                    Some(target)
                }
            });
    }

    /// Clear a temporary mark. Permanent marks stay.
    pub fn mark_available(&self) {
        let _ = self
            .deadline_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == PERMANENT {
                    None
                } else {
                    Some(AVAILABLE)
                }
            });
    }
}

/// A registered handler unit.
///
/// Built with the chained setters below and handed to
/// [`Application::add_handler`](crate::dispatcher::Application::add_handler),
/// which parses its patterns.
pub struct HandlerRegistration {
    name: String,
    source: UnitSource<dyn Handler>,
    declared: Vec<String>,
    patterns: Vec<UrlPattern>,
    init_params: BTreeMap<String, String>,
    load_on_startup: Option<i32>,
    async_supported: bool,
    availability: Availability,
    instance: OnceCell<Arc<dyn Handler>>,
    initialized: OnceCell<()>,
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("patterns", &self.patterns)
            .field("load_on_startup", &self.load_on_startup)
            .field("async_supported", &self.async_supported)
            .finish()
    }
}

impl HandlerRegistration {
    pub fn new(name: impl Into<String>, handler: impl Handler) -> Self {
        Self::with_source(name, UnitSource::Instance(Arc::new(handler)))
    }

    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::with_source(name, UnitSource::Instance(handler))
    }

    /// A handler whose implementation is a class loaded at start.
    pub fn class(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self::with_source(name, UnitSource::Class(class_name.into()))
    }

    fn with_source(name: impl Into<String>, source: UnitSource<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            source,
            declared: Vec::new(),
            patterns: Vec::new(),
            init_params: BTreeMap::new(),
            load_on_startup: None,
            async_supported: false,
            availability: Availability::default(),
            instance: OnceCell::new(),
            initialized: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.declared.push(pattern.into());
        self
    }

    #[must_use]
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(patterns.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn init_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(key.into(), value.into());
        self
    }

    /// Initialize at start; lower values first. Without it the handler is
    /// initialized on its first request.
    #[must_use]
    pub fn load_on_startup(mut self, order: i32) -> Self {
        self.load_on_startup = Some(order);
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
    pub fn source(&self) -> &UnitSource<dyn Handler> {
        &self.source
    }

    /// Patterns accepted by the registry so far.
    #[must_use]
    pub fn url_patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    #[must_use]
    pub fn init_params(&self) -> &BTreeMap<String, String> {
        &self.init_params
    }

    #[must_use]
    pub fn startup_order(&self) -> Option<i32> {
        self.load_on_startup
    }

    #[must_use]
    pub fn is_async_supported(&self) -> bool {
        self.async_supported
    }

    #[must_use]
    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.get().is_some()
    }

    pub(crate) fn take_declared(&mut self) -> Vec<String> {
        std::mem::take(&mut self.declared)
    }

    pub(crate) fn push_pattern(&mut self, pattern: UrlPattern) {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    /// Attach the implementation. Instance sources attach themselves.
    pub(crate) fn attach(&self, handler: Arc<dyn Handler>) {
        let _ = self.instance.set(handler);
    }

    pub(crate) fn attach_declared_instance(&self) {
        if let UnitSource::Instance(handler) = &self.source {
            self.attach(Arc::clone(handler));
        }
    }

    /// The instance, running `init` exactly once. A failed `init` is retried
    /// on the next call unless it reported unavailability.
    pub(crate) fn ensure_initialized(
        &self,
        config: &UnitConfig<'_>,
        now: Duration,
    ) -> Result<Arc<dyn Handler>, UnitError> {
        let handler = self
            .instance
            .get()
            .map(Arc::clone)
            .ok_or_else(|| UnitError::failed("lifecycle", format!("handler '{}' has no instance", self.name)))?;

        self.initialized.get_or_try_init(|| {
            handler.init(config).map_err(|err| {
                if let UnitError::Unavailable { retry_after } = &err {
                    self.availability.mark_unavailable(now, *retry_after);
                }
                warn!(handler_name = %self.name, error = %err, "Handler init failed");
                err
            })?;
            info!(handler_name = %self.name, "Handler initialized");
            Ok::<(), UnitError>(())
        })?;
        Ok(handler)
    }

    /// Run `destroy` if the handler was ever initialized.
    pub(crate) fn destroy(&self) {
        if self.initialized.get().is_some() {
            if let Some(handler) = self.instance.get() {
                handler.destroy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_unavailability_expires() {
        let a = Availability::default();
        let t0 = Duration::from_secs(10);
        a.mark_unavailable(t0, Some(Duration::from_secs(5)));
        assert_eq!(
            a.state(t0 + Duration::from_secs(1)),
            AvailabilityState::Unavailable {
                retry_after: Duration::from_secs(4)
            }
        );
        assert_eq!(a.state(t0 + Duration::from_secs(6)), AvailabilityState::Available);
    }

    #[test]
    fn test_permanent_is_sticky() {
        let a = Availability::default();
        a.mark_unavailable(Duration::ZERO, None);
        a.mark_unavailable(Duration::ZERO, Some(Duration::from_secs(1)));
        a.mark_available();
        assert!(a.is_permanent());
        assert_eq!(a.state(Duration::from_secs(100)), AvailabilityState::Permanent);
    }

    #[test]
    fn test_zero_length_mark_at_origin_still_counts() {
        let a = Availability::default();
        a.mark_unavailable(Duration::ZERO, Some(Duration::ZERO));
        // Deadline clamps to 1ms so the mark is not mistaken for "available".
        assert!(matches!(a.state(Duration::ZERO), AvailabilityState::Unavailable { .. }));
    }
}
