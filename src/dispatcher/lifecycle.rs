use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error_pages::{ErrorPageKey, ErrorPages};
use crate::error::{ConfigError, LifecycleError};
use crate::registry::{HandlerRegistration, MiddlewareRegistration, Registry};
use crate::runtime_config::DrainPolicy;

/// Application lifecycle. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Unconfigured = 0,
    Initialized = 1,
    Started = 2,
    Stopped = 3,
    Destroyed = 4,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Unconfigured,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Started,
            3 => LifecycleState::Stopped,
            _ => LifecycleState::Destroyed,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Unconfigured => "UNCONFIGURED",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::Started => "STARTED",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Destroyed => "DESTROYED",
        }
    }

    /// Registrations are accepted only before start.
    #[must_use]
    pub fn accepts_registrations(self) -> bool {
        self < LifecycleState::Started
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for [`LifecycleState`].
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails when the current state is not `from`
    /// or when `to` is not later than `from`.
    pub(crate) fn advance(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        if to <= from {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| LifecycleError::InvalidTransition {
                from: LifecycleState::from_u8(actual),
                to,
            })
    }
}

/// Events delivered to [`LifecycleListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Initialized,
    Started,
    Stopping,
    Stopped,
    Destroyed,
}

/// Observer for lifecycle transitions.
pub trait LifecycleListener: Send + Sync + 'static {
    fn on_event(&self, application: &str, event: LifecycleEvent);
}

impl<F> LifecycleListener for F
where
    F: Fn(&str, LifecycleEvent) + Send + Sync + 'static,
{
    fn on_event(&self, application: &str, event: LifecycleEvent) {
        self(application, event);
    }
}

/// A startup hook run during `initialize()`.
///
/// Callbacks run in registration order and may add registrations. A
/// failing callback aborts initialization. `on_destroy` runs in reverse
/// order for every callback whose `on_startup` succeeded.
pub trait ConfigCallback: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn on_startup(&self, registrar: &mut Registrar<'_>) -> anyhow::Result<()>;

    fn on_destroy(&self) {}
}

/// Closure-backed [`ConfigCallback`].
pub struct FnCallback<F> {
    name: String,
    f: F,
}

impl<F> ConfigCallback for FnCallback<F>
where
    F: Fn(&mut Registrar<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_startup(&self, registrar: &mut Registrar<'_>) -> anyhow::Result<()> {
        (self.f)(registrar)
    }
}

pub fn callback_fn<F>(name: impl Into<String>, f: F) -> FnCallback<F>
where
    F: Fn(&mut Registrar<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnCallback {
        name: name.into(),
        f,
    }
}

/// Supplies extra configuration callbacks at `initialize()` time.
///
/// This is the only discovery seam the engine has; a process that scans
/// plugins or reads manifests does so behind this trait.
pub trait CallbackDiscovery: Send + Sync + 'static {
    fn discover(&self) -> anyhow::Result<Vec<Arc<dyn ConfigCallback>>>;
}

/// Registration access handed to configuration callbacks.
pub struct Registrar<'a> {
    pub(crate) application: &'a str,
    pub(crate) registry: &'a mut Registry,
    pub(crate) error_pages: &'a mut ErrorPages,
    pub(crate) welcome_files: &'a mut Vec<String>,
}

impl fmt::Debug for Registrar<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("application", &self.application)
            .field("handlers", &self.registry.handler_names())
            .finish()
    }
}

impl Registrar<'_> {
    #[must_use]
    pub fn application(&self) -> &str {
        self.application
    }

    pub fn add_handler(&mut self, registration: HandlerRegistration) -> Result<(), ConfigError> {
        self.registry.add_handler(registration)
    }

    pub fn add_mapping(&mut self, handler_name: &str, pattern: &str) -> Result<(), ConfigError> {
        self.registry.add_mapping(handler_name, pattern)
    }

    pub fn add_middleware(
        &mut self,
        registration: MiddlewareRegistration,
    ) -> Result<(), ConfigError> {
        self.registry.add_middleware(registration)
    }

    pub fn add_error_page(&mut self, key: ErrorPageKey, location: impl Into<String>) {
        self.error_pages.insert(key, location);
    }

    pub fn add_welcome_file(&mut self, name: impl Into<String>) {
        self.welcome_files.push(name.into());
    }

    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        self.registry.handler_names()
    }
}

/// Counts `service` calls that have not completed, suspended ones included.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn current(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until nothing is in flight. Returns `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Decrements the in-flight count on drop.
pub(crate) struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InFlightGuard")
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.tracker.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.tracker.idle.notify_all();
        }
    }
}

/// What `stop()` did with in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub policy: DrainPolicy,
    /// `true` when nothing was left in flight on return.
    pub drained: bool,
    pub remaining: usize,
    pub waited: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::default();
        cell.advance(LifecycleState::Unconfigured, LifecycleState::Initialized)
            .unwrap();
        assert!(cell
            .advance(LifecycleState::Initialized, LifecycleState::Unconfigured)
            .is_err());
        let err = cell
            .advance(LifecycleState::Started, LifecycleState::Stopped)
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LifecycleState::Initialized,
                ..
            }
        ));
        assert_eq!(cell.get(), LifecycleState::Initialized);
    }

    #[test]
    fn test_in_flight_wait_returns_when_guards_drop() {
        let tracker = Arc::new(InFlight::default());
        let guard = tracker.enter();
        assert_eq!(tracker.current(), 1);
        assert!(!tracker.wait_idle(Duration::from_millis(10)));
        let waiter = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || tracker.wait_idle(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Started.to_string(), "STARTED");
        assert!(LifecycleState::Initialized.accepts_registrations());
        assert!(!LifecycleState::Started.accepts_registrations());
    }
}
