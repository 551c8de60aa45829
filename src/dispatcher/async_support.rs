//! Asynchronous continuation of a suspended request.
//!
//! A unit calls [`Dispatch::start_async`](super::Dispatch::start_async) and
//! returns. The driver then parks the root frame, exchange and in-flight
//! guard instead of completing the request. Whoever holds the
//! [`AsyncContext`] later resumes, completes or cancels it. A resume
//! re-invokes the suspending unit at the same pipeline position with
//! dispatch kind `AsyncResume`, on the thread that called `resume`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use may::sync::mpsc::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::application::Application;
use super::context::DispatchStack;
use super::exchange::Exchange;
use super::lifecycle::InFlightGuard;
use super::request_id::RequestId;
use super::service::{Completed, Dispatch};
use crate::error::{DispatchError, UnitError};

/// What the holder of an [`AsyncContext`] asked for.
#[derive(Debug)]
pub(super) enum Action {
    Resume(Option<(String, Value)>),
    Complete,
    Cancel,
}

/// Everything a suspended request needs to continue.
pub(super) struct Parked {
    exchange: Exchange,
    stack: DispatchStack,
    position: usize,
    started: Instant,
    guard: InFlightGuard,
}

enum Slot {
    /// Suspension requested, the driver has not parked yet.
    Pending,
    /// An action arrived before the driver parked; the driver applies it.
    Requested(Action),
    Parked(Box<Parked>),
    /// A continuation is executing.
    Running,
    Done,
}

impl Slot {
    fn label(&self) -> &'static str {
        match self {
            Slot::Pending => "pending",
            Slot::Requested(_) => "requested",
            Slot::Parked(_) => "parked",
            Slot::Running => "running",
            Slot::Done => "done",
        }
    }
}

struct AsyncState {
    slot: Slot,
    tx: Option<Sender<Completed>>,
}

/// State shared by the driver and every [`AsyncContext`] of one request.
pub(super) struct AsyncShared {
    state: Mutex<AsyncState>,
    receiver: Mutex<Option<Receiver<Completed>>>,
}

impl AsyncShared {
    pub(super) fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            state: Mutex::new(AsyncState {
                slot: Slot::Pending,
                tx: Some(tx),
            }),
            receiver: Mutex::new(Some(rx)),
        }
    }

    /// Arm for another suspension after a resume.
    pub(super) fn rearm(&self) {
        self.state.lock().slot = Slot::Pending;
    }

    pub(super) fn take_receiver(&self) -> Option<Receiver<Completed>> {
        self.receiver.lock().take()
    }

    fn mark_done(&self) {
        self.state.lock().slot = Slot::Done;
    }

    fn deliver(&self, completed: Completed) {
        let tx = self.state.lock().tx.take();
        match tx {
            Some(tx) => {
                if tx.send(completed).is_err() {
                    warn!("Suspension was dropped before the request completed");
                }
            }
            None => warn!("Completed request has no waiting suspension"),
        }
    }
}

/// Where the root frame ended up after the driver returned.
pub(super) enum RootState {
    Done(Completed),
    Parked(Arc<AsyncShared>),
}

/// Handle to a suspended request.
///
/// Cloneable and `Send`; each `start_async` accepts exactly one of
/// [`resume`](Self::resume), [`complete`](Self::complete) or
/// [`cancel`](Self::cancel). Later calls fail with
/// [`DispatchError::AsyncNotSupported`].
#[derive(Clone)]
pub struct AsyncContext {
    app: Application,
    shared: Arc<AsyncShared>,
    request_id: RequestId,
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("app", &self.app.name())
            .field("request_id", &self.request_id)
            .field("slot", &self.shared.state.lock().slot.label())
            .finish()
    }
}

impl AsyncContext {
    pub(super) fn new(app: Application, shared: Arc<AsyncShared>, request_id: RequestId) -> Self {
        Self {
            app,
            shared,
            request_id,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Re-invoke the suspending unit.
    pub fn resume(&self) -> Result<(), DispatchError> {
        self.act(Action::Resume(None))
    }

    /// Re-invoke the suspending unit with a request attribute set first.
    pub fn resume_with(&self, key: impl Into<String>, value: Value) -> Result<(), DispatchError> {
        self.act(Action::Resume(Some((key.into(), value))))
    }

    /// Finish the request with whatever the response holds now.
    pub fn complete(&self) -> Result<(), DispatchError> {
        self.act(Action::Complete)
    }

    /// Finish the request as cancelled.
    pub fn cancel(&self) -> Result<(), DispatchError> {
        self.act(Action::Cancel)
    }

    fn act(&self, action: Action) -> Result<(), DispatchError> {
        let parked = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut state.slot, Slot::Running) {
                Slot::Pending => {
                    debug!(request_id = %self.request_id, action = ?action, "Async action queued");
                    state.slot = Slot::Requested(action);
                    return Ok(());
                }
                Slot::Parked(parked) => parked,
                other => {
                    let label = other.label();
                    state.slot = other;
                    return Err(DispatchError::AsyncNotSupported(format!(
                        "continuation already used (state {label})"
                    )));
                }
            }
        };
        self.app.continue_parked(*parked, action, &self.shared);
        Ok(())
    }
}

/// A request that suspended instead of completing.
pub struct Suspension {
    rx: Receiver<Completed>,
    context: AsyncContext,
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("request_id", &self.context.request_id)
            .finish()
    }
}

impl Suspension {
    pub(super) fn new(rx: Receiver<Completed>, context: AsyncContext) -> Self {
        Self { rx, context }
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.context.request_id
    }

    /// A handle that can resume, complete or cancel the request.
    #[must_use]
    pub fn context(&self) -> AsyncContext {
        self.context.clone()
    }

    /// Block until the request completes.
    pub fn wait(self) -> Result<Completed, DispatchError> {
        self.rx.recv().map_err(|_| DispatchError::Cancelled)
    }

    /// Cancel the request and wait for its teardown.
    pub fn cancel(self) -> Result<Completed, DispatchError> {
        self.context.cancel()?;
        self.wait()
    }
}

impl Application {
    /// Decide what happens to the root frame once the pipeline returned:
    /// park it, apply an action that raced ahead of parking, or complete it.
    pub(super) fn settle_root(
        &self,
        mut cx: Dispatch<'_>,
        mut result: Result<(), UnitError>,
        started: Instant,
        guard: InFlightGuard,
    ) -> RootState {
        loop {
            let position = cx.suspended.take();
            let shared = cx.async_shared.clone();
            let (Some(position), Some(shared), true) = (position, shared, result.is_ok()) else {
                let shared = cx.async_shared.clone();
                let outcome = cx.complete_root(result);
                let completed = self.finish(cx, outcome, started);
                if let Some(shared) = shared {
                    shared.mark_done();
                }
                drop(guard);
                return RootState::Done(completed);
            };

            let mut state = shared.state.lock();
            match std::mem::replace(&mut state.slot, Slot::Running) {
                Slot::Requested(action) => {
                    drop(state);
                    result = cx.apply(action, position);
                }
                _ => {
                    let (exchange, stack) = cx.into_parts();
                    debug!(
                        request_id = %exchange.request_id(),
                        position,
                        "Request suspended"
                    );
                    state.slot = Slot::Parked(Box::new(Parked {
                        exchange,
                        stack,
                        position,
                        started,
                        guard,
                    }));
                    drop(state);
                    return RootState::Parked(shared);
                }
            }
        }
    }

    fn continue_parked(&self, parked: Parked, action: Action, shared: &Arc<AsyncShared>) {
        let Parked {
            exchange,
            stack,
            position,
            started,
            guard,
        } = parked;
        let mut cx = Dispatch::resumed(self, exchange, stack, Arc::clone(shared));
        let result = cx.apply(action, position);
        if let RootState::Done(completed) = self.settle_root(cx, result, started, guard) {
            shared.deliver(completed);
        }
    }
}
