// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use spin::Mutex;

use crate::awaitable::status_channel;
use crate::operation::{Completion, CompletionCallback, ParentRef};
use crate::{Error, Result, Status};

mod activity;

use activity::ActivityGate;

/// An opaque value handed from the code completing an open or close to the observers of that
/// completion.
pub type CompletionContext = Arc<dyn Any + Send + Sync>;

/// The extension points of a [`Service`].
///
/// Every hook is called without any internal lock held, so hooks may call back into the
/// service. The open and close hooks must eventually call
/// [`Service::complete_open()`] and [`Service::complete_close()`] respectively, either inline
/// or later from any thread.
pub trait ServiceHooks: Sized + Send + Sync + 'static {
    /// Called once an open has been accepted. The default completes the open successfully.
    fn on_service_open(&self, service: &Service<Self>) {
        service.complete_open(Ok(()), None);
    }

    /// Called when the service may close, which is deferred until outstanding service
    /// activity is released. The default completes the close successfully.
    fn on_service_close(&self, service: &Service<Self>) {
        service.complete_close(Ok(()), None);
    }

    /// Called when a close has been requested while service activity is outstanding.
    fn on_deferred_closing(&self, _service: &Service<Self>) {}

    /// Called after the service has been returned to its initial state.
    fn on_service_reuse(&self, _service: &Service<Self>) {}

    /// Observes the context passed to [`Service::complete_open()`] before the open callback
    /// runs.
    fn on_open_completing(&self, _context: Option<&CompletionContext>) {}

    /// Observes the context passed to [`Service::complete_close()`] before the close callback
    /// runs.
    fn on_close_completing(&self, _context: Option<&CompletionContext>) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServicePhase {
    NotStarted,
    Opening,
    Open,
    Closing,
    Closed,

    /// The open completed with an error. Terminal until reuse.
    Failed,
}

struct ServiceState {
    phase: ServicePhase,
    deferred_close: bool,
    context: Option<CompletionContext>,
}

struct ServiceShared<H> {
    hooks: H,
    activity: ActivityGate,
    state: Mutex<ServiceState>,
    open: Completion<Service<H>>,
    close: Completion<Service<H>>,
}

/// The open/close state machine of a long-lived component.
///
/// ```text
/// NotStarted --start_open--> Opening --complete_open(Ok)--> Open --start_close--> Closing
///                               |                                                   |
///                        complete_open(Err)                                 complete_close
///                               v                                                   v
///                             Failed ----------------------reuse-----------------> Closed
/// ```
///
/// [`reuse()`][Self::reuse] returns a Closed or Failed service to NotStarted.
///
/// # Deferred close
///
/// After [`set_deferred_close_behavior()`][Self::set_deferred_close_behavior], work running
/// against an open service is bracketed by
/// [`try_acquire_service_activity()`][Self::try_acquire_service_activity] and
/// [`release_service_activity()`][Self::release_service_activity]. A close requested while
/// activity is outstanding fires [`ServiceHooks::on_deferred_closing()`] and postpones
/// [`ServiceHooks::on_service_close()`] until the last activity is released. Once a close has
/// been accepted, no new activity can be acquired.
///
/// # Example
///
/// ```
/// use latchwork::{Service, ServiceHooks, Status};
///
/// struct Listener;
///
/// impl ServiceHooks for Listener {}
///
/// let service = Service::new(Listener);
/// service.start_open(None, |_, _| {}).unwrap();
/// assert!(service.is_open());
///
/// service.start_close(None, |_, _| {}).unwrap();
/// assert!(!service.is_open());
/// assert_eq!(service.status(), Status::Success);
/// ```
pub struct Service<H> {
    shared: Arc<ServiceShared<H>>,
}

impl<H: ServiceHooks> Service<H> {
    /// Creates a service in the NotStarted state.
    #[must_use]
    pub fn new(hooks: H) -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                hooks,
                activity: ActivityGate::new(),
                state: Mutex::new(ServiceState {
                    phase: ServicePhase::NotStarted,
                    deferred_close: false,
                    context: None,
                }),
                open: Completion::new(),
                close: Completion::new(),
            }),
        }
    }

    /// The hooks this service was created with.
    #[must_use]
    pub fn hooks(&self) -> &H {
        &self.shared.hooks
    }

    /// Starts opening the service and runs [`ServiceHooks::on_service_open()`].
    ///
    /// The callback fires once the open hook calls [`complete_open()`][Self::complete_open].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharingViolation`] without running the open hook if the service has
    /// already been opened in this cycle.
    pub fn start_open(
        &self,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) -> Result<()> {
        let callback: CompletionCallback<Self> = Box::new(callback);

        {
            let mut state = self.shared.state.lock();

            if state.phase != ServicePhase::NotStarted {
                return Err(Error::SharingViolation);
            }

            state.phase = ServicePhase::Opening;
            self.shared.open.start(parent, callback);
        }

        tracing::debug!("service opening");
        self.shared.hooks.on_service_open(self);
        Ok(())
    }

    /// Finishes an open started by [`start_open()`][Self::start_open].
    ///
    /// `context` is stored until the service is reused and passed to
    /// [`ServiceHooks::on_open_completing()`] before the open callback runs.
    ///
    /// Returns `false` and does nothing if no open is in progress.
    pub fn complete_open(&self, result: Result<()>, context: Option<CompletionContext>) -> bool {
        {
            let mut state = self.shared.state.lock();

            if state.phase != ServicePhase::Opening {
                return false;
            }

            if result.is_ok() {
                state.phase = ServicePhase::Open;
                if state.deferred_close {
                    self.shared.activity.open();
                }
            } else {
                state.phase = ServicePhase::Failed;
            }

            state.context.clone_from(&context);
        }

        tracing::debug!(?result, "service open completed");

        self.shared.hooks.on_open_completing(context.as_ref());
        self.shared.open.complete(self, Status::from(result));
        true
    }

    /// Starts closing an open service.
    ///
    /// The service stops reporting itself open immediately. Without outstanding service
    /// activity, [`ServiceHooks::on_service_close()`] runs inline. Otherwise
    /// [`ServiceHooks::on_deferred_closing()`] runs and the close hook follows the last
    /// [`release_service_activity()`][Self::release_service_activity].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsuccessful`] if the service is not open.
    pub fn start_close(
        &self,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) -> Result<()> {
        let callback: CompletionCallback<Self> = Box::new(callback);

        let deferred = {
            let mut state = self.shared.state.lock();

            if state.phase != ServicePhase::Open {
                return Err(Error::Unsuccessful);
            }

            state.phase = ServicePhase::Closing;
            self.shared.close.start(parent, callback);

            // Activity stops being accepted at the same moment the service stops being open.
            state.deferred_close && self.shared.activity.begin_close()
        };

        if !deferred {
            tracing::debug!("service closing");
            self.shared.hooks.on_service_close(self);
            return Ok(());
        }

        tracing::debug!(outstanding = self.shared.activity.count(), "service close deferred");
        self.shared.hooks.on_deferred_closing(self);

        // Drop the hold taken by begin_close. Activity may already have drained meanwhile.
        if self.shared.activity.release() {
            self.run_deferred_close();
        }

        Ok(())
    }

    /// Finishes a close started by [`start_close()`][Self::start_close].
    ///
    /// A provided `context` replaces the one stored by the open. It is passed to
    /// [`ServiceHooks::on_close_completing()`] before the close callback runs.
    ///
    /// Returns `false` and does nothing if no close is in progress.
    pub fn complete_close(&self, result: Result<()>, context: Option<CompletionContext>) -> bool {
        {
            let mut state = self.shared.state.lock();

            if state.phase != ServicePhase::Closing {
                return false;
            }

            state.phase = ServicePhase::Closed;
            if context.is_some() {
                state.context.clone_from(&context);
            }
        }

        tracing::debug!(?result, "service close completed");

        self.shared.hooks.on_close_completing(context.as_ref());
        self.shared.close.complete(self, Status::from(result));
        true
    }

    /// Whether the service has opened successfully and no close has been requested.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().phase == ServicePhase::Open
    }

    /// The overall status: the open status, unless the close failed.
    #[must_use]
    pub fn status(&self) -> Status {
        match self.shared.close.status() {
            close @ Status::Failed(_) => close,
            _ => self.shared.open.status(),
        }
    }

    /// The context stored by the most recent completion in this cycle.
    #[must_use]
    pub fn completion_context(&self) -> Option<CompletionContext> {
        self.shared.state.lock().context.clone()
    }

    /// Returns a closed or failed service to NotStarted, clears the stored context and runs
    /// [`ServiceHooks::on_service_reuse()`]. The deferred close setting is kept.
    ///
    /// # Panics
    ///
    /// Panics unless the service is closed or its open failed.
    pub fn reuse(&self) {
        {
            let mut state = self.shared.state.lock();
            assert!(
                matches!(state.phase, ServicePhase::Closed | ServicePhase::Failed),
                "a service can only be reused once closed or failed"
            );

            let reset = self.shared.open.try_reuse() && self.shared.close.try_reuse();
            assert!(reset, "a service cannot be reused while its completions are running");

            state.phase = ServicePhase::NotStarted;
            state.context = None;
            self.shared.activity.reset();
        }

        tracing::debug!("service reused");
        self.shared.hooks.on_service_reuse(self);
    }

    /// Makes close wait for outstanding service activity.
    ///
    /// # Panics
    ///
    /// Panics if the service is already open or closing.
    pub fn set_deferred_close_behavior(&self) {
        let mut state = self.shared.state.lock();
        assert!(
            matches!(state.phase, ServicePhase::NotStarted | ServicePhase::Opening),
            "deferred close must be configured before the service opens"
        );

        state.deferred_close = true;
    }

    /// Registers a unit of work against the open service.
    ///
    /// Returns `false` once a close has been accepted, before the service has opened, and
    /// always when deferred close is not configured.
    #[must_use]
    pub fn try_acquire_service_activity(&self) -> bool {
        self.shared.activity.try_acquire()
    }

    /// Ends a unit of work registered by
    /// [`try_acquire_service_activity()`][Self::try_acquire_service_activity].
    ///
    /// Returns `true` if this release ran the deferred close hook.
    ///
    /// # Panics
    ///
    /// Panics if no service activity is outstanding.
    pub fn release_service_activity(&self) -> bool {
        if self.shared.activity.release() {
            self.run_deferred_close();
            return true;
        }

        false
    }

    /// Opens the service and resolves once the open has completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharingViolation`] if the service was already opened in this cycle, or
    /// the error the open completed with.
    pub async fn open_async(&self, parent: Option<ParentRef>) -> Result<()> {
        let (tx, rx) = status_channel();
        self.start_open(parent, move |_, service| tx.send(service.shared.open.status()))?;
        rx.recv().await.outcome().unwrap_or(Err(Error::Unsuccessful))
    }

    /// Closes the service and resolves once the close has completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsuccessful`] if the service is not open, or the error the close
    /// completed with.
    pub async fn close_async(&self, parent: Option<ParentRef>) -> Result<()> {
        let (tx, rx) = status_channel();
        self.start_close(parent, move |_, service| tx.send(service.shared.close.status()))?;
        rx.recv().await.outcome().unwrap_or(Err(Error::Unsuccessful))
    }

    fn run_deferred_close(&self) {
        tracing::debug!("service closing after last activity");
        self.shared.hooks.on_service_close(self);
    }
}

impl<H> Clone for Service<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H> fmt::Debug for Service<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();

        f.debug_struct("Service")
            .field("phase", &state.phase)
            .field("deferred_close", &state.deferred_close)
            .field("activity", &self.shared.activity.count())
            .field("open", &self.shared.open)
            .field("close", &self.shared.close)
            .finish_non_exhaustive()
    }
}
