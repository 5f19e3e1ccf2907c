// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::awaitable::status_channel;
use crate::operation::{AsyncOperation, Completion, CompletionCallback, ParentRef};
use crate::{Error, Status};

/// An asynchronous counting semaphore measured in quanta.
///
/// Acquirers request some number of quanta through an [`AcquireOperation`] and complete once
/// the gate can satisfy them. Waiters are served in strict arrival order: a waiter that asks
/// for more than is available blocks every waiter behind it, even those that would fit.
///
/// The gate has an explicit lifecycle. [`activate()`][Self::activate] makes it usable and
/// registers a callback that fires once [`deactivate()`][Self::deactivate] has failed all
/// remaining waiters. [`reuse()`][Self::reuse] readies a deactivated gate for another cycle.
///
/// # Example
///
/// ```
/// use latchwork::{AsyncOperation, QuotaGate, Status};
///
/// let gate = QuotaGate::new();
/// gate.activate(0, None, |_, _| {});
///
/// let big = gate.create_acquire_context();
/// let small = gate.create_acquire_context();
/// big.start_acquire(5, None, |_, _| {});
/// small.start_acquire(1, None, |_, _| {});
///
/// // The small request does not overtake the big one.
/// gate.release_quanta(1);
/// assert_eq!(big.status(), Status::Pending);
/// assert_eq!(small.status(), Status::Pending);
///
/// gate.release_quanta(4);
/// assert_eq!(big.status(), Status::Success);
/// assert_eq!(small.status(), Status::Pending);
/// ```
#[derive(Clone, Debug)]
pub struct QuotaGate {
    shared: Arc<GateShared>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GatePhase {
    Idle,
    Active,
    Completed,
}

struct GateShared {
    state: Mutex<GateState>,
    completion: Completion<QuotaGate>,
}

#[derive(Debug)]
struct GateState {
    phase: GatePhase,
    available: u64,
    waiters: VecDeque<AcquireOperation>,
}

impl GateState {
    /// Takes every waiter at the head of the line that the available quanta can satisfy.
    fn grant_ready(&mut self) -> Vec<AcquireOperation> {
        let mut granted = Vec::new();

        while let Some(head) = self.waiters.front() {
            let requested = head.requested_quanta();
            if requested > self.available {
                break;
            }

            self.available -= requested;
            if let Some(waiter) = self.waiters.pop_front() {
                granted.push(waiter);
            }
        }

        granted
    }
}

impl QuotaGate {
    /// Creates an inactive gate with no quanta.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    phase: GatePhase::Idle,
                    available: 0,
                    waiters: VecDeque::new(),
                }),
                completion: Completion::new(),
            }),
        }
    }

    /// Activates the gate with `initial_quanta` available.
    ///
    /// The callback fires once the gate has been deactivated and every pending acquire has
    /// been completed.
    ///
    /// # Panics
    ///
    /// Panics if the gate is already active, or was deactivated and not yet reused.
    pub fn activate(
        &self,
        initial_quanta: u64,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) {
        let callback: CompletionCallback<Self> = Box::new(callback);

        {
            let mut state = self.shared.state.lock();
            assert!(state.phase == GatePhase::Idle, "a quota gate can only be activated when idle");

            // Registered under the state lock so that a racing deactivation finds it.
            self.shared.completion.start(parent, callback);
            state.phase = GatePhase::Active;
            state.available = initial_quanta;
        }

        tracing::debug!(initial_quanta, "quota gate activated");
    }

    /// Completes every pending acquire with [`Error::ShutdownPending`], then fires the
    /// activation callback.
    ///
    /// # Panics
    ///
    /// Panics if the gate is not active.
    pub fn deactivate(&self) {
        let orphans: Vec<AcquireOperation> = {
            let mut state = self.shared.state.lock();
            assert!(state.phase == GatePhase::Active, "only an active quota gate can be deactivated");

            state.phase = GatePhase::Completed;
            state.waiters.drain(..).collect()
        };

        tracing::debug!(orphaned_waiters = orphans.len(), "quota gate deactivated");

        for waiter in orphans {
            waiter.complete(Status::Failed(Error::ShutdownPending));
        }

        self.shared.completion.complete(self, Status::Success);
    }

    /// Returns a deactivated gate to the idle state so it can be activated again.
    ///
    /// # Panics
    ///
    /// Panics if the gate has not been deactivated, or if its deactivation callback has not
    /// fired yet.
    pub fn reuse(&self) {
        let mut state = self.shared.state.lock();
        assert!(
            state.phase == GatePhase::Completed,
            "a quota gate must be deactivated before it can be reused"
        );

        // Completed is published before the orphaned acquires and the activation callback run.
        assert!(
            self.shared.completion.try_reuse(),
            "a quota gate cannot be reused before its deactivation callback has fired"
        );

        state.phase = GatePhase::Idle;
        state.available = 0;
    }

    /// Returns quanta to the gate and completes every waiter at the head of the line that can
    /// now be satisfied.
    ///
    /// Quanta released into an inactive gate are accounted for but cannot be acquired until the
    /// next activation resets the count.
    pub fn release_quanta(&self, quanta: u64) {
        let granted = {
            let mut state = self.shared.state.lock();
            state.available = state.available.saturating_add(quanta);
            state.grant_ready()
        };

        for waiter in granted {
            waiter.complete(Status::Success);
        }
    }

    /// Creates an acquire context bound to this gate. The context may be reused.
    #[must_use]
    pub fn create_acquire_context(&self) -> AcquireOperation {
        AcquireOperation {
            inner: Arc::new(AcquireInner {
                gate: Arc::clone(&self.shared),
                requested: AtomicU64::new(0),
                completion: Completion::new(),
            }),
        }
    }

    /// The quanta not currently held by any acquirer.
    #[must_use]
    pub fn available_quanta(&self) -> u64 {
        self.shared.state.lock().available
    }

    /// The number of acquires waiting for quanta.
    #[must_use]
    pub fn count_of_waiters(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Whether the gate is between activation and deactivation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().phase == GatePhase::Active
    }

    /// The status of the activation cycle: pending while active, success once deactivated.
    #[must_use]
    pub fn status(&self) -> Status {
        self.shared.completion.status()
    }
}

impl Default for QuotaGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GateShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("QuotaGate")
            .field("phase", &state.phase)
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

/// A request for quanta from a [`QuotaGate`], created by
/// [`QuotaGate::create_acquire_context()`].
#[derive(Clone)]
pub struct AcquireOperation {
    inner: Arc<AcquireInner>,
}

struct AcquireInner {
    gate: Arc<GateShared>,
    requested: AtomicU64,
    completion: Completion<AcquireOperation>,
}

impl AcquireOperation {
    /// Requests `quanta` from the gate.
    ///
    /// Completes inline with success if nobody is waiting and enough quanta are available,
    /// and inline with [`Error::ShutdownPending`] if the gate is not active. Otherwise the
    /// request joins the back of the line.
    ///
    /// # Panics
    ///
    /// Panics if the operation is already started and has not been reused since.
    pub fn start_acquire(
        &self,
        quanta: u64,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) {
        let callback: CompletionCallback<Self> = Box::new(callback);
        self.inner.completion.start(parent, callback);
        self.inner.requested.store(quanta, Ordering::Relaxed);

        let outcome = {
            let mut state = self.inner.gate.state.lock();

            if state.phase != GatePhase::Active {
                Some(Status::Failed(Error::ShutdownPending))
            } else if state.waiters.is_empty() && state.available >= quanta {
                state.available -= quanta;
                Some(Status::Success)
            } else if self.inner.completion.is_cancel_requested() {
                Some(Status::Failed(Error::Cancelled))
            } else {
                state.waiters.push_back(self.clone());
                None
            }
        };

        if let Some(status) = outcome {
            self.complete(status);
        }
    }

    /// Starts the acquire and resolves to its completion status once awaited.
    ///
    /// The acquire is only started when the future is first polled.
    pub fn start_acquire_async(&self, quanta: u64, parent: Option<ParentRef>) -> impl Future<Output = Status> + Send + 'static {
        let acquire = self.clone();

        async move {
            let (tx, rx) = status_channel();
            acquire.start_acquire(quanta, parent, move |_, acquire| tx.send(acquire.status()));
            rx.recv().await
        }
    }

    /// The quanta requested by the most recent start.
    #[must_use]
    pub fn requested_quanta(&self) -> u64 {
        self.inner.requested.load(Ordering::Relaxed)
    }

    fn complete(&self, status: Status) -> bool {
        self.inner.completion.complete(self, status)
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl AsyncOperation for AcquireOperation {
    fn status(&self) -> Status {
        self.inner.completion.status()
    }

    fn cancel(&self) -> bool {
        if !self.inner.completion.request_cancel() {
            return false;
        }

        // A start that has not reached the gate yet sees the request and completes itself.
        let (removed, granted) = {
            let mut state = self.inner.gate.state.lock();

            let removed = state
                .waiters
                .iter()
                .position(|waiter| waiter.is_same(self))
                .and_then(|index| state.waiters.remove(index))
                .is_some();

            // A cancelled head may have been blocking requests that fit.
            let granted = if removed { state.grant_ready() } else { Vec::new() };

            (removed, granted)
        };

        if removed {
            self.complete(Status::Failed(Error::Cancelled));
        }

        for waiter in granted {
            waiter.complete(Status::Success);
        }

        true
    }

    fn try_reuse(&self) -> bool {
        self.inner.completion.try_reuse()
    }
}

impl fmt::Debug for AcquireOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireOperation")
            .field("requested", &self.requested_quanta())
            .field("completion", &self.inner.completion)
            .finish_non_exhaustive()
    }
}
