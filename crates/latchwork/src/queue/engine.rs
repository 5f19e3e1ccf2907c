// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use spin::Mutex;

use super::backlog::Backlog;
use super::dequeue_operation::DequeueOperation;
use crate::operation::{Completion, CompletionCallback, ParentRef};
use crate::{Error, Rejected, Result, Status};

/// Deliveries collected under the lock and performed after it is released.
type Deliveries<T> = SmallVec<[(DequeueOperation<T>, T); 4]>;

/// The public handle type of a queue flavor, rebuilt from the shared core when the queue
/// completes its deactivation.
pub(crate) trait QueueHandle<T, B>: Sized {
    fn from_core(core: Arc<QueueCore<T, B, Self>>) -> Self;
}

/// What a [`DequeueOperation`] needs from the queue that created it.
pub(crate) trait DequeueHost<T>: Send + Sync {
    /// Pairs the started operation with an item or parks it until one arrives.
    fn post_wait(&self, operation: &DequeueOperation<T>);

    /// Unparks the operation. Returns `false` if it was not parked.
    fn cancel_wait(&self, operation: &DequeueOperation<T>) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueuePhase {
    Idle,
    Active,

    /// Deactivated, but items remain or drop callbacks are still running.
    Draining,

    /// Fully drained. The deactivation callback has fired or is about to.
    Completed,
}

struct QueueState<T, B> {
    phase: QueuePhase,

    /// Bumped when a deactivation completes. Dequeue operations remember the generation they
    /// were created in and are turned away by any other.
    generation: u64,

    paused: bool,

    /// Number of drop passes in progress. The queue does not complete while this is nonzero.
    dropping: usize,

    backlog: B,
    waiters: VecDeque<DequeueOperation<T>>,
}

impl<T, B: Backlog<T>> QueueState<T, B> {
    fn pair_ready(&mut self) -> Deliveries<T> {
        let mut deliveries = Deliveries::new();

        if self.paused {
            return deliveries;
        }

        while !self.waiters.is_empty() {
            let Some(item) = self.backlog.pop_ready() else {
                break;
            };

            if let Some(waiter) = self.waiters.pop_front() {
                deliveries.push((waiter, item));
            }
        }

        deliveries
    }

    fn take_ready(&mut self) -> Option<T> {
        if self.paused {
            None
        } else {
            self.backlog.pop_ready()
        }
    }

    /// Moves a draining queue to Completed once nothing is left to hand out.
    ///
    /// Returns `true` if the caller must now fire the deactivation completion.
    fn try_finish(&mut self) -> bool {
        if self.phase != QueuePhase::Draining || self.dropping > 0 || self.backlog.len() > 0 {
            return false;
        }

        self.phase = QueuePhase::Completed;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

/// State and matching logic shared by every queue flavor.
///
/// `B` decides which held item is deliverable next. `H` is the public handle type passed to
/// the deactivation callback.
pub(crate) struct QueueCore<T, B, H> {
    this: Weak<Self>,
    state: Mutex<QueueState<T, B>>,
    completion: Completion<H>,
}

impl<T, B, H> QueueCore<T, B, H>
where
    T: Send + 'static,
    B: Backlog<T>,
    H: QueueHandle<T, B> + Send + Sync + 'static,
{
    pub(crate) fn new(backlog: B) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: Weak::clone(this),
            state: Mutex::new(QueueState {
                phase: QueuePhase::Idle,
                generation: 0,
                paused: false,
                dropping: 0,
                backlog,
                waiters: VecDeque::new(),
            }),
            completion: Completion::new(),
        })
    }

    /// # Panics
    ///
    /// Panics if the queue is not idle.
    pub(crate) fn activate(
        &self,
        parent: Option<ParentRef>,
        callback: CompletionCallback<H>,
        prepare: impl FnOnce(&mut B),
    ) {
        let generation = {
            let mut state = self.state.lock();
            assert!(state.phase == QueuePhase::Idle, "a queue can only be activated when idle");

            prepare(&mut state.backlog);
            self.completion.start(parent, callback);
            state.phase = QueuePhase::Active;
            state.generation
        };

        tracing::debug!(generation, "queue activated");
    }

    /// Admits an item through `insert` and hands out whatever became deliverable.
    pub(crate) fn enqueue_with(
        &self,
        item: T,
        insert: impl FnOnce(&mut B, T) -> std::result::Result<(), Rejected<T>>,
    ) -> std::result::Result<(), Rejected<T>> {
        let deliveries = {
            let mut state = self.state.lock();

            if state.phase != QueuePhase::Active {
                return Err(Rejected::new(item, Error::ShutdownPending));
            }

            insert(&mut state.backlog, item)?;
            state.pair_ready()
        };

        deliver(deliveries);
        Ok(())
    }

    /// Runs `f` against the held items of an active queue. Returns `None` if the queue is not
    /// active.
    pub(crate) fn with_active_backlog<R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        let mut state = self.state.lock();
        (state.phase == QueuePhase::Active).then(|| f(&mut state.backlog))
    }

    /// Runs `f` against the held items, then hands out whatever became deliverable.
    pub(crate) fn update_backlog<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let (result, deliveries) = {
            let mut state = self.state.lock();
            let result = f(&mut state.backlog);
            (result, state.pair_ready())
        };

        deliver(deliveries);
        result
    }

    /// Starts deactivation. Pending dequeuers fail with [`Error::ShutdownPending`].
    ///
    /// With `drop_item`, every held item is passed to it and the queue completes afterwards.
    /// Without it, held items remain available to later dequeuers and the queue completes
    /// once the last one is taken.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not active.
    pub(crate) fn deactivate(&self, drop_item: Option<&mut dyn FnMut(T)>) {
        let (orphans, dropped, finished) = {
            let mut state = self.state.lock();
            assert!(state.phase == QueuePhase::Active, "only an active queue can be deactivated");

            state.phase = QueuePhase::Draining;
            let orphans: Vec<_> = state.waiters.drain(..).collect();

            let dropped = if drop_item.is_some() {
                state.dropping += 1;
                state.backlog.drain_all()
            } else {
                Vec::new()
            };

            let finished = state.try_finish();
            tracing::debug!(
                orphaned_waiters = orphans.len(),
                dropped_items = dropped.len(),
                remaining_items = state.backlog.len(),
                "queue deactivating"
            );

            (orphans, dropped, finished)
        };

        for orphan in orphans {
            orphan.fail(Status::Failed(Error::ShutdownPending));
        }

        if let Some(drop_item) = drop_item {
            dropped.into_iter().for_each(&mut *drop_item);
            self.end_drop_pass();
        } else if finished {
            self.finish();
        }
    }

    /// Passes every held item to `drop_item` without changing the lifecycle phase.
    pub(crate) fn cancel_all_enqueued(&self, mut drop_item: impl FnMut(T)) -> Result<usize> {
        let dropped = {
            let mut state = self.state.lock();

            if !matches!(state.phase, QueuePhase::Active | QueuePhase::Draining) {
                return Err(Error::NotStarted);
            }

            state.dropping += 1;
            state.backlog.drain_all()
        };

        let count = dropped.len();
        dropped.into_iter().for_each(&mut drop_item);
        self.end_drop_pass();

        Ok(count)
    }

    fn end_drop_pass(&self) {
        let finished = {
            let mut state = self.state.lock();
            state.dropping -= 1;
            state.try_finish()
        };

        if finished {
            self.finish();
        }
    }

    fn finish(&self) {
        tracing::debug!("queue drained");

        // The core is always owned by a handle or an operation while one of its methods runs.
        if let Some(core) = self.this.upgrade() {
            let handle = H::from_core(core);
            self.completion.complete(&handle, Status::Success);
        }
    }

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub(crate) fn resume(&self) {
        let deliveries = {
            let mut state = self.state.lock();
            state.paused = false;
            state.pair_ready()
        };

        deliver(deliveries);
    }

    /// # Panics
    ///
    /// Panics if the queue is active or still draining, or if its deactivation callback has not
    /// fired yet.
    pub(crate) fn reuse(&self) {
        {
            let mut state = self.state.lock();
            assert!(
                matches!(state.phase, QueuePhase::Idle | QueuePhase::Completed),
                "a queue must be fully deactivated before it can be reused"
            );

            // Completed is published before the deactivation callback runs outside the lock.
            assert!(
                self.completion.try_reuse(),
                "a queue cannot be reused before its deactivation callback has fired"
            );

            state.phase = QueuePhase::Idle;
            state.paused = false;
        }

        tracing::debug!("queue reused");
    }

    /// Holds the state lock until the returned guard is dropped.
    #[cfg(test)]
    pub(crate) fn lock_state(&self) -> impl Sized + '_ {
        self.state.lock()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub(crate) fn phase(&self) -> QueuePhase {
        self.state.lock().phase
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn status(&self) -> Status {
        self.completion.status()
    }

    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.state.lock().backlog)
    }
}

impl<T, B, H> DequeueHost<T> for QueueCore<T, B, H>
where
    T: Send + 'static,
    B: Backlog<T>,
    H: QueueHandle<T, B> + Send + Sync + 'static,
{
    fn post_wait(&self, operation: &DequeueOperation<T>) {
        enum Outcome<T> {
            Deliver(T, bool),
            Parked,
            Cancelled,
            Shutdown,
        }

        let outcome = {
            let mut state = self.state.lock();

            if operation.generation() != state.generation {
                Outcome::Shutdown
            } else if let Some(item) = state.take_ready() {
                Outcome::Deliver(item, state.try_finish())
            } else if state.phase == QueuePhase::Active {
                if operation.is_cancel_requested() {
                    Outcome::Cancelled
                } else {
                    state.waiters.push_back(operation.clone());
                    Outcome::Parked
                }
            } else {
                Outcome::Shutdown
            }
        };

        match outcome {
            Outcome::Deliver(item, finished) => {
                operation.deliver(item);
                if finished {
                    self.finish();
                }
            }
            Outcome::Parked => {}
            Outcome::Cancelled => {
                operation.fail(Status::Failed(Error::Cancelled));
            }
            Outcome::Shutdown => {
                operation.fail(Status::Failed(Error::ShutdownPending));
            }
        }
    }

    fn cancel_wait(&self, operation: &DequeueOperation<T>) -> bool {
        let mut state = self.state.lock();

        state
            .waiters
            .iter()
            .position(|waiter| waiter.is_same(operation))
            .and_then(|index| state.waiters.remove(index))
            .is_some()
    }
}

impl<T, B: fmt::Debug, H> fmt::Debug for QueueCore<T, B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("QueueCore")
            .field("phase", &state.phase)
            .field("generation", &state.generation)
            .field("paused", &state.paused)
            .field("backlog", &state.backlog)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

fn deliver<T: Send + 'static>(deliveries: Deliveries<T>) {
    for (operation, item) in deliveries {
        operation.deliver(item);
    }
}
