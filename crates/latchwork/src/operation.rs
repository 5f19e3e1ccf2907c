// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use spin::Mutex;

use crate::Status;

/// An optional owning operation, kept alive while a child operation is in flight and handed
/// back to the child's completion callback.
pub type ParentRef = Arc<dyn AsyncOperation>;

/// The one-shot callback invoked when an operation of type `H` completes.
///
/// The first argument is the parent supplied when the operation was started. The second is
/// the completing operation itself, from which the caller can read the status and results.
pub type CompletionCallback<H> = Box<dyn FnOnce(Option<&ParentRef>, &H) + Send + 'static>;

/// A restartable, cancellable unit of work with one completion per start/reuse cycle.
///
/// Every operation moves through the phases Created, Started and Completed:
///
/// 1. A `start_*` method registers a completion callback and returns immediately.
/// 2. The operation completes exactly once. This may happen inline, inside the `start_*` call
///    or inside the call that satisfies it (e.g. an enqueue), or later on any other thread.
/// 3. [`reuse()`][AsyncOperation::reuse] returns the operation to the Created phase so the
///    same handle can be started again without reallocation.
///
/// # Thread safety
///
/// All methods may be called from any thread. Completion callbacks are never invoked while
/// an internal lock is held, so a callback is free to call back into the same operation or
/// component (e.g. to reuse and restart itself).
pub trait AsyncOperation: Send + Sync + 'static {
    /// The current status. Only meaningful once the operation has been started.
    fn status(&self) -> Status;

    /// Requests early completion with [`Error::Cancelled`][crate::Error::Cancelled].
    ///
    /// Returns `true` if the request was recorded for an in-flight operation. The operation
    /// then completes with [`Error::Cancelled`][crate::Error::Cancelled], unless a completion
    /// racing from another thread has already claimed it. A cancel never causes a second
    /// completion. Has no effect and returns `false` if the operation is not started or has
    /// already completed.
    fn cancel(&self) -> bool;

    /// Returns a completed operation to the Created phase.
    ///
    /// Returns `false` without changing anything if the operation is still in flight.
    fn try_reuse(&self) -> bool;

    /// Returns a completed operation to the Created phase.
    ///
    /// # Panics
    ///
    /// Panics if the operation is still in flight. Reusing an in-flight operation is a
    /// programming error, not a recoverable condition.
    fn reuse(&self) {
        assert!(self.try_reuse(), "an operation cannot be reused while it is in flight");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Completed,
}

struct Cycle<H> {
    phase: Phase,
    status: Status,

    /// Set by a cancel that arrived while the operation was started. Every parking path checks
    /// it under its host lock, so a cancel landing before the operation is parked still wins.
    cancel_requested: bool,

    parent: Option<ParentRef>,
    callback: Option<CompletionCallback<H>>,
}

/// The phase machine shared by every operation and component in this crate.
///
/// `H` is the public handle type that is handed to the completion callback.
pub(crate) struct Completion<H> {
    cycle: Mutex<Cycle<H>>,
}

impl<H> Completion<H> {
    pub(crate) const fn new() -> Self {
        Self {
            cycle: Mutex::new(Cycle {
                phase: Phase::Created,
                status: Status::NotStarted,
                cancel_requested: false,
                parent: None,
                callback: None,
            }),
        }
    }

    /// Moves Created to Started and registers the callback for this cycle.
    ///
    /// # Panics
    ///
    /// Panics if the operation was already started in this cycle.
    pub(crate) fn start(&self, parent: Option<ParentRef>, callback: CompletionCallback<H>) {
        let mut cycle = self.cycle.lock();

        assert!(
            cycle.phase == Phase::Created,
            "an operation must be reused before it can be started again"
        );

        cycle.phase = Phase::Started;
        cycle.status = Status::Pending;
        cycle.cancel_requested = false;
        cycle.parent = parent;
        cycle.callback = Some(callback);
    }

    /// Moves Started to Completed and invokes the callback.
    ///
    /// Returns `false` (and does nothing) if this cycle has already completed or was never
    /// started, so racing completions resolve to exactly one winner.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub(crate) fn complete(&self, handle: &H, status: Status) -> bool {
        debug_assert!(status.is_completed(), "operations complete with a terminal status");

        let (parent, callback) = {
            let mut cycle = self.cycle.lock();

            if cycle.phase != Phase::Started {
                return false;
            }

            cycle.phase = Phase::Completed;
            cycle.status = status;

            (cycle.parent.take(), cycle.callback.take())
        };

        // The lock is released so that the callback may reuse or restart the operation.
        if let Some(callback) = callback {
            callback(parent.as_ref(), handle);
        }

        true
    }

    pub(crate) fn status(&self) -> Status {
        self.cycle.lock().status
    }

    /// Records a cancel request. Returns `false` unless the operation is in flight.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut cycle = self.cycle.lock();

        if cycle.phase != Phase::Started {
            return false;
        }

        cycle.cancel_requested = true;
        true
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cycle.lock().cancel_requested
    }

    #[cfg(test)]
    pub(crate) fn is_started(&self) -> bool {
        self.cycle.lock().phase == Phase::Started
    }

    /// Returns to the Created phase unless the operation is in flight.
    pub(crate) fn try_reuse(&self) -> bool {
        let mut cycle = self.cycle.lock();

        if cycle.phase == Phase::Started {
            return false;
        }

        cycle.phase = Phase::Created;
        cycle.status = Status::NotStarted;
        cycle.cancel_requested = false;
        true
    }
}

impl<H> fmt::Debug for Completion<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cycle = self.cycle.lock();

        f.debug_struct("Completion")
            .field("phase", &cycle.phase)
            .field("status", &cycle.status)
            .field("has_parent", &cycle.parent.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    #[derive(Debug)]
    struct Handle;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> CompletionCallback<Handle> {
        let counter = Arc::clone(counter);
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn completes_exactly_once() {
        let completion = Completion::<Handle>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        completion.start(None, counting_callback(&calls));
        assert_eq!(completion.status(), Status::Pending);

        assert!(completion.complete(&Handle, Status::Success));
        assert!(!completion.complete(&Handle, Status::Failed(Error::Cancelled)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(completion.status(), Status::Success);
    }

    #[test]
    fn complete_before_start_is_ignored() {
        let completion = Completion::<Handle>::new();

        assert!(!completion.complete(&Handle, Status::Success));
        assert_eq!(completion.status(), Status::NotStarted);
    }

    #[test]
    fn reuse_refused_while_in_flight() {
        let completion = Completion::<Handle>::new();
        completion.start(None, Box::new(|_, _| {}));

        assert!(!completion.try_reuse());

        completion.complete(&Handle, Status::Success);
        assert!(completion.try_reuse());
        assert_eq!(completion.status(), Status::NotStarted);
        assert!(!completion.is_started());
    }

    #[test]
    fn cancel_request_lives_for_one_cycle() {
        let completion = Completion::<Handle>::new();
        assert!(!completion.request_cancel());

        completion.start(None, Box::new(|_, _| {}));
        assert!(completion.request_cancel());
        assert!(completion.is_cancel_requested());

        completion.complete(&Handle, Status::Failed(Error::Cancelled));
        assert!(!completion.request_cancel());
        assert!(completion.try_reuse());
        assert!(!completion.is_cancel_requested());

        completion.start(None, Box::new(|_, _| {}));
        assert!(!completion.is_cancel_requested());
    }

    #[test]
    #[should_panic]
    fn double_start_panics() {
        let completion = Completion::<Handle>::new();
        completion.start(None, Box::new(|_, _| {}));
        completion.start(None, Box::new(|_, _| {}));
    }

    #[test]
    fn parent_is_passed_to_callback_and_released() {
        struct Owner;

        impl AsyncOperation for Owner {
            fn status(&self) -> Status {
                Status::Pending
            }

            fn cancel(&self) -> bool {
                false
            }

            fn try_reuse(&self) -> bool {
                false
            }
        }

        let parent: ParentRef = Arc::new(Owner);
        let completion = Completion::<Handle>::new();
        let saw_parent = Arc::new(AtomicUsize::new(0));

        completion.start(Some(Arc::clone(&parent)), {
            let saw_parent = Arc::clone(&saw_parent);
            Box::new(move |parent, _| {
                if parent.is_some() {
                    saw_parent.fetch_add(1, Ordering::SeqCst);
                }
            })
        });
        assert_eq!(Arc::strong_count(&parent), 2);

        completion.complete(&Handle, Status::Success);

        assert_eq!(saw_parent.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&parent), 1);
    }

    #[test]
    fn callback_can_restart_the_operation() {
        let completion = Arc::new(Completion::<Handle>::new());
        let restarted = Arc::new(AtomicUsize::new(0));

        completion.start(None, {
            let completion = Arc::clone(&completion);
            let restarted = Arc::clone(&restarted);
            Box::new(move |_, _| {
                assert!(completion.try_reuse());
                completion.start(None, Box::new(|_, _| {}));
                restarted.fetch_add(1, Ordering::SeqCst);
            })
        });

        completion.complete(&Handle, Status::Success);

        assert_eq!(restarted.load(Ordering::SeqCst), 1);
        assert!(completion.is_started());
    }
}
