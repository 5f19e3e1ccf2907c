// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use crate::operation::{CompletionCallback, ParentRef};
use crate::{Rejected, Result, Status};

mod backlog;
mod dequeue_operation;
mod engine;

pub(crate) use backlog::OrderedBacklog;
use backlog::FifoBacklog;
pub(crate) use engine::{QueueCore, QueueHandle, QueuePhase};
pub use dequeue_operation::DequeueOperation;

/// An asynchronous FIFO queue with an explicit activation lifecycle.
///
/// Producers [`enqueue()`][Self::enqueue] items; consumers start [`DequeueOperation`]s that
/// complete once an item is available. At any moment either the held items or the pending
/// dequeuers are empty, unless dequeuing is paused: an item is handed straight to the oldest
/// waiting dequeuer, and a dequeuer takes the oldest held item.
///
/// The queue takes ownership of an item on enqueue and passes ownership to the dequeue
/// operation that receives it.
///
/// # Lifecycle
///
/// A new queue is idle and rejects items. [`activate()`][Self::activate] opens it and
/// registers a callback that fires once a later [`deactivate()`][Self::deactivate] has fully
/// drained the queue. [`reuse()`][Self::reuse] then readies it for the next cycle.
///
/// # Priorities
///
/// [`with_priorities()`][Self::with_priorities] creates a queue with several lanes. Lane 0 is
/// the highest priority; dequeuers always receive the oldest item of the highest non-empty
/// lane.
///
/// # Example
///
/// ```
/// use latchwork::{AsyncOperation, BoundedQueue, Status};
///
/// let queue = BoundedQueue::new();
/// queue.activate(None, |_, _| {});
///
/// let dequeue = queue.create_dequeue_operation();
/// dequeue.start_dequeue(None, |_, _| {});
/// assert_eq!(dequeue.status(), Status::Pending);
///
/// queue.enqueue("hello").unwrap();
/// assert_eq!(dequeue.status(), Status::Success);
/// assert_eq!(dequeue.take_dequeued_item(), Some("hello"));
/// ```
pub struct BoundedQueue<T> {
    core: Arc<QueueCore<T, FifoBacklog<T>, Self>>,
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Creates an idle queue with a single priority lane.
    #[must_use]
    pub fn new() -> Self {
        Self::with_priorities(1)
    }

    /// Creates an idle queue with `priorities` lanes.
    ///
    /// # Panics
    ///
    /// Panics if `priorities` is zero.
    #[must_use]
    pub fn with_priorities(priorities: usize) -> Self {
        Self {
            core: QueueCore::new(FifoBacklog::new(priorities)),
        }
    }

    /// Opens the queue for enqueues.
    ///
    /// The callback fires once the queue has been deactivated and drained.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not idle.
    pub fn activate(
        &self,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) {
        let callback: CompletionCallback<Self> = Box::new(callback);
        self.core.activate(parent, callback, |_| {});
    }

    /// Adds an item at the lowest priority.
    ///
    /// If a dequeuer is waiting, it receives the item and completes inline.
    ///
    /// # Errors
    ///
    /// Returns the item with [`Error::ShutdownPending`][crate::Error::ShutdownPending] if the
    /// queue is not active. The queue is left untouched.
    pub fn enqueue(&self, item: T) -> std::result::Result<(), Rejected<T>> {
        self.core.enqueue_with(item, |backlog, item| {
            let lowest = backlog.priorities() - 1;
            backlog.push(item, lowest);
            Ok(())
        })
    }

    /// Adds an item to the given priority lane.
    ///
    /// # Errors
    ///
    /// Returns the item with [`Error::ShutdownPending`][crate::Error::ShutdownPending] if the
    /// queue is not active.
    ///
    /// # Panics
    ///
    /// Panics if `priority` does not name a lane of this queue.
    pub fn enqueue_with_priority(&self, item: T, priority: usize) -> std::result::Result<(), Rejected<T>> {
        self.core.enqueue_with(item, |backlog, item| {
            backlog.push(item, priority);
            Ok(())
        })
    }

    /// Withdraws the oldest held item matching `predicate`.
    ///
    /// Returns `None` if no held item matches (it may already have been dequeued) or the queue
    /// is no longer active.
    pub fn cancel_enqueue(&self, predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.core.with_active_backlog(|backlog| backlog.remove_first(predicate)).flatten()
    }

    /// Creates a dequeue operation bound to the current activation cycle.
    #[must_use]
    pub fn create_dequeue_operation(&self) -> DequeueOperation<T> {
        let host = Arc::clone(&self.core);
        DequeueOperation::new(host, self.core.generation())
    }

    /// Starts deactivation.
    ///
    /// Pending dequeuers complete with [`Error::ShutdownPending`][crate::Error::ShutdownPending]
    /// and further enqueues are rejected. Items still held stay available to dequeue
    /// operations started later; the activation callback fires once the last one is taken.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not active.
    pub fn deactivate(&self) {
        self.core.deactivate(None);
    }

    /// Starts deactivation, passing every held item to `drop_item`.
    ///
    /// All `drop_item` calls finish before the activation callback fires.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not active.
    pub fn deactivate_with_drop(&self, mut drop_item: impl FnMut(T)) {
        self.core.deactivate(Some(&mut drop_item));
    }

    /// Passes every held item to `drop_item` without deactivating the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`][crate::Error::NotStarted] if the queue is neither active
    /// nor draining.
    pub fn cancel_all_enqueued(&self, drop_item: impl FnMut(T)) -> Result<usize> {
        self.core.cancel_all_enqueued(drop_item)
    }

    /// Stops handing items to dequeuers. Enqueues are still accepted.
    pub fn pause_dequeue(&self) {
        self.core.pause();
    }

    /// Resumes handing out items, immediately pairing as many held items with waiting
    /// dequeuers as possible.
    pub fn resume_dequeue(&self) {
        self.core.resume();
    }

    /// The number of started dequeue operations that are waiting for an item.
    #[must_use]
    pub fn number_of_waiters(&self) -> usize {
        self.core.waiter_count()
    }

    /// The number of held items.
    #[must_use]
    pub fn number_of_queued_items(&self) -> usize {
        self.core.backlog_len()
    }

    /// Readies a fully deactivated queue for another activation.
    ///
    /// Dequeue operations created before the queue finished draining stay bound to the
    /// finished cycle.
    ///
    /// # Panics
    ///
    /// Panics if the queue is active or still draining, or if its deactivation callback has not
    /// fired yet.
    pub fn reuse(&self) {
        self.core.reuse();
    }

    /// Whether the queue accepts items.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.phase() == QueuePhase::Active
    }

    /// The status of the activation cycle: pending from activation until fully drained.
    #[must_use]
    pub fn status(&self) -> Status {
        self.core.status()
    }
}

impl<T: Send + 'static> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> QueueHandle<T, FifoBacklog<T>> for BoundedQueue<T> {
    fn from_core(core: Arc<QueueCore<T, FifoBacklog<T>, Self>>) -> Self {
        Self { core }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue").field("core", &self.core).finish()
    }
}
