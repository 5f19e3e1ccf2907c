// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use crate::operation::{CompletionCallback, ParentRef};
use crate::queue::{OrderedBacklog, QueueCore, QueueHandle, QueuePhase};
use crate::{DequeueOperation, Rejected, Result, Status};

/// An item that knows its place in a sequence.
///
/// Keys need not be consecutive: each item declares the key of the item that follows it.
pub trait Sequenced: Send + 'static {
    /// The ordering key.
    type Key: Ord + Copy + Send + fmt::Debug + 'static;

    /// The position of this item.
    fn sequence_key(&self) -> Self::Key;

    /// The position of the item that comes after this one. Must be greater than
    /// [`sequence_key()`][Self::sequence_key].
    fn next_sequence_key(&self) -> Self::Key;
}

/// A queue that delivers items in strict key order regardless of the order they arrive in.
///
/// The gate tracks an expected key, starting from the key given to
/// [`activate_gate()`][Self::activate_gate]. Items with other keys are held until every
/// preceding item has been delivered. Delivering an item moves the expectation to that item's
/// [`next_sequence_key()`][Sequenced::next_sequence_key].
///
/// Apart from ordering, the gate behaves like a [`BoundedQueue`][crate::BoundedQueue]: items
/// are received through [`DequeueOperation`]s, and the gate has the same lifecycle, pause
/// and bulk-cancel behavior.
///
/// # Example
///
/// ```
/// use latchwork::{AsyncOperation, SequencedGate, Sequenced};
///
/// struct Packet(u32);
///
/// impl Sequenced for Packet {
///     type Key = u32;
///
///     fn sequence_key(&self) -> u32 {
///         self.0
///     }
///
///     fn next_sequence_key(&self) -> u32 {
///         self.0 + 1
///     }
/// }
///
/// let gate = SequencedGate::new();
/// gate.activate_gate(0, None, |_, _| {});
///
/// gate.enqueue_ordered(Packet(1)).unwrap();
/// gate.enqueue_ordered(Packet(0)).unwrap();
///
/// let dequeue = gate.create_ordered_dequeue_operation();
/// dequeue.start_dequeue(None, |_, _| {});
/// assert_eq!(dequeue.take_dequeued_item().map(|packet| packet.0), Some(0));
/// ```
pub struct SequencedGate<T: Sequenced> {
    core: Arc<QueueCore<T, OrderedBacklog<T>, Self>>,
}

impl<T: Sequenced> SequencedGate<T> {
    /// Creates an idle gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: QueueCore::new(OrderedBacklog::new()),
        }
    }

    /// Opens the gate, expecting `start_key` first.
    ///
    /// The callback fires once the gate has been deactivated and drained.
    ///
    /// # Panics
    ///
    /// Panics if the gate is not idle.
    pub fn activate_gate(
        &self,
        start_key: T::Key,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) {
        let callback: CompletionCallback<Self> = Box::new(callback);
        self.core
            .activate(parent, callback, |backlog| backlog.set_expected(start_key));
    }

    /// Adds an item. If it carries the expected key, it and every held successor are handed
    /// to waiting dequeuers.
    ///
    /// # Errors
    ///
    /// The item is returned with:
    ///
    /// * [`Error::ShutdownPending`][crate::Error::ShutdownPending] if the gate is not active.
    /// * [`Error::KeyBehindGate`][crate::Error::KeyBehindGate] if its key precedes the expected
    ///   key.
    /// * [`Error::KeyCollision`][crate::Error::KeyCollision] if an item with the same key is
    ///   already held.
    ///
    /// # Panics
    ///
    /// Panics when an item is released whose next key does not exceed its own key.
    pub fn enqueue_ordered(&self, item: T) -> std::result::Result<(), Rejected<T>> {
        self.core.enqueue_with(item, OrderedBacklog::insert)
    }

    /// Creates a dequeue operation bound to the current activation cycle.
    #[must_use]
    pub fn create_ordered_dequeue_operation(&self) -> DequeueOperation<T> {
        let host = Arc::clone(&self.core);
        DequeueOperation::new(host, self.core.generation())
    }

    /// Starts deactivation.
    ///
    /// Pending dequeuers complete with [`Error::ShutdownPending`][crate::Error::ShutdownPending].
    /// Held items are still delivered in order to dequeue operations started later, and the
    /// activation callback fires once the last one is taken. Items held behind a key that
    /// never arrives keep the gate draining until they are removed with
    /// [`cancel_all_enqueued()`][Self::cancel_all_enqueued].
    ///
    /// # Panics
    ///
    /// Panics if the gate is not active.
    pub fn deactivate_gate(&self) {
        self.core.deactivate(None);
    }

    /// Starts deactivation, passing every held item to `drop_item` in key order.
    ///
    /// # Panics
    ///
    /// Panics if the gate is not active.
    pub fn deactivate_gate_with_drop(&self, mut drop_item: impl FnMut(T)) {
        self.core.deactivate(Some(&mut drop_item));
    }

    /// Moves the expected key.
    ///
    /// # Panics
    ///
    /// Panics if any item is held.
    pub fn set_next_expected_key(&self, key: T::Key) {
        self.core.update_backlog(|backlog| backlog.set_expected(key));
    }

    /// The key of the next item to be delivered, once the gate has been activated.
    #[must_use]
    pub fn expected_key(&self) -> Option<T::Key> {
        self.core.inspect(OrderedBacklog::expected)
    }

    /// Passes every held item to `drop_item` in key order without deactivating the gate.
    ///
    /// The expected key is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`][crate::Error::NotStarted] if the gate is neither active
    /// nor draining.
    pub fn cancel_all_enqueued(&self, drop_item: impl FnMut(T)) -> Result<usize> {
        self.core.cancel_all_enqueued(drop_item)
    }

    /// Stops handing items to dequeuers. Enqueues are still accepted.
    pub fn pause_dequeue(&self) {
        self.core.pause();
    }

    /// Resumes handing out items.
    pub fn resume_dequeue(&self) {
        self.core.resume();
    }

    /// The number of started dequeue operations that are waiting for an item.
    #[must_use]
    pub fn number_of_waiters(&self) -> usize {
        self.core.waiter_count()
    }

    /// The number of held items, deliverable or not.
    #[must_use]
    pub fn number_of_queued_items(&self) -> usize {
        self.core.backlog_len()
    }

    /// Readies a fully deactivated gate for another activation.
    ///
    /// # Panics
    ///
    /// Panics if the gate is active or still draining, or if its deactivation callback has not
    /// fired yet.
    pub fn reuse(&self) {
        self.core.reuse();
    }

    /// Whether the gate accepts items.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.phase() == QueuePhase::Active
    }

    /// The status of the activation cycle.
    #[must_use]
    pub fn status(&self) -> Status {
        self.core.status()
    }
}

impl<T: Sequenced> Default for SequencedGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sequenced> Clone for SequencedGate<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Sequenced> QueueHandle<T, OrderedBacklog<T>> for SequencedGate<T> {
    fn from_core(core: Arc<QueueCore<T, OrderedBacklog<T>, Self>>) -> Self {
        Self { core }
    }
}

impl<T: Sequenced> fmt::Debug for SequencedGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencedGate").field("core", &self.core).finish()
    }
}

#[cfg(test)]
mod tests {
    use spin::Mutex;

    use super::*;
    use crate::{AsyncOperation, Error};

    #[derive(Debug, PartialEq, Eq)]
    struct Frame {
        key: u64,
        next: u64,
    }

    impl Frame {
        const fn unit(key: u64) -> Self {
            Self { key, next: key + 1 }
        }
    }

    impl Sequenced for Frame {
        type Key = u64;

        fn sequence_key(&self) -> u64 {
            self.key
        }

        fn next_sequence_key(&self) -> u64 {
            self.next
        }
    }

    static_assertions::assert_impl_all!(SequencedGate<Frame>: Send, Sync, Clone);

    fn collecting_dequeue(gate: &SequencedGate<Frame>, sink: &Arc<Mutex<Vec<u64>>>) {
        let dequeue = gate.create_ordered_dequeue_operation();
        let sink = Arc::clone(sink);
        dequeue.start_dequeue(None, move |_, dequeue| {
            if let Some(frame) = dequeue.take_dequeued_item() {
                sink.lock().push(frame.key);
            }
        });
    }

    #[test]
    fn out_of_order_arrivals_are_delivered_in_order() {
        let gate = SequencedGate::new();
        gate.activate_gate(0, None, |_, _| {});
        let delivered = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..4 {
            collecting_dequeue(&gate, &delivered);
        }

        gate.enqueue_ordered(Frame::unit(2)).unwrap();
        gate.enqueue_ordered(Frame::unit(1)).unwrap();
        assert!(delivered.lock().is_empty());
        assert_eq!(gate.number_of_queued_items(), 2);

        gate.enqueue_ordered(Frame::unit(0)).unwrap();
        assert_eq!(*delivered.lock(), vec![0, 1, 2]);

        gate.enqueue_ordered(Frame::unit(3)).unwrap();
        assert_eq!(*delivered.lock(), vec![0, 1, 2, 3]);
        assert_eq!(gate.expected_key(), Some(4));
    }

    #[test]
    fn declared_next_key_allows_gaps() {
        let gate = SequencedGate::new();
        gate.activate_gate(100, None, |_, _| {});
        let delivered = Arc::new(Mutex::new(Vec::new()));

        gate.enqueue_ordered(Frame { key: 250, next: 300 }).unwrap();
        gate.enqueue_ordered(Frame { key: 100, next: 250 }).unwrap();

        collecting_dequeue(&gate, &delivered);
        collecting_dequeue(&gate, &delivered);

        assert_eq!(*delivered.lock(), vec![100, 250]);
        assert_eq!(gate.expected_key(), Some(300));
    }

    #[test]
    fn rejects_duplicates_and_late_keys() {
        let gate = SequencedGate::new();
        gate.activate_gate(10, None, |_, _| {});

        gate.enqueue_ordered(Frame::unit(12)).unwrap();

        let duplicate = gate.enqueue_ordered(Frame::unit(12)).unwrap_err();
        assert_eq!(duplicate.reason(), Error::KeyCollision);

        let late = gate.enqueue_ordered(Frame::unit(9)).unwrap_err();
        assert_eq!(late.reason(), Error::KeyBehindGate);

        assert_eq!(gate.number_of_queued_items(), 1);
    }

    #[test]
    fn set_next_expected_key_skips_ahead() {
        let gate = SequencedGate::new();
        gate.activate_gate(0, None, |_, _| {});

        gate.set_next_expected_key(50);
        gate.enqueue_ordered(Frame::unit(50)).unwrap();

        let dequeue = gate.create_ordered_dequeue_operation();
        dequeue.start_dequeue(None, |_, _| {});

        assert_eq!(dequeue.take_dequeued_item(), Some(Frame::unit(50)));
    }

    #[test]
    fn deactivate_with_drop_releases_held_items_in_key_order() {
        let gate = SequencedGate::new();
        gate.activate_gate(0, None, |_, _| {});

        for key in [5, 3, 4] {
            gate.enqueue_ordered(Frame::unit(key)).unwrap();
        }

        let mut dropped = Vec::new();
        gate.deactivate_gate_with_drop(|frame| dropped.push(frame.key));

        assert_eq!(dropped, vec![3, 4, 5]);
        assert_eq!(gate.status(), Status::Success);
    }

    #[test]
    fn gap_keeps_deactivated_gate_draining_until_cancelled() {
        let gate = SequencedGate::new();
        gate.activate_gate(0, None, |_, _| {});
        gate.enqueue_ordered(Frame::unit(1)).unwrap();

        gate.deactivate_gate();
        assert_eq!(gate.status(), Status::Pending);
        assert!(!gate.is_active());

        assert_eq!(gate.cancel_all_enqueued(drop), Ok(1));
        assert_eq!(gate.status(), Status::Success);
    }

    #[test]
    fn pending_dequeue_fails_on_deactivate() {
        let gate = SequencedGate::<Frame>::new();
        gate.activate_gate(0, None, |_, _| {});

        let dequeue = gate.create_ordered_dequeue_operation();
        dequeue.start_dequeue(None, |_, _| {});
        gate.deactivate_gate();

        assert_eq!(dequeue.status(), Status::Failed(Error::ShutdownPending));
    }

    #[test]
    fn reuse_restarts_sequence() {
        let gate = SequencedGate::new();

        gate.activate_gate(0, None, |_, _| {});
        gate.enqueue_ordered(Frame::unit(0)).unwrap();
        gate.deactivate_gate_with_drop(drop);
        gate.reuse();

        gate.activate_gate(7, None, |_, _| {});
        assert_eq!(gate.expected_key(), Some(7));
        assert!(gate.enqueue_ordered(Frame::unit(7)).is_ok());
    }

    #[test]
    fn pause_holds_ready_items() {
        let gate = SequencedGate::new();
        gate.activate_gate(0, None, |_, _| {});
        gate.pause_dequeue();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        collecting_dequeue(&gate, &delivered);
        gate.enqueue_ordered(Frame::unit(0)).unwrap();

        assert!(delivered.lock().is_empty());
        assert_eq!(gate.number_of_waiters(), 1);

        gate.resume_dequeue();
        assert_eq!(*delivered.lock(), vec![0]);
    }
}
