// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Holding structures for items that have been accepted but not yet handed to a dequeuer.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::{Error, Rejected, Sequenced};

/// The storage side of a queue: decides which held item (if any) is ready for delivery.
pub(crate) trait Backlog<T>: Send + 'static {
    fn len(&self) -> usize;

    /// Removes the next deliverable item, if one is ready.
    fn pop_ready(&mut self) -> Option<T>;

    /// Removes every held item, ready or not, in delivery order.
    fn drain_all(&mut self) -> Vec<T>;
}

/// Plain arrival-order storage with one lane per priority. Lane 0 is served first.
pub(crate) struct FifoBacklog<T> {
    lanes: Vec<VecDeque<T>>,
}

impl<T> FifoBacklog<T> {
    /// # Panics
    ///
    /// Panics if `priorities` is zero.
    pub(crate) fn new(priorities: usize) -> Self {
        assert!(priorities > 0, "a queue needs at least one priority lane");

        Self {
            lanes: (0..priorities).map(|_| VecDeque::new()).collect(),
        }
    }

    pub(crate) fn priorities(&self) -> usize {
        self.lanes.len()
    }

    /// # Panics
    ///
    /// Panics if `priority` does not name an existing lane.
    pub(crate) fn push(&mut self, item: T, priority: usize) {
        assert!(
            priority < self.lanes.len(),
            "priority {priority} is out of range for a queue with {} lanes",
            self.lanes.len()
        );

        self.lanes[priority].push_back(item);
    }

    /// Removes and returns the oldest item matching `predicate`, searching lanes in priority
    /// order.
    pub(crate) fn remove_first(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.lanes.iter_mut().find_map(|lane| {
            let index = lane.iter().position(&mut predicate)?;
            lane.remove(index)
        })
    }
}

impl<T: Send + 'static> Backlog<T> for FifoBacklog<T> {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn pop_ready(&mut self) -> Option<T> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }
}

impl<T> fmt::Debug for FifoBacklog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoBacklog")
            .field("lane_lengths", &self.lanes.iter().map(VecDeque::len).collect::<Vec<_>>())
            .finish()
    }
}

/// Key-ordered storage that only releases the item whose key is the expected one.
pub(crate) struct OrderedBacklog<T: Sequenced> {
    held: BTreeMap<T::Key, T>,
    expected: Option<T::Key>,
}

impl<T: Sequenced> OrderedBacklog<T> {
    pub(crate) const fn new() -> Self {
        Self {
            held: BTreeMap::new(),
            expected: None,
        }
    }

    pub(crate) fn expected(&self) -> Option<T::Key> {
        self.expected
    }

    /// # Panics
    ///
    /// Panics if any item is held. Moving the expectation under held items could strand them
    /// or release them out of order.
    pub(crate) fn set_expected(&mut self, key: T::Key) {
        assert!(
            self.held.is_empty(),
            "the expected key cannot change while items are held"
        );

        self.expected = Some(key);
    }

    pub(crate) fn insert(&mut self, item: T) -> Result<(), Rejected<T>> {
        let key = item.sequence_key();

        if self.expected.is_some_and(|expected| key < expected) {
            return Err(Rejected::new(item, Error::KeyBehindGate));
        }

        if self.held.contains_key(&key) {
            return Err(Rejected::new(item, Error::KeyCollision));
        }

        self.held.insert(key, item);
        Ok(())
    }
}

impl<T: Sequenced> Backlog<T> for OrderedBacklog<T> {
    fn len(&self) -> usize {
        self.held.len()
    }

    fn pop_ready(&mut self) -> Option<T> {
        let expected = self.expected?;
        let (&key, _) = self.held.first_key_value()?;

        if key != expected {
            return None;
        }

        let (key, item) = self.held.pop_first()?;
        let next = item.next_sequence_key();

        assert!(
            next > key,
            "an item's next sequence key must be greater than its own key (key {key:?}, next {next:?})"
        );

        self.expected = Some(next);
        Some(item)
    }

    fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.held).into_values().collect()
    }
}

impl<T: Sequenced> fmt::Debug for OrderedBacklog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedBacklog")
            .field("held", &self.held.len())
            .field("expected", &self.expected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Step {
        key: u32,
        next: u32,
    }

    impl Step {
        const fn unit(key: u32) -> Self {
            Self { key, next: key + 1 }
        }
    }

    impl Sequenced for Step {
        type Key = u32;

        fn sequence_key(&self) -> u32 {
            self.key
        }

        fn next_sequence_key(&self) -> u32 {
            self.next
        }
    }

    #[test]
    fn fifo_serves_higher_priority_first() {
        let mut backlog = FifoBacklog::new(3);
        backlog.push("low-1", 2);
        backlog.push("high-1", 0);
        backlog.push("low-2", 2);
        backlog.push("high-2", 0);

        assert_eq!(backlog.len(), 4);
        assert_eq!(backlog.pop_ready(), Some("high-1"));
        assert_eq!(backlog.pop_ready(), Some("high-2"));
        assert_eq!(backlog.pop_ready(), Some("low-1"));
        assert_eq!(backlog.drain_all(), vec!["low-2"]);
        assert_eq!(backlog.pop_ready(), None);
    }

    #[test]
    fn fifo_remove_first_takes_one_match() {
        let mut backlog = FifoBacklog::new(1);
        for value in [1, 2, 3, 2] {
            backlog.push(value, 0);
        }

        assert_eq!(backlog.remove_first(|value| *value == 2), Some(2));
        assert_eq!(backlog.remove_first(|value| *value == 9), None);
        assert_eq!(backlog.drain_all(), vec![1, 3, 2]);
    }

    #[test]
    #[should_panic]
    fn fifo_rejects_unknown_lane() {
        let mut backlog = FifoBacklog::new(2);
        backlog.push((), 2);
    }

    #[test]
    fn ordered_holds_until_expected_key_arrives() {
        let mut backlog = OrderedBacklog::new();
        backlog.set_expected(0);

        backlog.insert(Step::unit(2)).unwrap();
        backlog.insert(Step::unit(1)).unwrap();
        assert_eq!(backlog.pop_ready(), None);

        backlog.insert(Step::unit(0)).unwrap();
        assert_eq!(backlog.pop_ready(), Some(Step::unit(0)));
        assert_eq!(backlog.pop_ready(), Some(Step::unit(1)));
        assert_eq!(backlog.pop_ready(), Some(Step::unit(2)));
        assert_eq!(backlog.expected(), Some(3));
    }

    #[test]
    fn ordered_follows_declared_next_key() {
        let mut backlog = OrderedBacklog::new();
        backlog.set_expected(10);

        backlog.insert(Step { key: 25, next: 40 }).unwrap();
        backlog.insert(Step { key: 10, next: 25 }).unwrap();

        assert_eq!(backlog.pop_ready().map(|step| step.key), Some(10));
        assert_eq!(backlog.pop_ready().map(|step| step.key), Some(25));
        assert_eq!(backlog.expected(), Some(40));
    }

    #[test]
    fn ordered_rejects_duplicate_and_retrograde_keys() {
        let mut backlog = OrderedBacklog::new();
        backlog.set_expected(5);

        backlog.insert(Step::unit(7)).unwrap();

        let duplicate = backlog.insert(Step::unit(7)).unwrap_err();
        assert_eq!(duplicate.reason(), Error::KeyCollision);

        let behind = backlog.insert(Step::unit(4)).unwrap_err();
        assert_eq!(behind.reason(), Error::KeyBehindGate);
        assert_eq!(behind.into_item(), Step::unit(4));

        assert_eq!(backlog.len(), 1);
    }

    #[test]
    #[should_panic]
    fn ordered_panics_on_non_advancing_next_key() {
        let mut backlog = OrderedBacklog::new();
        backlog.set_expected(3);
        backlog.insert(Step { key: 3, next: 3 }).unwrap();

        _ = backlog.pop_ready();
    }

    #[test]
    #[should_panic]
    fn ordered_cannot_move_expectation_under_held_items() {
        let mut backlog = OrderedBacklog::new();
        backlog.set_expected(0);
        backlog.insert(Step::unit(4)).unwrap();

        backlog.set_expected(4);
    }
}
