// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::awaitable::status_channel;
use crate::operation::{AsyncOperation, Completion, CompletionCallback, ParentRef};
use crate::{Error, Status};

/// How a [`WaitEvent`] behaves when it is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResetMode {
    /// Setting the event releases exactly one waiter. With nobody waiting, the signal is kept
    /// for the next wait, which consumes it.
    Auto,

    /// Setting the event releases every waiter and the event stays signaled until
    /// [`WaitEvent::reset_event()`] is called.
    Manual,
}

/// An event that can be awaited through per-waiter [`WaitOperation`]s.
///
/// Producers call [`set_event()`][Self::set_event] and [`reset_event()`][Self::reset_event].
/// Consumers create a wait context via [`create_wait_context()`][Self::create_wait_context] and
/// start it; the wait completes with success once the event is signaled. Waiters are released
/// in arrival order.
///
/// The event is a cheap handle - clones refer to the same event. Wait contexts do not keep
/// the event alive: once the last handle is dropped, pending waits complete with
/// [`Error::ShutdownPending`] and later starts fail the same way.
///
/// # Example
///
/// ```
/// use latchwork::{AsyncOperation, ResetMode, Status, WaitEvent};
///
/// let event = WaitEvent::new(ResetMode::Auto, false);
/// let wait = event.create_wait_context();
///
/// wait.start_wait_until_set(None, |_, _| {});
/// assert_eq!(wait.status(), Status::Pending);
///
/// event.set_event();
/// assert_eq!(wait.status(), Status::Success);
/// assert!(!event.is_signaled());
/// ```
#[derive(Clone, Debug)]
pub struct WaitEvent {
    shared: Arc<EventShared>,
}

#[derive(Debug)]
struct EventShared {
    state: Mutex<EventState>,
}

impl Drop for EventShared {
    fn drop(&mut self) {
        let orphans = std::mem::take(&mut self.state.get_mut().waiters);

        for waiter in orphans {
            waiter.complete(Status::Failed(Error::ShutdownPending));
        }
    }
}

#[derive(Debug)]
struct EventState {
    signaled: bool,
    mode: ResetMode,
    waiters: VecDeque<WaitOperation>,
}

impl WaitEvent {
    /// Creates an event in the given mode, optionally already signaled.
    #[must_use]
    pub fn new(mode: ResetMode, initially_signaled: bool) -> Self {
        Self {
            shared: Arc::new(EventShared {
                state: Mutex::new(EventState {
                    signaled: initially_signaled,
                    mode,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Creates a wait context bound to this event. The context may be reused for any number
    /// of waits.
    #[must_use]
    pub fn create_wait_context(&self) -> WaitOperation {
        WaitOperation {
            inner: Arc::new(WaitInner {
                event: Arc::downgrade(&self.shared),
                completion: Completion::new(),
            }),
        }
    }

    /// Signals the event, releasing one waiter (auto reset) or all waiters (manual reset).
    ///
    /// Released waiters complete inline on the calling thread.
    pub fn set_event(&self) {
        let released: Vec<WaitOperation> = {
            let mut state = self.shared.state.lock();

            match state.mode {
                ResetMode::Auto => match state.waiters.pop_front() {
                    Some(waiter) => vec![waiter],
                    None => {
                        state.signaled = true;
                        Vec::new()
                    }
                },
                ResetMode::Manual => {
                    state.signaled = true;
                    state.waiters.drain(..).collect()
                }
            }
        };

        for waiter in released {
            waiter.complete(Status::Success);
        }
    }

    /// Clears the signaled state. Pending waiters are unaffected.
    pub fn reset_event(&self) {
        self.shared.state.lock().signaled = false;
    }

    /// Switches between auto and manual reset.
    ///
    /// # Panics
    ///
    /// Panics if any wait is pending. The mode may only change while nobody is waiting.
    pub fn change_mode(&self, mode: ResetMode) {
        let mut state = self.shared.state.lock();

        assert!(
            state.waiters.is_empty(),
            "the reset mode of an event cannot change while waits are pending"
        );

        state.mode = mode;
    }

    /// The current reset mode.
    #[must_use]
    pub fn mode(&self) -> ResetMode {
        self.shared.state.lock().mode
    }

    /// Whether the event is currently signaled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.shared.state.lock().signaled
    }

    /// The number of started waits that have not yet completed.
    #[must_use]
    pub fn count_of_waiters(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }
}

/// A single wait on a [`WaitEvent`], created by [`WaitEvent::create_wait_context()`].
///
/// Completes with [`Status::Success`] when the event is signaled, or with
/// [`Error::Cancelled`] if [`cancel()`][AsyncOperation::cancel] wins the race.
#[derive(Clone)]
pub struct WaitOperation {
    inner: Arc<WaitInner>,
}

struct WaitInner {
    event: Weak<EventShared>,
    completion: Completion<WaitOperation>,
}

impl WaitOperation {
    /// Starts waiting for the event to become signaled.
    ///
    /// If the event is already signaled, the wait completes inline before this returns (and
    /// consumes the signal of an auto reset event). If every handle to the event has been
    /// dropped, the wait completes inline with [`Error::ShutdownPending`].
    ///
    /// # Panics
    ///
    /// Panics if the wait is already started and has not been reused since.
    pub fn start_wait_until_set(
        &self,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) {
        let callback: CompletionCallback<Self> = Box::new(callback);
        self.inner.completion.start(parent, callback);

        let Some(event) = self.inner.event.upgrade() else {
            self.complete(Status::Failed(Error::ShutdownPending));
            return;
        };

        let outcome = {
            let mut state = event.state.lock();

            if state.signaled {
                if state.mode == ResetMode::Auto {
                    state.signaled = false;
                }
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

    /// Starts the wait and resolves to its completion status once awaited.
    ///
    /// The wait is only started when the future is first polled.
    pub fn start_wait_until_set_async(&self, parent: Option<ParentRef>) -> impl Future<Output = Status> + Send + 'static {
        let wait = self.clone();

        async move {
            let (tx, rx) = status_channel();
            wait.start_wait_until_set(parent, move |_, wait| tx.send(wait.status()));
            rx.recv().await
        }
    }

    fn complete(&self, status: Status) -> bool {
        self.inner.completion.complete(self, status)
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl AsyncOperation for WaitOperation {
    fn status(&self) -> Status {
        self.inner.completion.status()
    }

    fn cancel(&self) -> bool {
        if !self.inner.completion.request_cancel() {
            return false;
        }

        // A start that has not reached the event yet sees the request and completes itself.
        let removed = self.inner.event.upgrade().is_some_and(|event| {
            let mut state = event.state.lock();

            state
                .waiters
                .iter()
                .position(|waiter| waiter.is_same(self))
                .and_then(|index| state.waiters.remove(index))
                .is_some()
        });

        // Only the party that unlinked the waiter may complete it.
        if removed {
            self.complete(Status::Failed(Error::Cancelled));
        }

        true
    }

    fn try_reuse(&self) -> bool {
        self.inner.completion.try_reuse()
    }
}

impl fmt::Debug for WaitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitOperation")
            .field("completion", &self.inner.completion)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::hint::spin_loop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use futures::executor::block_on;

    use super::*;

    static_assertions::assert_impl_all!(WaitEvent: Send, Sync);
    static_assertions::assert_impl_all!(WaitOperation: Send, Sync);

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn start_counted(wait: &WaitOperation, completions: &Arc<AtomicUsize>) {
        let completions = Arc::clone(completions);
        wait.start_wait_until_set(None, move |_, _| {
            completions.fetch_add(1, Ordering::SeqCst);
        });
    }

    #[test]
    fn auto_reset_signal_is_kept_for_next_waiter() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        event.set_event();
        assert!(event.is_signaled());

        let wait = event.create_wait_context();
        let completions = counter();
        start_counted(&wait, &completions);

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(wait.status(), Status::Success);
        assert_eq!(event.count_of_waiters(), 0);
        assert!(!event.is_signaled());
    }

    #[test]
    fn auto_reset_releases_exactly_one_waiter() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        let first = event.create_wait_context();
        let second = event.create_wait_context();
        let completions = counter();

        start_counted(&first, &completions);
        start_counted(&second, &completions);
        assert_eq!(event.count_of_waiters(), 2);

        event.set_event();

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(first.status(), Status::Success);
        assert_eq!(second.status(), Status::Pending);
        assert!(!event.is_signaled());
        assert_eq!(event.count_of_waiters(), 1);

        event.set_event();
        assert_eq!(second.status(), Status::Success);
    }

    #[test]
    fn manual_reset_releases_all_waiters_and_stays_set() {
        let event = WaitEvent::new(ResetMode::Manual, false);
        let completions = counter();
        let waits: Vec<_> = (0..5).map(|_| event.create_wait_context()).collect();

        for wait in &waits {
            start_counted(wait, &completions);
        }

        event.set_event();

        assert_eq!(completions.load(Ordering::SeqCst), 5);
        assert!(event.is_signaled());
        assert_eq!(event.count_of_waiters(), 0);

        // Later waits complete immediately until the event is reset.
        let late = event.create_wait_context();
        start_counted(&late, &completions);
        assert_eq!(late.status(), Status::Success);

        event.reset_event();
        assert!(!event.is_signaled());

        late.reuse();
        start_counted(&late, &completions);
        assert_eq!(late.status(), Status::Pending);
        assert_eq!(event.count_of_waiters(), 1);
    }

    #[test]
    fn cancel_removes_pending_wait() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        let wait = event.create_wait_context();
        let completions = counter();

        start_counted(&wait, &completions);
        assert!(wait.cancel());

        assert_eq!(wait.status(), Status::Failed(Error::Cancelled));
        assert_eq!(event.count_of_waiters(), 0);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // The signal is not lost to the cancelled waiter.
        event.set_event();
        assert!(event.is_signaled());
    }

    #[test]
    fn cancel_after_completion_is_ignored() {
        let event = WaitEvent::new(ResetMode::Auto, true);
        let wait = event.create_wait_context();

        wait.start_wait_until_set(None, |_, _| {});
        assert!(!wait.cancel());
        assert_eq!(wait.status(), Status::Success);
    }

    #[test]
    fn change_mode_between_cycles() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        event.change_mode(ResetMode::Manual);
        assert_eq!(event.mode(), ResetMode::Manual);
    }

    #[test]
    #[should_panic]
    fn change_mode_with_pending_waiters_panics() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        let wait = event.create_wait_context();
        wait.start_wait_until_set(None, |_, _| {});

        event.change_mode(ResetMode::Manual);
    }

    #[test]
    fn async_wait_resolves_on_set() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        let wait = event.create_wait_context();

        let setter = thread::spawn({
            let event = event.clone();
            move || {
                while event.count_of_waiters() == 0 {
                    thread::yield_now();
                }
                event.set_event();
            }
        });

        let status = block_on(wait.start_wait_until_set_async(None));
        setter.join().unwrap();

        assert_eq!(status, Status::Success);
    }

    #[test]
    fn reused_wait_context_cycles_many_times() {
        let event = WaitEvent::new(ResetMode::Auto, false);
        let wait = event.create_wait_context();
        let completions = counter();

        for _ in 0..100 {
            start_counted(&wait, &completions);
            event.set_event();
            wait.reuse();
        }

        assert_eq!(completions.load(Ordering::SeqCst), 100);
        assert!(!event.is_signaled());
    }

    #[test]
    fn cancel_landing_before_the_wait_parks_is_kept() {
        for _ in 0..200 {
            let event = WaitEvent::new(ResetMode::Auto, false);
            let wait = event.create_wait_context();
            let cancelling = AtomicUsize::new(0);

            let held = event.shared.state.lock();

            let (accepted, status) = thread::scope(|scope| {
                // Started, then stuck on the event lock before it can park.
                let starter = scope.spawn(|| wait.start_wait_until_set(None, |_, _| {}));
                while wait.status() != Status::Pending {
                    spin_loop();
                }

                let canceller = scope.spawn(|| {
                    cancelling.store(1, Ordering::SeqCst);
                    wait.cancel()
                });
                while cancelling.load(Ordering::SeqCst) == 0 {
                    spin_loop();
                }
                for _ in 0..fastrand::usize(0..1_000) {
                    spin_loop();
                }

                drop(held);
                starter.join().unwrap();
                (canceller.join().unwrap(), wait.status())
            });

            assert!(accepted);
            assert_eq!(status, Status::Failed(Error::Cancelled));
            assert_eq!(event.count_of_waiters(), 0);

            event.set_event();
            assert!(event.is_signaled());
        }
    }

    #[test]
    fn dropping_the_event_releases_pending_waits() {
        let event = WaitEvent::new(ResetMode::Manual, false);
        let wait = event.create_wait_context();
        let completions = counter();

        start_counted(&wait, &completions);
        assert_eq!(wait.status(), Status::Pending);

        let weak = Arc::downgrade(&event.shared);
        drop(event);

        assert_eq!(weak.strong_count(), 0);
        assert_eq!(wait.status(), Status::Failed(Error::ShutdownPending));
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        wait.reuse();
        wait.start_wait_until_set(None, |_, _| {});
        assert_eq!(wait.status(), Status::Failed(Error::ShutdownPending));
        assert!(!wait.cancel());
    }
}
