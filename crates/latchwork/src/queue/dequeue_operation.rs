// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use spin::Mutex;

use super::engine::DequeueHost;
use crate::awaitable::status_channel;
use crate::operation::{AsyncOperation, Completion, CompletionCallback, ParentRef};
use crate::{Error, Status};

/// A request for the next item of a [`BoundedQueue`][crate::BoundedQueue] or
/// [`SequencedGate`][crate::SequencedGate].
///
/// On success the item is held by the operation until it is taken with
/// [`take_dequeued_item()`][Self::take_dequeued_item].
///
/// An operation belongs to the activation cycle of the queue in which it was created. Once
/// that cycle has ended, starting the operation completes it with [`Error::ShutdownPending`],
/// even if the queue has been reused and activated again. Create a new operation for each
/// cycle.
pub struct DequeueOperation<T> {
    inner: Arc<DequeueInner<T>>,
}

struct DequeueInner<T> {
    host: Arc<dyn DequeueHost<T>>,
    generation: u64,
    item: Mutex<Option<T>>,
    completion: Completion<DequeueOperation<T>>,
}

impl<T: Send + 'static> DequeueOperation<T> {
    pub(crate) fn new(host: Arc<dyn DequeueHost<T>>, generation: u64) -> Self {
        Self {
            inner: Arc::new(DequeueInner {
                host,
                generation,
                item: Mutex::new(None),
                completion: Completion::new(),
            }),
        }
    }

    /// Starts waiting for an item.
    ///
    /// Completes inline if an item is ready (or the queue is shut down), otherwise when a
    /// future enqueue or resume supplies one.
    ///
    /// # Panics
    ///
    /// Panics if the operation is already started and has not been reused since.
    pub fn start_dequeue(
        &self,
        parent: Option<ParentRef>,
        callback: impl FnOnce(Option<&ParentRef>, &Self) + Send + 'static,
    ) {
        let callback: CompletionCallback<Self> = Box::new(callback);
        self.inner.completion.start(parent, callback);
        self.inner.host.post_wait(self);
    }

    /// Starts the dequeue and resolves to the item, or to the failure status.
    ///
    /// The dequeue is only started when the future is first polled.
    pub fn start_dequeue_async(
        &self,
        parent: Option<ParentRef>,
    ) -> impl Future<Output = Result<T, Status>> + Send + 'static {
        let dequeue = self.clone();

        async move {
            let (tx, rx) = status_channel();
            dequeue.start_dequeue(parent, move |_, dequeue| tx.send(dequeue.status()));

            match rx.recv().await {
                Status::Success => dequeue
                    .take_dequeued_item()
                    .ok_or(Status::Failed(Error::Unsuccessful)),
                status => Err(status),
            }
        }
    }

    /// Takes the item delivered by the last successful completion.
    ///
    /// Returns `None` if nothing was delivered or the item was already taken.
    #[must_use]
    pub fn take_dequeued_item(&self) -> Option<T> {
        self.inner.item.lock().take()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.inner.completion.is_cancel_requested()
    }

    pub(crate) fn deliver(&self, item: T) {
        *self.inner.item.lock() = Some(item);
        self.inner.completion.complete(self, Status::Success);
    }

    pub(crate) fn fail(&self, status: Status) -> bool {
        self.inner.completion.complete(self, status)
    }

    pub(crate) fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Send + 'static> AsyncOperation for DequeueOperation<T> {
    fn status(&self) -> Status {
        self.inner.completion.status()
    }

    fn cancel(&self) -> bool {
        if !self.inner.completion.request_cancel() {
            return false;
        }

        // A start that has not reached the queue yet sees the request and completes itself.
        if self.inner.host.cancel_wait(self) {
            self.fail(Status::Failed(Error::Cancelled));
        }

        true
    }

    /// Readies the operation for another start. An item that was delivered but never taken
    /// is dropped.
    fn try_reuse(&self) -> bool {
        if !self.inner.completion.try_reuse() {
            return false;
        }

        let stale = self.inner.item.lock().take();
        drop(stale);
        true
    }
}

impl<T> Clone for DequeueOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for DequeueOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DequeueOperation")
            .field("generation", &self.inner.generation)
            .field("has_item", &self.inner.item.lock().is_some())
            .field("completion", &self.inner.completion)
            .finish_non_exhaustive()
    }
}
