// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use thiserror::Error;

/// A specialized `Result` type for operations that can be rejected or fail
/// with a latchwork [`Error`][enum@Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Why an operation was rejected or why an in-flight operation completed unsuccessfully.
///
/// Rejections are returned synchronously from the call that could not begin. Failures of
/// operations that did begin are delivered through the completed operation's
/// [`Status`][crate::Status]. Future versions may add additional enum variants.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The operation was cancelled before it could complete.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The owning component has been deactivated or closed.
    #[error("the owning component is shutting down")]
    ShutdownPending,

    /// A service was asked to open while an open was already in progress or done.
    #[error("the service is already opening or open")]
    SharingViolation,

    /// The request does not fit the current state of the component (e.g. a second close).
    #[error("the request is not valid in the current state")]
    Unsuccessful,

    /// The component has not been activated, or its activation cycle has already ended.
    #[error("the component is not active")]
    NotStarted,

    /// An item with the same sequence key is already held by the gate.
    #[error("an item with the same sequence key is already held")]
    KeyCollision,

    /// The sequence key is lower than the next key the gate expects.
    #[error("the sequence key precedes the next expected key")]
    KeyBehindGate,

    /// A caller-defined failure, e.g. reported by a service open or close hook.
    #[error("operation failed with code {0}")]
    Failed(u32),
}

/// An item that a queue or gate refused to accept, handed back to the caller
/// together with the reason.
///
/// The queue takes no ownership of a rejected item: it is returned untouched.
#[derive(Error)]
#[error("item rejected: {reason}")]
pub struct Rejected<T> {
    item: T,
    reason: Error,
}

impl<T> Rejected<T> {
    pub(crate) const fn new(item: T, reason: Error) -> Self {
        Self { item, reason }
    }

    /// The reason the item was rejected.
    #[must_use]
    pub const fn reason(&self) -> Error {
        self.reason
    }

    /// Takes the rejected item back.
    #[must_use]
    pub fn into_item(self) -> T {
        self.item
    }
}

// Items need not be `Debug` to be queued, so the item is left out.
impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").field("reason", &self.reason).finish_non_exhaustive()
    }
}
