// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Cancellable, restartable asynchronous operations and the coordination primitives built on
//! them.
//!
//! Every primitive in this crate follows the same "start now, complete later" model described
//! by [`AsyncOperation`]: a `start_*` call registers a one-shot completion callback and returns
//! immediately, and the operation completes exactly once per start, either inline or later on
//! whichever thread satisfies it. Completed operations can be [reused][AsyncOperation::reuse]
//! without reallocation.
//!
//! # Primitives
//!
//! - [`WaitEvent`]: an auto or manual reset event awaited through [`WaitOperation`]s.
//! - [`QuotaGate`]: a counting semaphore with strict first-come first-served admission,
//!   acquired through [`AcquireOperation`]s.
//! - [`BoundedQueue`]: a FIFO queue with priority lanes, pause/resume and a drain-aware
//!   deactivation, consumed through [`DequeueOperation`]s.
//! - [`SequencedGate`]: a queue that releases [`Sequenced`] items strictly in key order.
//! - [`Service`]: an open/close state machine whose close can be deferred until outstanding
//!   service activity has been released.
//!
//! # Threading
//!
//! All types are `Send` and `Sync`. Internal state is guarded by spin locks with short
//! critical sections, so no call ever parks the calling thread. Completion callbacks and
//! [`ServiceHooks`] are never invoked while an internal lock is held and may call back into
//! the same primitive.
//!
//! # Async
//!
//! Each `start_*` method has an `*_async` counterpart that resolves to the completion status,
//! for use from any executor.
//!
//! ```
//! use futures::executor::block_on;
//! use latchwork::{BoundedQueue, Status};
//!
//! let queue = BoundedQueue::new();
//! queue.activate(None, |_, _| {});
//! queue.enqueue(7_u32).unwrap();
//!
//! let dequeue = queue.create_dequeue_operation();
//! assert_eq!(block_on(dequeue.start_dequeue_async(None)), Ok(7));
//! ```
//!
//! # Errors
//!
//! Requests that cannot begin are rejected synchronously with an [`Error`] (or a [`Rejected`]
//! that hands the item back). Operations that began but did not succeed complete with
//! [`Status::Failed`]. Contract violations, such as reusing an operation while it is in
//! flight, panic.

mod awaitable;
mod error;
mod operation;
mod queue;
mod quota_gate;
mod sequenced_gate;
mod service;
mod status;
mod wait_event;

pub use error::{Error, Rejected, Result};
pub use operation::{AsyncOperation, CompletionCallback, ParentRef};
pub use queue::{BoundedQueue, DequeueOperation};
pub use quota_gate::{AcquireOperation, QuotaGate};
pub use sequenced_gate::{Sequenced, SequencedGate};
pub use service::{CompletionContext, Service, ServiceHooks};
pub use status::Status;
pub use wait_event::{ResetMode, WaitEvent, WaitOperation};
