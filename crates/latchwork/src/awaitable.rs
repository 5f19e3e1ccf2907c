// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bridges completion callbacks into futures for the `*_async` start variants.

use futures_channel::oneshot;

use crate::{Error, Status};

/// Write half of a completion bridge, moved into a completion callback.
#[derive(Debug)]
pub(crate) struct StatusSender {
    tx: oneshot::Sender<Status>,
}

impl StatusSender {
    pub(crate) fn send(self, status: Status) {
        // The receiving future may have been dropped - nobody is interested any more.
        _ = self.tx.send(status);
    }
}

/// Read half of a completion bridge.
#[derive(Debug)]
pub(crate) struct StatusReceiver {
    rx: oneshot::Receiver<Status>,
}

impl StatusReceiver {
    /// Resolves to the status delivered by the completion callback.
    ///
    /// A callback that is dropped without being invoked can only mean that the operation was
    /// torn down while pending, which we report as a shutdown.
    pub(crate) async fn recv(self) -> Status {
        self.rx.await.unwrap_or(Status::Failed(Error::ShutdownPending))
    }
}

pub(crate) fn status_channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = oneshot::channel();
    (StatusSender { tx }, StatusReceiver { rx })
}
