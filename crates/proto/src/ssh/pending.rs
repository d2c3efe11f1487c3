//! One-shot completion handles for asynchronous operations.
//!
//! Every user operation that waits on the peer returns a [`Pending`]. The
//! matching [`Completion`] is owned by whatever queue tracks the operation;
//! since a `Completion` is consumed when it fires, each operation resolves at
//! most once. Dropping the completion without firing (connection torn down)
//! resolves the handle with [`WispError::Disconnected`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use wisp_platform::{WispError, WispResult};

/// Sending half, held by the controller.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    tx: oneshot::Sender<WispResult<T>>,
}

impl<T> Completion<T> {
    /// Resolves the operation. A dropped [`Pending`] is not an error.
    pub(crate) fn complete(self, result: WispResult<T>) {
        let _ = self.tx.send(result);
    }
}

/// Result of an operation that completes later.
///
/// Await it, or poll it synchronously with [`Pending::try_take`].
#[derive(Debug)]
#[must_use = "the operation result is delivered through this handle"]
pub struct Pending<T> {
    rx: oneshot::Receiver<WispResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new() -> (Completion<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx }, Self { rx })
    }

    /// A handle that is already resolved.
    pub(crate) fn resolved(result: WispResult<T>) -> Self {
        let (completion, pending) = Self::new();
        completion.complete(result);
        pending
    }

    /// Returns the result if the operation has finished.
    pub fn try_take(&mut self) -> Option<WispResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(WispError::Disconnected)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = WispResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(WispError::Disconnected)))
    }
}
