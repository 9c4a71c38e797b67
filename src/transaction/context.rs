// ============================================================================
// Request-scoped call context
// ============================================================================
//
// Every operation takes a `&Context`. It carries:
//
// - the active transaction, if an outer `tx` call placed one there
// - an optional deadline
// - zero or more cancellation signals
//
// Contexts are cheap to clone and immutable; `with_*` methods derive
// children that inherit everything from their parent.
//
// ============================================================================

use super::TxHandle;
use crate::core::{Error, Result};
use futures::future::{self, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Clone, Default)]
pub struct Context {
    tx: Option<TxHandle>,
    deadline: Option<Instant>,
    cancels: Vec<watch::Receiver<bool>>,
}

/// Cancels every context derived from the one returned alongside it.
///
/// Dropping the handle does not cancel.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Context {
    /// The empty root context: no transaction, no deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a child carrying `tx`. `None` returns an unchanged copy.
    pub fn with_tx(&self, tx: Option<TxHandle>) -> Self {
        match tx {
            Some(tx) => Self {
                tx: Some(tx),
                ..self.clone()
            },
            None => self.clone(),
        }
    }

    /// The transaction carried by this context.
    pub fn tx(&self) -> Option<&TxHandle> {
        self.tx.as_ref()
    }

    /// Returns a child with the transaction removed.
    pub fn without_tx(&self) -> Self {
        Self {
            tx: None,
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a child with `deadline`, or the parent's if that one is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut child = self.clone();
        child.cancels.push(receiver);
        (
            child,
            CancelHandle {
                sender: Arc::new(sender),
            },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<Error> {
        if self.cancels.iter().any(|rx| *rx.borrow()) {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drives `fut` until it completes or this context is done.
    ///
    /// An abandoned future is dropped, which aborts its in-flight I/O.
    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        if self.deadline.is_none() && self.cancels.is_empty() {
            return fut.await;
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = fut => result,
            _ = deadline => Err(Error::DeadlineExceeded),
            _ = self.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn cancelled(&self) {
        if self.cancels.is_empty() {
            return future::pending().await;
        }
        let waits = self.cancels.iter().cloned().map(|mut rx| {
            async move {
                // A dropped sender can no longer cancel.
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if closed {
                    future::pending::<()>().await;
                }
            }
            .boxed()
        });
        future::select_all(waits).await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tx", &self.tx.as_ref().map(TxHandle::id))
            .field("deadline", &self.deadline)
            .field("cancels", &self.cancels.len())
            .finish()
    }
}
