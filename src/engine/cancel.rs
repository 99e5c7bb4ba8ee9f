//! # Cooperative Cancellation
//!
//! A [`CancelToken`] is passed to every worker and checked at ready-group
//! and step-start boundaries; workers blocked on an external call race the
//! call against [`CancelToken::cancelled`]. Cancellation is one-way: once
//! requested it is never reset.
//!
//! Tokens form a tree. A child token observes its ancestors, so cancelling
//! a run reaches every group, while cancelling a fail-fast group's own
//! token stops that group's siblings without touching the rest of the run.

use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    ancestors: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            ancestors: Vec::new(),
        }
    }

    /// A token that is cancelled when either it or any ancestor is
    /// cancelled. Cancelling the child never propagates upward.
    pub fn child(&self) -> Self {
        let (sender, receiver) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.receiver.clone());
        Self {
            sender: Arc::new(sender),
            receiver,
            ancestors,
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.ancestors.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once this token or any ancestor is cancelled. `wait_for`
    /// checks the current value before awaiting changes, so a request that
    /// raced this call is never missed.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let watchers = std::iter::once(self.receiver.clone())
            .chain(self.ancestors.iter().cloned())
            .map(|mut rx| {
                let wait: BoxFuture<'static, ()> = async move {
                    // A closed channel without a cancel request means the
                    // originating token is gone; treat as never-cancelled.
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                .boxed();
                wait
            })
            .collect::<Vec<_>>();
        select_all(watchers).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
