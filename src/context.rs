//! Call context: deadlines and cooperative cancellation.
//!
//! Every lifecycle and key-value operation takes a [`Context`]. Backend calls
//! are run through [`Context::run`], which aborts the in-flight future when the
//! deadline passes or the context is cancelled.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a context-bound call was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was cancelled explicitly.
    #[error("operation cancelled")]
    Cancelled,

    /// The context deadline passed before the call completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Deadline plus cancellation signal shared by clones.
///
/// Cloning a context shares its cancellation state, so cancelling any clone
/// cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Arc<CancelState>,
}

impl Context {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    /// A fresh context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Derive a context sharing this one's cancellation, with a deadline no
    /// later than `timeout` from now. A timeout too large to represent as an
    /// instant adds no deadline.
    pub fn timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a context sharing this one's cancellation, with the earlier of
    /// the current deadline and `deadline`.
    pub fn deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// The deadline, if one is set.
    pub fn expires_at(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancel.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.cancelled.load(Ordering::SeqCst)
    }

    /// Check the context without running anything.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Run `fut` under this context.
    ///
    /// The future is dropped, not merely abandoned, when the context expires,
    /// so any state it was building is discarded with it.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ContextError>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancelled() => Err(ContextError::Cancelled),
                    res = tokio::time::timeout_at(deadline, fut) => {
                        res.map_err(|_| ContextError::DeadlineExceeded)
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancelled() => Err(ContextError::Cancelled),
                    value = fut => Ok(value),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = Context::background();
        let value = ctx.run(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_deadline_aborts_slow_future() {
        let ctx = Context::with_timeout(Duration::from_millis(10));
        let res = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(res, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let ctx = Context::with_timeout(Duration::MAX);
        assert!(ctx.expires_at().is_none());
        assert_eq!(ctx.run(async { 1 }).await, Ok(1));

        let bounded = Context::with_timeout(Duration::from_secs(5));
        let derived = bounded.timeout(Duration::MAX);
        assert_eq!(derived.expires_at(), bounded.expires_at());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_clones() {
        let ctx = Context::background();
        let child = ctx.timeout(Duration::from_secs(60));

        let waiter = tokio::spawn({
            let child = child.clone();
            async move { child.run(tokio::time::sleep(Duration::from_secs(60))).await }
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        ctx.cancel();

        assert_eq!(waiter.await.unwrap(), Err(ContextError::Cancelled));
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_context_skips_future() {
        let ctx = Context::background();
        ctx.cancel();
        let res = ctx.run(async { 1 }).await;
        assert_eq!(res, Err(ContextError::Cancelled));
    }

    #[test]
    fn test_derived_deadline_never_extends() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        let outer = ctx.expires_at().unwrap();
        let derived = ctx.timeout(Duration::from_secs(60));
        assert_eq!(derived.expires_at(), Some(outer));
    }
}
