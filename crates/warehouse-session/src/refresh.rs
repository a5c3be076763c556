//! Proactive refresh timing
//!
//! The session keeps exactly one timer. Arming it aborts whatever was armed
//! before in the same call, so a stale timer can never fire against a
//! credential that has already been replaced.

use std::future::Future;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;
use tracing::debug;
use warehouse_auth::{AuthError, Session};

/// What started a refresh. Decides how a transient failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The proactive timer fired
    Scheduled,
    /// A request came back 401, or a caller asked explicitly
    Demand,
}

impl RefreshTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshTrigger::Scheduled => "scheduled",
            RefreshTrigger::Demand => "demand",
        }
    }
}

/// Handle every concurrent caller awaits for one refresh attempt.
pub type RefreshHandle = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// Single-flight refresh state held in the session record.
pub enum RefreshState {
    Idle,
    Refreshing { id: u64, handle: RefreshHandle },
}

/// Delay until the proactive refresh should run.
///
/// `max(0, (expires_at - now) - threshold)`: a credential already inside the
/// threshold refreshes immediately.
pub fn refresh_delay(expires_at_ms: u64, now_ms: u64, threshold: Duration) -> Duration {
    let remaining = expires_at_ms.saturating_sub(now_ms);
    Duration::from_millis(remaining.saturating_sub(threshold.as_millis() as u64))
}

/// Cancellable single-slot timer.
#[derive(Default)]
pub struct RefreshTimer {
    handle: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Cancel any armed timer, then run `task` after `delay`.
    pub fn arm<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel() {
            debug!("replaced pending refresh timer");
        }
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    /// Abort the armed timer. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    #[cfg(test)]
    pub(crate) fn abort_handle(&self) -> Option<tokio::task::AbortHandle> {
        self.handle.as_ref().map(|h| h.abort_handle())
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
