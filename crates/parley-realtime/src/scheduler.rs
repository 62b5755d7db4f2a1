//! Session-scoped task scheduling.
//!
//! Every background task and timer a session starts (presence coalescing
//! windows, ring timers, resyncs) goes through one [`TaskScheduler`], so
//! shutdown can cancel and drain them as a unit.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Default time allowed for tasks to finish after cancellation.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns cancellable, tracked tasks for one session.
#[derive(Clone, Debug, Default)]
pub struct TaskScheduler {
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Handle to a pending timer. Dropping it does not cancel the timer.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Stop the timer. No-op if it already fired.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer was cancelled (directly or by shutdown).
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl TaskScheduler {
    /// Fresh scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown. Child tokens are cancelled with it.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `fut` until it completes or the scheduler shuts down.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            debug!("scheduler shut down, dropping task");
            return;
        }
        let token = self.token.clone();
        let _ = self.tracker.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = fut => {}
            }
        });
    }

    /// Run `fut` after `delay`, unless the returned handle is cancelled first.
    pub fn spawn_after<F>(&self, delay: Duration, fut: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = TimerHandle {
            token: token.clone(),
        };
        self.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        fut.await;
                    }
                }
            }
        });
        handle
    }

    /// Cancel everything and wait up to `timeout` for tasks to unwind.
    pub async fn shutdown(&self, timeout: Duration) {
        self.token.cancel();
        let _ = self.tracker.close();
        debug!(tasks = self.tracker.len(), "waiting for scheduled tasks");
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(?timeout, "scheduled tasks did not stop in time");
        }
    }
}
