// src/core/scheduler.rs

//! A thin facade over the runtime timer for delayed, cancellable actions.
//!
//! The engines never touch the runtime timer directly; routing every watchdog
//! and retry delay through this facade keeps timer use in one place.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Schedules delayed actions and bounds futures with deadlines.
#[derive(Debug, Default, Clone)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Runs `action` after `delay` on a detached task. The returned handle
    /// cancels the timer, and the action itself if it has not started.
    pub fn after<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            action.await;
        });
        TimerHandle { handle }
    }

    /// Suspends the current task for `delay`.
    pub async fn sleep(&self, delay: Duration) {
        time::sleep(delay).await;
    }

    /// Runs `fut` under a watchdog. Returns `None` if the watchdog fired
    /// before `fut` completed; the future is dropped in that case.
    pub async fn deadline<F: Future>(&self, watchdog: Duration, fut: F) -> Option<F::Output> {
        time::timeout(watchdog, fut).await.ok()
    }
}

/// Cancellation handle for an action scheduled with [`Scheduler::after`].
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the pending action. A no-op if it already ran to completion.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
