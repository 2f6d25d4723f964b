//! Fire-and-forget delayed actions.
//!
//! Nothing here is durable: actions that are not yet due when the process stops are lost.
//! Callers that need a retry to survive restarts must rebuild it from persisted state.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct DelayedScheduler {
    stop: CancellationToken,
    waiting: TaskTracker,
    running: TaskTracker,
}

impl Default for DelayedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedScheduler {
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            waiting: TaskTracker::new(),
            running: TaskTracker::new(),
        }
    }

    /// Run `action` on its own task once `delay` has elapsed.
    ///
    /// Returns false if the scheduler has been stopped; the action is dropped.
    pub fn schedule<F, Fut>(&self, delay: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.stop.is_cancelled() {
            debug!(?delay, "Scheduler stopped, dropping action");
            return false;
        }

        let stop = self.stop.clone();
        let running = self.running.clone();
        self.waiting.spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    running.spawn(action());
                }
            }
        });
        true
    }

    /// Actions waiting for their delay to elapse.
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }

    /// Actions whose delay elapsed and that have not finished yet.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Drop every action that is not yet due. Later `schedule` calls are refused.
    pub fn stop(&self) {
        let dropped = self.waiting.len();
        self.stop.cancel();
        self.waiting.close();
        if dropped > 0 {
            debug!(dropped, "Dropped pending delayed actions");
        }
    }

    /// Wait until all started actions have finished, or until `cancellation` fires.
    ///
    /// Returns false when cancelled first.
    pub async fn wait_all_running(&self, cancellation: &CancellationToken) -> bool {
        self.running.close();
        let drained = async {
            // After stop, let timers that already fired hand their action over
            if self.waiting.is_closed() {
                self.waiting.wait().await;
            }
            self.running.wait().await;
        };
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                warn!(running = self.running.len(), "Stopped waiting for delayed actions");
                false
            }
            _ = drained => true,
        }
    }
}
