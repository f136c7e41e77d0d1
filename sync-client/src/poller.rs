//! Background poller for deferred operations.
//!
//! Runs while some tracker waits on the server. Each tick asks the engine
//! for a poll pass; the engine does the querying itself so results stay
//! serialized with everything else.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a running poll task. Aborts the task when dropped.
#[derive(Debug)]
pub struct DeferredPoller {
    handle: JoinHandle<()>,
}

impl DeferredPoller {
    /// Spawn a task calling `tick` every `period`, starting one period from
    /// now. The task ends on its own once `tick` returns false.
    pub fn start<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tracing::info!("Deferred poller started (interval: {:?})", period);

            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;

            loop {
                timer.tick().await;
                if !tick() {
                    tracing::debug!("Deferred poller: engine gone, stopping");
                    break;
                }
            }
        });
        Self { handle }
    }

    /// True once the task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop polling.
    pub fn stop(self) {
        self.handle.abort();
        tracing::info!("Deferred poller stopped");
    }
}

impl Drop for DeferredPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
