//! Monotonic-clock timers for phase transitions and per-turn deadlines.
//!
//! Timers are one-shot tokio tasks sleeping on `tokio::time::Instant`. A
//! timer never cancels another directly: each fired task re-checks its room
//! under the room lock (the caller captures the state it armed against and
//! no-ops if it has moved on), so a stale timer for a superseded state does
//! nothing. Shutdown is a watch flag every sleeping timer also waits on.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

#[derive(Clone)]
pub struct Scheduler {
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// Scheduler wired to a never-firing shutdown, for tests.
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the process lifetime.
        std::mem::forget(tx);
        Self { shutdown: rx }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run `task` at `deadline` unless shutdown intervenes. The task itself
    /// is responsible for its staleness guard.
    pub fn schedule_at<F, Fut>(&self, deadline: Instant, task: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // The watch guard must drop inside its own future: held across
            // `task().await` it would make the spawned future !Send.
            let stopped = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            tokio::select! {
                _ = sleep_until(deadline) => {
                    task().await;
                }
                _ = stopped => {
                    debug!("timer cancelled by shutdown");
                }
            }
        })
    }

    /// Convenience wrapper over [`Scheduler::schedule_at`] with a relative
    /// delay.
    pub fn schedule_after<F, Fut>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Sleep used by room driver loops. Returns `false` when shutdown fired
    /// first, so drivers can wind down their round.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }
}
