//! Background task tracking for long-lived server processes.
//!
//! A persistent process has no platform that keeps it alive for pending
//! work, so [`BackgroundTasks`] plays that role: every task handed to it is
//! spawned onto the tokio runtime and tracked until it settles. Call
//! [`BackgroundTasks::drain`] during graceful shutdown so registered work is
//! not cut off.

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::scope::{BackgroundTask, WaitUntil};

/// The [`WaitUntil`] primitive for a persistent host.
///
/// Failures are logged and never reach the request that registered the task.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked tasks that have not been reaped yet.
    pub fn pending(&self) -> usize {
        self.set.lock().len()
    }

    /// Waits for every tracked task, including ones registered while draining.
    pub async fn drain(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.set.lock());
            if set.is_empty() {
                return;
            }
            debug!(count = set.len(), "draining background tasks");
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "background task panicked or was cancelled");
                }
            }
        }
    }
}

impl WaitUntil for BackgroundTasks {
    fn wait_until(&self, task: BackgroundTask) {
        let mut set = self.set.lock();
        // Reap whatever already finished so the set does not grow unbounded.
        while let Some(joined) = set.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "background task panicked or was cancelled");
            }
        }
        set.spawn(async move {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn drain_waits_for_every_task() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for delay in [10, 1, 5] {
            let done = Arc::clone(&done);
            tasks.wait_until(
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed(),
            );
        }
        assert_eq!(tasks.pending(), 3);

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn failures_are_contained() {
        let tasks = BackgroundTasks::new();
        tasks.wait_until(async { Err(anyhow::anyhow!("lost connection")) }.boxed());
        tasks.wait_until(async { Ok(()) }.boxed());
        tasks.drain().await;
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn tasks_registered_while_draining_are_awaited() {
        let tasks = Arc::new(BackgroundTasks::new());
        let done = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&tasks);
        let counter = Arc::clone(&done);
        tasks.wait_until(
            async move {
                let counter = Arc::clone(&counter);
                inner.wait_until(
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed(),
                );
                Ok(())
            }
            .boxed(),
        );

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
