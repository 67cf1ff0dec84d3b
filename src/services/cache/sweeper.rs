//! Background sweep tasks with an explicit stop signal.
//!
//! Every periodic cleanup in the gateway (in-memory bucket storage, revocation cache,
//! decision cache) runs through a `SweeperHandle`. The handle owns both the
//! cancellation token and the join handle, so shutdown can cancel *and* await the task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::ttl::MAX_TTL;

#[derive(Debug)]
pub struct SweeperHandle {
    name: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Spawn `sweep` every `period` until the handle is cancelled.
    ///
    /// The first sweep runs one full period after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        // tokio panics on a zero period
        let period = period.clamp(Duration::from_millis(1), MAX_TTL);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => sweep().await,
                }
            }

            tracing::debug!(sweeper = name, "sweeper stopped");
        });

        Self { name, token, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait until it has exited.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(sweeper = self.name, error = ?err, "sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sweeper_runs_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let handle = SweeperHandle::spawn("test", Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown().await;

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);

        // No further sweeps once shut down.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_cancel_terminates_promptly() {
        let handle = SweeperHandle::spawn("slow", Duration::from_secs(3600), || async {});
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("sweeper should stop well before its next tick");
    }
}
