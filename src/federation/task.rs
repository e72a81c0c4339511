//! Bounded waits and background retry

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Result of [`await_with_deadline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// Future finished in time
    Completed,
    /// Deadline passed first; the future was dropped
    TimedOut,
}

/// Await `fut` for at most `deadline`, then proceed either way
pub async fn await_with_deadline<F>(fut: F, deadline: Duration) -> DeadlineOutcome
where
    F: Future<Output = ()>,
{
    match time::timeout(deadline, fut).await {
        Ok(()) => DeadlineOutcome::Completed,
        Err(_) => DeadlineOutcome::TimedOut,
    }
}

/// Fixed-interval background retry.
///
/// The first attempt runs one interval after spawning. The loop ends on the
/// first attempt that returns `true`. Dropping the handle cancels it.
#[derive(Debug)]
pub struct RetryTask {
    handle: JoinHandle<()>,
}

impl RetryTask {
    /// Spawn on the current tokio runtime
    pub fn spawn<F>(interval: Duration, mut attempt: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if attempt() {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Stop retrying
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// True once the guarded operation succeeded or the task was cancelled
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RetryTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
