//! Turn timers: the long-running watchdog and the idle-flush deadline.
//!
//! Both are cancelled on every exit path of a turn. The watchdog is a task
//! cancelled when its handle drops; the idle deadline lives inside the
//! stream loop and is simply disarmed.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Fires a callback once a turn has been running for a while.
///
/// Dropping the watchdog cancels it.
#[derive(Debug)]
pub struct TurnWatchdog {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TurnWatchdog {
    /// Run `on_fire` after `after` unless cancelled first.
    #[must_use]
    pub fn start<F>(after: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => on_fire.await,
            }
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the watchdog and wait for its task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TurnWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Deadline after which buffered output is flushed.
///
/// Armed while text or activity is pending; each new event re-arms it.
#[derive(Debug)]
pub struct IdleFlush {
    delay: Duration,
    deadline: Option<Instant>,
}

impl IdleFlush {
    /// Deadline `delay` after the last event.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// (Re)start the countdown.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Stop the countdown.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Resolves when the deadline passes; never resolves while disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
