//! Background polling task.
//!
//! One iteration runs every `interval`. Cancelling wakes the task immediately,
//! so [`Poller::stop`] returns within one iteration's runtime. A failing or
//! panicking iteration is logged and the loop keeps going.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handle on a running polling task.
pub struct Poller {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl Poller {
    /// Spawn the loop. `tick` is called once per interval.
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            info!(poller = %task_name, ?interval, "polling task started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if token.is_cancelled() {
                    break;
                }
                if let Err(panic) = AssertUnwindSafe(tick()).catch_unwind().await {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(poller = %task_name, "polling iteration panicked: {msg}");
                }
            }
            info!(poller = %task_name, "polling task stopped");
        });

        Self { name, cancel, task }
    }

    /// False once the task has returned.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel and join.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(poller = %self.name, "polling task ended abnormally: {e}");
        }
    }
}
