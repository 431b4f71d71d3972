use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a background loop.
///
/// Stopping lets the cycle in progress finish; no new cycle starts.
pub struct TaskHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(cancel: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { cancel, join }
    }

    /// Signals the task to stop after its current cycle.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
}
