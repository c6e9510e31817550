use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Owned handle to a provider streaming task.
///
/// `stop()` signals the task and waits for it to finish. Dropping the handle
/// sends the stop signal and aborts the task if it is still running.
#[derive(Debug)]
pub struct StreamHandle {
    join: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl StreamHandle {
    /// Wrap a spawned stream task and its stop channel.
    #[must_use]
    pub const fn new(join: JoinHandle<()>, stop_tx: oneshot::Sender<()>) -> Self {
        Self {
            join: Some(join),
            stop_tx: Some(stop_tx),
        }
    }

    /// Request graceful shutdown and await the task.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Abort the task without waiting.
    pub fn abort(&mut self) {
        if let Some(join) = self.join.as_ref() {
            join.abort();
        }
    }

    /// Whether the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take()
            && !join.is_finished()
        {
            join.abort();
        }
    }
}
