use tokio::{sync::oneshot, task::JoinHandle};
use tracing::error;

/// A background task stopped through a oneshot.
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(name: &'static str, shutdown: oneshot::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the task and waits for it to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!("{} ended abnormally: {err}", self.name);
            }
        }
    }
}
