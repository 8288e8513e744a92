//! Handle for a periodic background loop with cooperative shutdown.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

pub struct BackgroundLoop {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundLoop {
    /// Spawn `body` with the receiving end of the shutdown channel.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        if let Err(err) = self.handle.await {
            error!(task = self.name, %err, "background loop panicked");
        }
    }
}

/// Resolves once shutdown was requested or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        let requested = *shutdown_rx.borrow();
        if requested {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
