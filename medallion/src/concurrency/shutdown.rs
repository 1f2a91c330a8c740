//! Broadcast shutdown signal built on a watch channel.

use std::sync::Arc;

use tokio::sync::watch;

/// Receiver side of the shutdown signal.
pub type ShutdownRx = watch::Receiver<()>;

/// Sender side of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<()>>);

impl ShutdownTx {
    /// Notifies every subscribed receiver.
    ///
    /// Fails only when no receiver is alive, which means there is nothing left to stop.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Returns a receiver that observes shutdown requests sent after this call.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Creates a shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(Arc::new(tx)), rx)
}

/// Resolves once shutdown has been requested.
///
/// When every sender is gone no shutdown can ever be requested, so the future stays pending.
pub async fn shutdown_requested(shutdown_rx: &mut ShutdownRx) {
    if shutdown_rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Returns `true` if shutdown was requested since the receiver last observed the channel.
pub fn is_shutdown_requested(shutdown_rx: &ShutdownRx) -> bool {
    shutdown_rx.has_changed().unwrap_or(false)
}
