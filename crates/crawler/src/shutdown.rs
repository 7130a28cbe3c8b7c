//! Cooperative shutdown shared by the driver and its tasks.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wraps a cancellation token and wires it to SIGINT/SIGTERM.
///
/// Clones share the same token, so any holder can both trigger and wait.
#[derive(Clone, Default)]
pub struct ShutdownCondition {
    token: CancellationToken,
}

impl ShutdownCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a task that trips the condition on SIGINT or SIGTERM.
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
            token.cancel();
        });
        Ok(())
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when shutdown has been requested. Cancel-safe.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
