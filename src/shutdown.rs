use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Graceful shutdown coordinator for the scheduler loop.
///
/// Cloneable; every clone observes the same flag. The loop checks
/// [`ShutdownCoordinator::is_shutting_down`] between scans and races its sleep
/// against [`ShutdownCoordinator::wait`].
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    pub fn trigger(&self) {
        if !self.is_shutting_down() {
            info!("Shutdown requested");
        }
        self.sender.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        // An error means every sender is gone, which only happens when no
        // one can trigger shutdown any more; treat it as triggered.
        let _ = receiver.wait_for(|stopping| *stopping).await;
    }

    /// Trigger shutdown on Ctrl-C or SIGTERM.
    pub fn install_signal_handlers(&self) {
        info!("Installing signal handlers for graceful shutdown");
        let coordinator = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            coordinator.trigger();
        });
    }

    /// Wait up to `grace` for `drain` to finish, e.g. in-flight workflow
    /// tasks.
    pub async fn drain<F>(&self, grace: Duration, drain: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        match timeout(grace, drain).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                true
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Timed out waiting for in-flight work to finish");
                false
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
