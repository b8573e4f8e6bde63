use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

/// Floor for the stop check interval; zero would spin.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Cooperative stop request, raised either by the stop file appearing or by
/// the process receiving SIGTERM. Handlers poll it every `interval`.
#[derive(Debug, Clone)]
pub struct StopSignal {
    path: Option<PathBuf>,
    flag: Arc<AtomicBool>,
    interval: Duration,
}

impl StopSignal {
    pub fn new(path: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            path,
            flag: Arc::new(AtomicBool::new(false)),
            interval: interval.max(MIN_CHECK_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if self.path.as_ref().is_some_and(|p| p.exists()) {
            self.trigger();
            return true;
        }
        false
    }

    /// Resolve once a stop has been requested, checking every `interval`.
    pub async fn stopped(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Raise the flag when the process receives SIGTERM, as pods do on
    /// deletion.
    #[cfg(unix)]
    pub fn listen_for_sigterm(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let flag = Arc::clone(&self.flag);
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM, stopping cooperatively");
                flag.store(true, Ordering::SeqCst);
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn listen_for_sigterm(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stop_file_is_noticed_within_one_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.stop");
        let signal = StopSignal::new(Some(path.clone()), Duration::from_millis(10));
        assert!(!signal.is_stopped());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.stopped().await })
        };
        std::fs::write(&path, b"stop").unwrap();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_yields() {
        let signal = StopSignal::new(None, Duration::ZERO);
        assert_eq!(signal.interval(), MIN_CHECK_INTERVAL);

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_trigger_is_shared_between_clones() {
        let signal = StopSignal::new(None, Duration::from_secs(1));
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_stopped());
    }
}
