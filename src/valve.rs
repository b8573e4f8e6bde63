//! Readiness valve: bounded waits on external conditions
//!
//! Actions use [`await_condition`] when the next step depends on something
//! outside the process catching up (replication lag, a pod becoming ready).
//! A `false` answer is never fatal; the action reports "not ready" and the
//! state machine retries on a later tick.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Call `probe` until it answers `true` or `timeout` has elapsed, sleeping
/// `poll_interval` between calls. Blocks for at most
/// `timeout + poll_interval` plus the probes' own running time. A probe error
/// counts as "not ready".
pub async fn await_condition<F, Fut, E>(mut probe: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match probe().await {
            Ok(true) => {
                debug!(attempts, elapsed_ms = started.elapsed().as_millis() as u64, "Condition met");
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(attempts, error = %e, "Readiness probe failed, treating as not ready"),
        }

        if started.elapsed() >= timeout {
            debug!(attempts, timeout_ms = timeout.as_millis() as u64, "Condition not met before timeout");
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Timeout and poll interval for one kind of wait, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Valve {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Valve {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl Valve {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            poll_interval_ms: poll_interval.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub async fn wait<F, Fut, E>(&self, probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        await_condition(probe, self.timeout(), self.poll_interval()).await
    }
}

/// Source of a replication checkpoint, in Unix seconds.
#[async_trait]
pub trait CheckpointSource: Send + Sync {
    async fn checkpoint(&self) -> Result<Option<i64>, String>;
}

/// Passes once the replication checkpoint is no older than
/// `now - allowed_skew`.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointGate {
    pub allowed_skew: Duration,
    pub valve: Valve,
}

impl CheckpointGate {
    pub fn new(allowed_skew: Duration, valve: Valve) -> Self {
        Self { allowed_skew, valve }
    }

    pub fn is_fresh(&self, checkpoint_unix_secs: i64, now: DateTime<Utc>) -> bool {
        let skew = self.allowed_skew.as_secs() as i64;
        checkpoint_unix_secs >= now.timestamp() - skew
    }

    pub async fn wait_for(&self, source: &dyn CheckpointSource) -> bool {
        let gate = *self;
        self.valve
            .wait(move || async move {
                let checkpoint = source.checkpoint().await?;
                Ok::<bool, String>(checkpoint.is_some_and(|c| gate.is_fresh(c, Utc::now())))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_condition_met_on_third_probe() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let ready = await_condition(
            || {
                let calls = calls.clone();
                async move { Ok::<bool, String>(calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await;

        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_returns_false_within_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let ready = await_condition(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, String>(false)
                }
            },
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .await;

        assert!(!ready);
        assert!(started.elapsed() <= Duration::from_secs(7));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_count_as_not_ready() {
        let ready = await_condition(
            || async { Err::<bool, String>("connection refused".to_string()) },
            Duration::from_secs(3),
            Duration::from_secs(1),
        )
        .await;
        assert!(!ready);
    }

    struct Fixed(Option<i64>);

    #[async_trait]
    impl CheckpointSource for Fixed {
        async fn checkpoint(&self) -> Result<Option<i64>, String> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_checkpoint_freshness_boundary() {
        let gate = CheckpointGate::new(Duration::from_secs(60), Valve::default());
        let now = Utc::now();
        assert!(gate.is_fresh(now.timestamp() - 60, now));
        assert!(!gate.is_fresh(now.timestamp() - 61, now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_checkpoint_passes_immediately_and_past_one_blocks_for_budget() {
        let gate = CheckpointGate::new(
            Duration::ZERO,
            Valve::new(Duration::from_secs(3), Duration::from_millis(500)),
        );

        let started = Instant::now();
        assert!(gate.wait_for(&Fixed(Some(Utc::now().timestamp() + 10))).await);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = Instant::now();
        assert!(!gate.wait_for(&Fixed(Some(Utc::now().timestamp() - 10))).await);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_gate_waits_on_stale_checkpoint() {
        let gate = CheckpointGate::new(
            Duration::from_secs(60),
            Valve::new(Duration::from_secs(3), Duration::from_secs(1)),
        );

        let stale = Fixed(Some(Utc::now().timestamp() - 3600));
        assert!(!gate.wait_for(&stale).await);

        assert!(!gate.wait_for(&Fixed(None)).await);

        let fresh = Fixed(Some(Utc::now().timestamp()));
        assert!(gate.wait_for(&fresh).await);
    }
}
