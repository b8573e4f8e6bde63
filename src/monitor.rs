//! Lifecycle monitoring
//!
//! The scheduler and the execution service emit named lifecycle events to a
//! [`MonitoringSink`] handed to them at construction. Sinks: structured logs
//! ([`TracingSink`]), in-process counters ([`MetricsSink`]), fan-out to several
//! sinks ([`FanoutSink`]) and an in-memory recorder for tests
//! ([`RecordingSink`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleKind {
    JobStart,
    JobStop,
    JobDestroy,
    TaskStart,
    TaskEnd,
    TaskFail,
    TaskInterrupt,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::JobStart => "job.start",
            LifecycleKind::JobStop => "job.stop",
            LifecycleKind::JobDestroy => "job.destroy",
            LifecycleKind::TaskStart => "task.start",
            LifecycleKind::TaskEnd => "task.end",
            LifecycleKind::TaskFail => "task.fail",
            LifecycleKind::TaskInterrupt => "task.interrupt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub outcome: EventOutcome,
    /// Workflow or job id.
    pub subject_id: String,
    /// Workflow type or job type.
    pub type_tag: String,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn success(kind: LifecycleKind, subject_id: &str, type_tag: &str) -> Self {
        Self {
            kind,
            outcome: EventOutcome::Success,
            subject_id: subject_id.to_string(),
            type_tag: type_tag.to_string(),
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn failure(kind: LifecycleKind, subject_id: &str, type_tag: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            outcome: EventOutcome::Failure,
            subject_id: subject_id.to_string(),
            type_tag: type_tag.to_string(),
            detail: Some(detail.into()),
            at: Utc::now(),
        }
    }
}

pub trait MonitoringSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Writes every event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MonitoringSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        match event.outcome {
            EventOutcome::Success => info!(
                event.kind = event.kind.as_str(),
                subject.id = %event.subject_id,
                subject.type = %event.type_tag,
                "Lifecycle event"
            ),
            EventOutcome::Failure => warn!(
                event.kind = event.kind.as_str(),
                subject.id = %event.subject_id,
                subject.type = %event.type_tag,
                detail = event.detail.as_deref().unwrap_or(""),
                "Lifecycle event failed"
            ),
        }
    }
}

/// Per-kind success/failure counters.
#[derive(Debug, Default)]
pub struct MetricsSink {
    counters: Mutex<HashMap<(LifecycleKind, EventOutcome), Arc<AtomicU64>>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: LifecycleKind, outcome: EventOutcome) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .entry((kind, outcome))
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn count(&self, kind: LifecycleKind, outcome: EventOutcome) -> u64 {
        self.counter(kind, outcome).load(Ordering::Relaxed)
    }

    pub fn log_stats(&self) {
        let counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for ((kind, outcome), value) in counters.iter() {
            info!(
                event.kind = kind.as_str(),
                outcome = ?outcome,
                count = value.load(Ordering::Relaxed),
                "Lifecycle counter"
            );
        }
    }
}

impl MonitoringSink for MetricsSink {
    fn emit(&self, event: &LifecycleEvent) {
        self.counter(event.kind, event.outcome)
            .fetch_add(1, Ordering::Relaxed);
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn MonitoringSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn MonitoringSink>>) -> Self {
        Self { sinks }
    }
}

impl MonitoringSink for FanoutSink {
    fn emit(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<LifecycleKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl MonitoringSink for RecordingSink {
    fn emit(&self, event: &LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Span carrying workflow attributes for everything logged inside one step.
pub fn workflow_span(workflow_id: &str, workflow_type: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        workflow.id = workflow_id,
        workflow.type = workflow_type,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

pub fn job_span(job_id: &str, job_type: &str) -> tracing::Span {
    tracing::info_span!("job", job.id = job_id, job.type = job_type, otel.kind = "internal")
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_sink_counts_by_kind_and_outcome() {
        let metrics = MetricsSink::new();
        metrics.emit(&LifecycleEvent::success(LifecycleKind::JobStart, "job-1", "backfill"));
        metrics.emit(&LifecycleEvent::success(LifecycleKind::JobStart, "job-2", "backfill"));
        metrics.emit(&LifecycleEvent::failure(LifecycleKind::JobStart, "job-3", "backfill", "spawn failed"));

        assert_eq!(metrics.count(LifecycleKind::JobStart, EventOutcome::Success), 2);
        assert_eq!(metrics.count(LifecycleKind::JobStart, EventOutcome::Failure), 1);
        assert_eq!(metrics.count(LifecycleKind::JobDestroy, EventOutcome::Success), 0);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let recorder = Arc::new(RecordingSink::new());
        let metrics = Arc::new(MetricsSink::new());
        let fanout = FanoutSink::new(vec![recorder.clone(), metrics.clone(), Arc::new(TracingSink)]);

        fanout.emit(&LifecycleEvent::success(LifecycleKind::TaskEnd, "wf-1", "migration"));

        assert_eq!(recorder.kinds(), vec![LifecycleKind::TaskEnd]);
        assert_eq!(metrics.count(LifecycleKind::TaskEnd, EventOutcome::Success), 1);
    }
}
