//! Health surface: counters, alerting, and the snapshot served to operators.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use manusync_core::{RecordId, SyncOutcome};

use crate::lock::LockStats;

/// A permanent failure handed to the alerting collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub record_id: RecordId,
    pub attempt: u32,
    pub error: String,
    /// Stored state is inconsistent; an operator must repair it.
    pub integrity: bool,
    pub raised_at: DateTime<Utc>,
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &Alert);
}

/// Logs alerts at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: &Alert) {
        tracing::error!(
            record_id = %alert.record_id,
            attempt = alert.attempt,
            integrity = alert.integrity,
            error = %alert.error,
            "synchronization failed permanently"
        );
    }
}

/// Process-wide counters, updated as attempts finish.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    success: AtomicU64,
    escalated: AtomicU64,
    failed_retryable: AtomicU64,
    failed_permanent: AtomicU64,
    integrity_errors: AtomicU64,
    redetections: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
    events_appended: AtomicU64,
    event_append_failures: AtomicU64,
}

impl SyncMetrics {
    pub fn record_outcome(&self, outcome: SyncOutcome) {
        let counter = match outcome {
            SyncOutcome::Success => &self.success,
            SyncOutcome::Escalated => &self.escalated,
            SyncOutcome::FailedRetryable => &self.failed_retryable,
            SyncOutcome::FailedPermanent => &self.failed_permanent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_error(&self) {
        self.integrity_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redetections(&self, n: u32) {
        self.redetections.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub fn record_rollback(&self, succeeded: bool) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.rollback_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_append(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.events_appended
        } else {
            &self.event_append_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            success: load(&self.success),
            escalated: load(&self.escalated),
            failed_retryable: load(&self.failed_retryable),
            failed_permanent: load(&self.failed_permanent),
            integrity_errors: load(&self.integrity_errors),
            redetections: load(&self.redetections),
            rollbacks: load(&self.rollbacks),
            rollback_failures: load(&self.rollback_failures),
            events_appended: load(&self.events_appended),
            event_append_failures: load(&self.event_append_failures),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub success: u64,
    pub escalated: u64,
    pub failed_retryable: u64,
    pub failed_permanent: u64,
    pub integrity_errors: u64,
    pub redetections: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub events_appended: u64,
    pub event_append_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub locks: LockStats,
    pub retry_queue_depth: usize,
    pub escalation_queue_depth: usize,
    pub metrics: MetricsSnapshot,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Healthy means no permanent failures and no broken state so far.
    pub fn is_healthy(&self) -> bool {
        self.metrics.failed_permanent == 0
            && self.metrics.integrity_errors == 0
            && self.metrics.rollback_failures == 0
            && self.metrics.event_append_failures == 0
    }
}
