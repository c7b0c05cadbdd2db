//! Retry queue for records whose last attempt failed with a retryable error.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use manusync_core::{RecordId, RetryPolicy};

/// What the queue did with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is due after `delay`.
    Scheduled { failures: u32, delay: Duration },
    /// The retry budget is spent.
    Exhausted { failures: u32 },
    /// The error is not worth retrying.
    NotRetryable,
}

#[derive(Debug)]
struct Entry {
    failures: u32,
    due: Instant,
    in_flight: bool,
}

#[derive(Debug)]
pub struct RetryQueue {
    policy: RetryPolicy,
    entries: Mutex<HashMap<RecordId, Entry>>,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Consecutive failures recorded for a record.
    pub fn failures(&self, record_id: &RecordId) -> u32 {
        self.entries
            .lock()
            .get(record_id)
            .map_or(0, |entry| entry.failures)
    }

    pub fn record_failure(&self, record_id: &RecordId, retryable: bool) -> RetryDecision {
        let mut entries = self.entries.lock();
        if !retryable {
            entries.remove(record_id);
            return RetryDecision::NotRetryable;
        }
        let failures = entries.get(record_id).map_or(0, |e| e.failures) + 1;
        if failures > self.policy.max_retries {
            entries.remove(record_id);
            return RetryDecision::Exhausted { failures };
        }
        let delay = self.policy.backoff(failures);
        entries.insert(
            record_id.clone(),
            Entry {
                failures,
                due: Instant::now() + delay,
                in_flight: false,
            },
        );
        RetryDecision::Scheduled { failures, delay }
    }

    pub fn record_success(&self, record_id: &RecordId) {
        self.entries.lock().remove(record_id);
    }

    /// Records whose retry is due, marked in flight so a second call does not
    /// hand them out again.
    pub fn take_due(&self) -> Vec<RecordId> {
        let now = Instant::now();
        let mut due: Vec<(Instant, RecordId)> = self
            .entries
            .lock()
            .iter_mut()
            .filter(|(_, e)| !e.in_flight && e.due <= now)
            .map(|(id, e)| {
                e.in_flight = true;
                (e.due, id.clone())
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Earliest pending retry not yet in flight.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.in_flight)
            .map(|e| e.due)
            .min()
    }

    /// Records waiting for (or running) a retry.
    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }
}
