//! Escalation feed: conflicts waiting for an editorial decision.
//!
//! Published escalations form an append-only log with increasing `seq`.
//! Subscribers read from a cursor and wait for new entries, so a consumer
//! that reconnects resumes after the last `seq` it saw. Separately the feed
//! tracks which escalations are still open and any decisions submitted for
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use manusync_core::{
    Conflict, Decision, Escalation, FieldValue, RecordId, ResolutionRule, SyncEvent, SyncOutcome,
};

use crate::error::SyncError;

type Key = (RecordId, String);

#[derive(Debug, Default)]
struct FeedState {
    log: Vec<Escalation>,
    /// Open escalation per field, by its index in `log`.
    open: BTreeMap<Key, usize>,
    /// Decision per open escalation.
    decisions: BTreeMap<Key, Decision>,
}

#[derive(Debug, Default)]
pub struct EscalationFeed {
    state: Mutex<FeedState>,
    published: Notify,
}

impl EscalationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `conflict` unless the same candidate pair is already open for
    /// the field. A different pair replaces the open escalation.
    pub fn publish(&self, conflict: &Conflict, raised_at: DateTime<Utc>) -> Option<Escalation> {
        let key = (conflict.record_id.clone(), conflict.field.clone());
        let canonical = conflict.canonical.new.as_ref();
        let shadow = conflict.shadow.new.as_ref();

        let escalation = {
            let mut state = self.state.lock();
            if let Some(&idx) = state.open.get(&key) {
                if state.log[idx].same_candidates(canonical, shadow) {
                    return None;
                }
            }
            let escalation = Escalation {
                seq: state.log.len() as u64 + 1,
                record_id: conflict.record_id.clone(),
                field: conflict.field.clone(),
                canonical: canonical.cloned(),
                shadow: shadow.cloned(),
                baseline: conflict.baseline_value().cloned(),
                confidence: conflict.confidence,
                raised_at,
            };
            state.log.push(escalation.clone());
            let idx = state.log.len() - 1;
            state.open.insert(key.clone(), idx);
            state.decisions.remove(&key);
            escalation
        };
        self.published.notify_waiters();
        tracing::info!(
            record_id = %escalation.record_id,
            field = %escalation.field,
            seq = escalation.seq,
            confidence = escalation.confidence,
            "escalation published"
        );
        Some(escalation)
    }

    /// The open escalation for a field, if any.
    pub fn open_for(&self, record_id: &RecordId, field: &str) -> Option<Escalation> {
        let state = self.state.lock();
        state
            .open
            .get(&(record_id.clone(), field.to_string()))
            .map(|&idx| state.log[idx].clone())
    }

    /// Attach `decision` to the escalation it decides. Fails if that
    /// escalation is closed or was replaced by one with other candidates.
    pub fn decide(&self, decision: Decision) -> Result<(), SyncError> {
        let key = (decision.record_id.clone(), decision.field.clone());
        let mut state = self.state.lock();
        let current = state.open.get(&key).map(|&idx| &state.log[idx]);
        if !current.is_some_and(|escalation| decision.decides(escalation)) {
            return Err(SyncError::NoOpenEscalation {
                record_id: decision.record_id,
                field: decision.field,
            });
        }
        state.decisions.insert(key, decision);
        Ok(())
    }

    /// Pending decisions for a record, as field → decided value (`None`
    /// deletes the field).
    pub fn decisions_for(&self, record_id: &RecordId) -> Vec<(String, Option<FieldValue>)> {
        self.state
            .lock()
            .decisions
            .iter()
            .filter(|((id, _), _)| id == record_id)
            .map(|((_, field), decision)| (field.clone(), decision.value.clone()))
            .collect()
    }

    /// Close the open escalation for a field and drop its decision.
    pub fn close(&self, record_id: &RecordId, field: &str) -> bool {
        let key = (record_id.clone(), field.to_string());
        let mut state = self.state.lock();
        state.decisions.remove(&key);
        state.open.remove(&key).is_some()
    }

    pub fn open(&self) -> Vec<Escalation> {
        let state = self.state.lock();
        let mut open: Vec<Escalation> = state.open.values().map(|&i| state.log[i].clone()).collect();
        open.sort_by_key(|e| e.seq);
        open
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn is_open(&self, record_id: &RecordId, field: &str) -> bool {
        self.state
            .lock()
            .open
            .contains_key(&(record_id.clone(), field.to_string()))
    }

    /// Highest `seq` published so far.
    pub fn last_seq(&self) -> u64 {
        self.state.lock().log.len() as u64
    }

    /// Replay one audit event: escalated conflicts of an escalated pass are
    /// republished and editorial decisions close their escalation. Failed
    /// passes published nothing live and publish nothing here.
    pub fn replay(&self, event: &SyncEvent) {
        if event.outcome == SyncOutcome::Escalated {
            for conflict in &event.conflicts {
                if event.escalated_fields.contains(&conflict.field) {
                    self.publish(conflict, event.timestamp);
                }
            }
        }
        if event.committed {
            for resolution in &event.resolutions {
                if resolution.rule == ResolutionRule::EditorialDecision {
                    self.close(&event.record_id, &resolution.field);
                }
            }
        }
    }

    /// Follow the feed from just after `after`.
    pub fn subscribe(self: &Arc<Self>, after: u64) -> EscalationSubscription {
        EscalationSubscription {
            feed: Arc::clone(self),
            cursor: after,
        }
    }

    fn entry_after(&self, cursor: u64) -> Option<Escalation> {
        self.state.lock().log.get(cursor as usize).cloned()
    }
}

/// A cursor into the escalation log. Never ends; waits for new entries.
#[derive(Debug)]
pub struct EscalationSubscription {
    feed: Arc<EscalationFeed>,
    cursor: u64,
}

impl EscalationSubscription {
    pub async fn next(&mut self) -> Escalation {
        loop {
            let notified = self.feed.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(escalation) = self.feed.entry_after(self.cursor) {
                self.cursor = escalation.seq;
                return escalation;
            }
            notified.await;
        }
    }

    /// `seq` of the last escalation returned; subscribe again from here to
    /// resume.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn into_stream(self) -> BoxStream<'static, Escalation> {
        stream::unfold(self, |mut sub| async move {
            let escalation = sub.next().await;
            Some((escalation, sub))
        })
        .boxed()
    }
}
