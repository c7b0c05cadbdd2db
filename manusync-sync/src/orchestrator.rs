//! Sync orchestrator: one attempt per call, driven through the state machine
//!
//! ```text
//! Idle → LockAcquired → Detecting → Classifying → Resolving → Committing → Completed
//!                                                     │              │
//!                                                     └→ Escalated   └→ Failed
//! ```
//!
//! Every attempt ends in exactly one appended [`SyncEvent`], written while the
//! record lease is still held, and the lease is released on every path.
//! Errors are folded into the event; [`Orchestrator::synchronize`] never
//! fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::BoxStream;
use tokio::time::Instant;

use manusync_core::{
    Baseline, ChangeSet, Classification, Conflict, Decision, DeltaKind, Escalation, FieldDelta,
    FieldMap, FieldValue, ManuscriptRecord, RecordId, Resolution, ResolutionRule, Side, SyncConfig,
    SyncEvent, SyncOutcome, SyncPhase,
};

use crate::adapter::{Adapters, AgentStateStore, RecordStore};
use crate::baseline_store::{BaselineStore, MemoryBaselineStore};
use crate::classifier::{classify, Classified, ConflictScorer, RuleTableScorer};
use crate::decision_store::{DecisionStore, MemoryDecisionStore};
use crate::detector::{detect_changes, BaselineState};
use crate::error::SyncError;
use crate::escalation::{EscalationFeed, EscalationSubscription};
use crate::event_store::{self, EventStore, MemoryEventStore, PAGE_SIZE};
use crate::health::{Alert, AlertSink, HealthSnapshot, SyncMetrics, TracingAlertSink};
use crate::lock::{Acquire, AcquireMode, Lease, LockManager, MemoryLockManager};
use crate::resolver::{resolve, SideTimes};
use crate::retry::{RetryDecision, RetryQueue};

/// Actor recorded for calls made through [`Orchestrator::synchronize`].
pub const DEFAULT_ACTOR: &str = "api";
/// Actor recorded for attempts started by the retry queue.
pub const RETRY_ACTOR: &str = "retry";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires an [`Orchestrator`]. Both adapters are required; every other
/// collaborator falls back to its in-memory or default implementation.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<SyncConfig>,
    canonical: Option<Arc<dyn RecordStore>>,
    shadow: Option<Arc<dyn AgentStateStore>>,
    baselines: Option<Arc<dyn BaselineStore>>,
    events: Option<Arc<dyn EventStore>>,
    decisions: Option<Arc<dyn DecisionStore>>,
    locks: Option<Arc<dyn LockManager>>,
    scorer: Option<Arc<dyn ConflictScorer>>,
    alerts: Option<Arc<dyn AlertSink>>,
    holder: Option<String>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn canonical(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.canonical = Some(store);
        self
    }

    pub fn shadow(mut self, store: Arc<dyn AgentStateStore>) -> Self {
        self.shadow = Some(store);
        self
    }

    pub fn baselines(mut self, store: Arc<dyn BaselineStore>) -> Self {
        self.baselines = Some(store);
        self
    }

    pub fn events(mut self, store: Arc<dyn EventStore>) -> Self {
        self.events = Some(store);
        self
    }

    pub fn decisions(mut self, store: Arc<dyn DecisionStore>) -> Self {
        self.decisions = Some(store);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn ConflictScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Lease holder name; defaults to one derived from the process id.
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    pub fn build(self) -> Result<Orchestrator, SyncError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let canonical = self
            .canonical
            .ok_or(SyncError::MissingCollaborator("canonical record store"))?;
        let shadow = self
            .shadow
            .ok_or(SyncError::MissingCollaborator("agent state store"))?;

        Ok(Orchestrator {
            adapters: Adapters {
                canonical,
                shadow,
                timeout: config.adapter_timeout(),
            },
            baselines: self
                .baselines
                .unwrap_or_else(|| Arc::new(MemoryBaselineStore::new())),
            events: self.events.unwrap_or_else(|| Arc::new(MemoryEventStore::new())),
            decisions: self
                .decisions
                .unwrap_or_else(|| Arc::new(MemoryDecisionStore::new())),
            locks: self.locks.unwrap_or_else(|| Arc::new(MemoryLockManager::new())),
            scorer: self.scorer.unwrap_or_else(|| Arc::new(RuleTableScorer::default())),
            alerts: self.alerts.unwrap_or_else(|| Arc::new(TracingAlertSink)),
            escalations: Arc::new(EscalationFeed::new()),
            retries: RetryQueue::new(config.retry),
            metrics: SyncMetrics::default(),
            holder: self
                .holder
                .unwrap_or_else(|| format!("manusync-{}", std::process::id())),
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: SyncConfig,
    adapters: Adapters,
    baselines: Arc<dyn BaselineStore>,
    events: Arc<dyn EventStore>,
    decisions: Arc<dyn DecisionStore>,
    locks: Arc<dyn LockManager>,
    scorer: Arc<dyn ConflictScorer>,
    alerts: Arc<dyn AlertSink>,
    escalations: Arc<EscalationFeed>,
    retries: RetryQueue,
    metrics: SyncMetrics,
    holder: String,
}

/// What one attempt has gathered so far; becomes the [`SyncEvent`].
#[derive(Debug)]
struct Trail {
    record_id: RecordId,
    actor: String,
    attempt: u32,
    phase: SyncPhase,
    changes: ChangeSet,
    conflicts: Vec<Conflict>,
    resolutions: Vec<Resolution>,
    escalated: Vec<Conflict>,
    committed: bool,
    generation: u64,
    redetections: u32,
    started: Instant,
}

impl Trail {
    fn new(record_id: &RecordId, actor: &str, attempt: u32) -> Self {
        Self {
            record_id: record_id.clone(),
            actor: actor.to_string(),
            attempt,
            phase: SyncPhase::Idle,
            changes: ChangeSet::empty(record_id.clone(), 0),
            conflicts: Vec::new(),
            resolutions: Vec::new(),
            escalated: Vec::new(),
            committed: false,
            generation: 0,
            redetections: 0,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, phase: SyncPhase) {
        tracing::debug!(record_id = %self.record_id, from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }
}

/// Detection, classification and resolution for one pass, ready to commit.
#[derive(Debug)]
struct Plan {
    canonical: ManuscriptRecord,
    shadow: ManuscriptRecord,
    baseline: Baseline,
    /// Field → agreed value (`None` = deleted) for every field to settle.
    targets: BTreeMap<String, Option<FieldValue>>,
}

impl Plan {
    fn is_noop(&self, trail: &Trail) -> bool {
        trail.changes.is_empty() && trail.resolutions.is_empty() && trail.escalated.is_empty()
    }

    /// Fields of `side` that differ from their target, as a patch.
    fn patch_for(&self, side: Side) -> FieldMap {
        let record = match side {
            Side::Canonical => &self.canonical,
            Side::Shadow => &self.shadow,
        };
        self.targets
            .iter()
            .filter(|(field, target)| record.value(field) != target.as_ref())
            .map(|(field, target)| (field.clone(), target.clone().unwrap_or(FieldValue::Null)))
            .collect()
    }

    fn next_baseline(&self, canonical_revision: u64, shadow_revision: u64) -> Baseline {
        let mut fields = self.baseline.fields.clone();
        for (field, target) in &self.targets {
            match target {
                Some(value) => fields.insert(field.clone(), value.clone()),
                None => fields.remove(field),
            };
        }
        Baseline {
            record_id: self.baseline.record_id.clone(),
            fields,
            canonical_revision,
            shadow_revision,
            generation: self.baseline.generation + 1,
            synced_at: Utc::now(),
        }
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one synchronization attempt for `record_id`.
    pub async fn synchronize(&self, record_id: &RecordId) -> SyncEvent {
        self.synchronize_as(record_id, DEFAULT_ACTOR).await
    }

    /// As [`Self::synchronize`], recording `actor` as the trigger.
    ///
    /// The returned event has `seq == 0` only if it could not be appended to
    /// the event store.
    pub async fn synchronize_as(&self, record_id: &RecordId, actor: &str) -> SyncEvent {
        let attempt = self.retries.failures(record_id) + 1;
        let mut trail = Trail::new(record_id, actor, attempt);

        let lease = match self.acquire(record_id).await {
            Ok(lease) => lease,
            Err(err) => return self.finish(trail, Err(err), None).await,
        };
        trail.enter(SyncPhase::LockAcquired);

        let (result, lease) = self.run_locked(&mut trail, lease).await;
        self.finish(trail, result, Some(lease)).await
    }

    /// Re-run every record whose retry is due. Returns the events produced.
    pub async fn run_due_retries(&self) -> Vec<SyncEvent> {
        let due = self.retries.take_due();
        if due.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = due.len(), "running due retries");
        futures::future::join_all(due.iter().map(|id| self.synchronize_as(id, RETRY_ACTOR))).await
    }

    /// When the next retry falls due, if any are pending.
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.retries.next_due()
    }

    /// Record an editorial decision for the open escalation on `field`.
    ///
    /// The decision is stored under the record's lease and stays stored
    /// until a sync of the record commits it, across failed attempts and
    /// restarts.
    pub async fn resolve_escalation(
        &self,
        record_id: &RecordId,
        field: &str,
        value: FieldValue,
    ) -> Result<(), SyncError> {
        if self.escalations.open_for(record_id, field).is_none() {
            return Err(no_open_escalation(record_id, field));
        }
        let lease = self.acquire(record_id).await?;
        let stored = self.store_decision(record_id, field, value).await;
        if let Err(err) = self.locks.release(&lease).await {
            tracing::warn!(record_id = %record_id, error = %err, "lease release failed");
        }
        stored?;
        tracing::info!(record_id = %record_id, field, "editorial decision recorded");
        Ok(())
    }

    async fn store_decision(
        &self,
        record_id: &RecordId,
        field: &str,
        value: FieldValue,
    ) -> Result<(), SyncError> {
        let escalation = self
            .escalations
            .open_for(record_id, field)
            .ok_or_else(|| no_open_escalation(record_id, field))?;
        let decision = Decision::for_escalation(&escalation, value, Utc::now());
        self.decisions.save(&decision).await?;
        self.escalations.decide(decision)
    }

    /// Follow escalations published after `after`.
    pub fn subscribe_escalations(&self, after: u64) -> EscalationSubscription {
        self.escalations.subscribe(after)
    }

    pub fn escalations(&self) -> &Arc<EscalationFeed> {
        &self.escalations
    }

    /// Lazily list events with `seq > since`, for one record or all.
    pub fn list_events(
        &self,
        record_id: Option<RecordId>,
        since: u64,
    ) -> BoxStream<'static, Result<SyncEvent, SyncError>> {
        event_store::list_events(Arc::clone(&self.events), record_id, since, PAGE_SIZE)
    }

    pub async fn verify_events(&self) -> Result<usize, SyncError> {
        self.events.verify_chain().await
    }

    /// Rebuild open escalations from the audit trail and reattach stored
    /// decisions. Decisions for escalations that were closed or replaced
    /// are discarded. Returns how many escalations are open afterwards.
    pub async fn restore_escalations(&self) -> Result<usize, SyncError> {
        use futures::TryStreamExt;

        // Decisions first: each one then refers to an escalation already in the log.
        let decisions = self.decisions.load_all().await?;
        let mut events = self.list_events(None, 0);
        while let Some(event) = events.try_next().await? {
            self.escalations.replay(&event);
        }
        let mut pending = 0;
        for decision in decisions {
            let (record_id, field) = (decision.record_id.clone(), decision.field.clone());
            if self.escalations.decide(decision).is_ok() {
                pending += 1;
                continue;
            }
            tracing::info!(record_id = %record_id, field = %field, "discarding stale decision");
            self.decisions.remove(&record_id, &field).await?;
        }
        let open = self.escalations.open_count();
        tracing::info!(open, pending, "escalations restored from event log");
        Ok(open)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            locks: self.locks.stats(),
            retry_queue_depth: self.retries.depth(),
            escalation_queue_depth: self.escalations.open_count(),
            metrics: self.metrics.snapshot(),
            checked_at: Utc::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Bounded waits with doubling backoff between them.
    async fn acquire(&self, record_id: &RecordId) -> Result<Lease, SyncError> {
        let policy = self.config.lock;
        for attempt in 0..policy.acquire_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.backoff(attempt - 1)).await;
            }
            let mode = AcquireMode::Wait(policy.acquire_wait());
            match self
                .locks
                .acquire(record_id, &self.holder, policy.ttl(), mode)
                .await?
            {
                Acquire::Acquired(lease) => return Ok(lease),
                Acquire::Busy { holder, expires_at } => {
                    tracing::debug!(
                        record_id = %record_id,
                        holder = %holder,
                        expires_at = %expires_at,
                        attempt = attempt + 1,
                        "record busy"
                    );
                }
            }
        }
        Err(SyncError::LockTimeout {
            record_id: record_id.clone(),
            attempts: policy.acquire_attempts,
        })
    }

    /// Everything between acquiring and releasing the lease. Returns the
    /// most recent lease so the caller releases the right token.
    async fn run_locked(&self, trail: &mut Trail, lease: Lease) -> (Result<(), SyncError>, Lease) {
        let deadline = Instant::now() + self.config.deadline();
        let mut lease = lease;
        loop {
            let planned = tokio::time::timeout_at(deadline, self.plan(trail)).await;
            let plan = match planned {
                Ok(Ok(plan)) => plan,
                Ok(Err(err)) => return (Err(err), lease),
                Err(_) => {
                    return (
                        Err(SyncError::DeadlineExceeded { phase: trail.phase }),
                        lease,
                    )
                }
            };
            if plan.is_noop(trail) {
                trail.enter(SyncPhase::Completed);
                return (Ok(()), lease);
            }

            trail.enter(SyncPhase::Committing);
            lease = match self.locks.renew(&lease).await {
                Ok(renewed) => renewed,
                Err(err) => return (Err(err), lease),
            };
            match self.commit(trail, &plan).await {
                Err(SyncError::RevisionConflict { side, expected, actual })
                    if trail.redetections < self.config.max_redetections =>
                {
                    trail.redetections += 1;
                    tracing::info!(
                        record_id = %trail.record_id,
                        side = %side,
                        expected,
                        actual,
                        redetection = trail.redetections,
                        "record moved during commit; detecting again"
                    );
                    continue;
                }
                Err(err) => return (Err(err), lease),
                Ok(()) => {
                    let terminal = if trail.escalated.is_empty() {
                        SyncPhase::Completed
                    } else {
                        SyncPhase::Escalated
                    };
                    trail.enter(terminal);
                    return (Ok(()), lease);
                }
            }
        }
    }

    /// Detecting → Classifying → Resolving.
    async fn plan(&self, trail: &mut Trail) -> Result<Plan, SyncError> {
        let record_id = trail.record_id.clone();
        trail.enter(SyncPhase::Detecting);
        let (canonical, shadow) = tokio::try_join!(
            self.adapters.read(Side::Canonical, &record_id),
            self.adapters.read(Side::Shadow, &record_id),
        )?;
        let canonical =
            canonical.unwrap_or_else(|| ManuscriptRecord::empty(record_id.clone(), Side::Canonical));
        let shadow = shadow.unwrap_or_else(|| ManuscriptRecord::empty(record_id.clone(), Side::Shadow));

        let state = match self.baselines.load(&record_id).await? {
            Some(baseline) => BaselineState::Present(baseline),
            None if self.events.has_history(&record_id).await? => BaselineState::Missing,
            None => BaselineState::Never,
        };
        let changes = detect_changes(&canonical, &shadow, &state)?;
        let baseline = state.resolve(&record_id)?;
        trail.changes = changes.clone();

        trail.enter(SyncPhase::Classifying);
        let mut classified = classify(&changes, &self.config, self.scorer.as_ref());

        // Decisions recorded by another process since this one last looked.
        for decision in self.decisions.load(&record_id).await? {
            let _ = self.escalations.decide(decision);
        }
        let mut decided = Vec::new();
        for (field, value) in self.escalations.decisions_for(&record_id) {
            classified.conflicts.retain(|c| c.field != field);
            classified.passthrough.retain(|d| d.field != field);
            decided.push(Resolution {
                field,
                value,
                rule: ResolutionRule::EditorialDecision,
                reason: "editorial decision".to_string(),
            });
        }
        let held = self.hold_open_fields(&record_id, &mut classified, &baseline);
        trail.conflicts = classified.conflicts.clone();

        trail.enter(SyncPhase::Resolving);
        let times = SideTimes {
            canonical: canonical.modified_at,
            shadow: shadow.modified_at,
        };
        let resolved = resolve(classified.conflicts, &self.config, times);
        decided.extend(resolved.resolutions);
        trail.resolutions = decided;
        trail.escalated = resolved.unresolved;
        trail.escalated.extend(held);

        let targets = targets(&classified.passthrough, &trail.resolutions, &trail.escalated, &baseline);
        Ok(Plan {
            canonical,
            shadow,
            baseline,
            targets,
        })
    }

    /// Take every change to a field with an open, undecided escalation out
    /// of `classified` and return it as a conflict to escalate again, so the
    /// field stays at its baseline value until an editor decides it.
    fn hold_open_fields(
        &self,
        record_id: &RecordId,
        classified: &mut Classified,
        baseline: &Baseline,
    ) -> Vec<Conflict> {
        let mut held = Vec::new();
        let conflicts = std::mem::take(&mut classified.conflicts);
        for conflict in conflicts {
            if self.escalations.open_for(record_id, &conflict.field).is_some() {
                held.push(Conflict {
                    classification: Classification::NeedsEscalation,
                    ..conflict
                });
            } else {
                classified.conflicts.push(conflict);
            }
        }
        let passthrough = std::mem::take(&mut classified.passthrough);
        for delta in passthrough {
            match self.escalations.open_for(record_id, &delta.field) {
                Some(open) => {
                    tracing::info!(
                        record_id = %record_id,
                        field = %delta.field,
                        side = %delta.origin,
                        "change held until the open escalation is decided"
                    );
                    held.push(held_conflict(&open, delta, baseline));
                }
                None => classified.passthrough.push(delta),
            }
        }
        held
    }

    /// Write canonical, then shadow, then the baseline. A failed shadow write
    /// undoes the canonical write.
    async fn commit(&self, trail: &mut Trail, plan: &Plan) -> Result<(), SyncError> {
        let record_id = &plan.baseline.record_id;
        let canonical_patch = plan.patch_for(Side::Canonical);
        let shadow_patch = plan.patch_for(Side::Shadow);

        let mut canonical_revision = plan.canonical.revision;
        if !canonical_patch.is_empty() {
            canonical_revision = self
                .adapters
                .write(Side::Canonical, record_id, &canonical_patch, plan.canonical.revision)
                .await?;
        }

        let mut shadow_revision = plan.shadow.revision;
        if !shadow_patch.is_empty() {
            match self
                .adapters
                .write(Side::Shadow, record_id, &shadow_patch, plan.shadow.revision)
                .await
            {
                Ok(revision) => shadow_revision = revision,
                Err(err) => {
                    if !canonical_patch.is_empty() {
                        self.compensate(record_id, plan, &canonical_patch, canonical_revision)
                            .await;
                    }
                    return Err(err);
                }
            }
        }

        let baseline = plan.next_baseline(canonical_revision, shadow_revision);
        self.baselines.save(&baseline).await?;
        trail.generation = baseline.generation;
        trail.committed = true;
        tracing::debug!(
            record_id = %record_id,
            generation = baseline.generation,
            canonical_fields = canonical_patch.len(),
            shadow_fields = shadow_patch.len(),
            "committed"
        );
        Ok(())
    }

    /// Restore the canonical fields touched by a commit whose shadow write
    /// failed.
    async fn compensate(&self, record_id: &RecordId, plan: &Plan, applied: &FieldMap, revision: u64) {
        let inverse: FieldMap = applied
            .keys()
            .map(|field| {
                let original = plan.canonical.fields.get(field).cloned();
                (field.clone(), original.unwrap_or(FieldValue::Null))
            })
            .collect();
        let result = self
            .adapters
            .write(Side::Canonical, record_id, &inverse, revision)
            .await;
        self.metrics.record_rollback(result.is_ok());
        match result {
            Ok(_) => tracing::warn!(
                record_id = %record_id,
                fields = inverse.len(),
                "shadow write failed; canonical write rolled back"
            ),
            Err(err) => tracing::error!(
                record_id = %record_id,
                error = %err,
                "shadow write failed and canonical rollback failed; next sync will reconcile"
            ),
        }
    }

    /// Fold the result into an event, append it, then release the lease.
    async fn finish(
        &self,
        mut trail: Trail,
        result: Result<(), SyncError>,
        lease: Option<Lease>,
    ) -> SyncEvent {
        let record_id = trail.record_id.clone();
        let mut failed_phase = None;
        let mut error = None;

        let outcome = match &result {
            Ok(()) => {
                self.retries.record_success(&record_id);
                if trail.escalated.is_empty() {
                    SyncOutcome::Success
                } else {
                    SyncOutcome::Escalated
                }
            }
            Err(err) => {
                failed_phase = Some(trail.phase);
                error = Some(err.to_string());
                if err.is_integrity() {
                    self.metrics.record_integrity_error();
                }
                match self.retries.record_failure(&record_id, err.is_retryable()) {
                    RetryDecision::Scheduled { failures, delay } => {
                        tracing::warn!(
                            record_id = %record_id,
                            phase = %trail.phase,
                            failures,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "synchronization failed; retry scheduled"
                        );
                        SyncOutcome::FailedRetryable
                    }
                    RetryDecision::Exhausted { .. } | RetryDecision::NotRetryable => {
                        self.alerts.alert(&Alert {
                            record_id: record_id.clone(),
                            attempt: trail.attempt,
                            error: err.to_string(),
                            integrity: err.is_integrity(),
                            raised_at: Utc::now(),
                        });
                        SyncOutcome::FailedPermanent
                    }
                }
            }
        };
        if result.is_err() {
            trail.enter(SyncPhase::Failed);
        }

        let now = Utc::now();
        let mut applied = Vec::new();
        if result.is_ok() {
            for conflict in &trail.escalated {
                self.escalations.publish(conflict, now);
            }
            for resolution in &trail.resolutions {
                if resolution.rule == ResolutionRule::EditorialDecision {
                    self.escalations.close(&record_id, &resolution.field);
                    applied.push(resolution.field.clone());
                }
            }
        }

        let generation = if trail.committed {
            trail.generation
        } else {
            trail.changes.baseline_generation
        };
        let escalated_fields = trail.escalated.iter().map(|c| c.field.clone()).collect();
        let mut conflicts = trail.conflicts;
        // Escalated conflicts are recorded even if decided fields were
        // dropped from the conflict list.
        for conflict in &trail.escalated {
            if !conflicts.iter().any(|c| c.field == conflict.field) {
                conflicts.push(conflict.clone());
            }
        }
        let event = SyncEvent {
            seq: 0,
            record_id: record_id.clone(),
            timestamp: now,
            actor: trail.actor,
            attempt: trail.attempt,
            changes: trail.changes,
            conflicts,
            resolutions: trail.resolutions,
            escalated_fields,
            outcome,
            committed: trail.committed,
            baseline_generation: generation,
            redetections: trail.redetections,
            failed_phase,
            error,
            duration_ms: trail.started.elapsed().as_millis() as u64,
            prev_hash: String::new(),
            hash: String::new(),
        };

        let event = match self.events.append(event.clone()).await {
            Ok(sealed) => {
                self.metrics.record_append(true);
                sealed
            }
            Err(err) => {
                self.metrics.record_append(false);
                tracing::error!(record_id = %record_id, error = %err, "failed to append sync event");
                event
            }
        };

        // Applied decisions are dropped once the event recording them is in
        // the log.
        if event.seq > 0 {
            for field in &applied {
                if let Err(err) = self.decisions.remove(&record_id, field).await {
                    tracing::warn!(record_id = %record_id, field = %field, error = %err, "failed to drop applied decision");
                }
            }
        }

        if let Some(lease) = lease {
            if let Err(err) = self.locks.release(&lease).await {
                tracing::warn!(record_id = %record_id, error = %err, "lease release failed");
            }
        }

        self.metrics.record_outcome(outcome);
        self.metrics.record_redetections(event.redetections);
        tracing::info!(
            record_id = %record_id,
            seq = event.seq,
            outcome = %outcome,
            changes = event.changes.len(),
            resolutions = event.resolutions.len(),
            escalated = event.escalated_fields.len(),
            duration_ms = event.duration_ms,
            "synchronization finished"
        );
        event
    }
}

fn no_open_escalation(record_id: &RecordId, field: &str) -> SyncError {
    SyncError::NoOpenEscalation {
        record_id: record_id.clone(),
        field: field.to_string(),
    }
}

/// Pair a one-sided change to an escalated field with the other side's
/// candidate from the open escalation.
fn held_conflict(open: &Escalation, delta: FieldDelta, baseline: &Baseline) -> Conflict {
    let candidate = |origin: Side, value: &Option<FieldValue>| FieldDelta {
        field: delta.field.clone(),
        origin,
        kind: if value.is_some() {
            DeltaKind::Set
        } else {
            DeltaKind::Deleted
        },
        old: baseline.fields.get(&delta.field).cloned(),
        new: value.clone(),
        baseline_generation: delta.baseline_generation,
    };
    let (canonical, shadow) = match delta.origin {
        Side::Canonical => (delta.clone(), candidate(Side::Shadow, &open.shadow)),
        Side::Shadow => (candidate(Side::Canonical, &open.canonical), delta.clone()),
    };
    Conflict {
        record_id: open.record_id.clone(),
        field: delta.field.clone(),
        canonical,
        shadow,
        classification: Classification::NeedsEscalation,
        confidence: open.confidence,
    }
}

/// The value each touched field settles on for this pass.
///
/// Escalated fields go back to their baseline value; a field the baseline
/// never held is left alone on both sides.
fn targets(
    passthrough: &[FieldDelta],
    resolutions: &[Resolution],
    escalated: &[Conflict],
    baseline: &Baseline,
) -> BTreeMap<String, Option<FieldValue>> {
    let mut targets = BTreeMap::new();
    for delta in passthrough {
        targets.insert(delta.field.clone(), delta.new.clone());
    }
    for resolution in resolutions {
        targets.insert(resolution.field.clone(), resolution.value.clone());
    }
    for conflict in escalated {
        if let Some(agreed) = baseline.fields.get(&conflict.field) {
            targets.insert(conflict.field.clone(), Some(agreed.clone()));
        }
    }
    targets
}
