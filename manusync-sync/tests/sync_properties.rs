use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use manusync_core::{
    Precedence, RecordId, ResolutionRule, Side, SyncConfig, SyncOutcome, SyncPhase,
};
use manusync_sync::{
    Alert, AlertSink, BaselineStore, EventStore, FixedScorer, MemoryBaselineStore,
    MemoryDecisionStore, MemoryEventStore, MemoryRecordStore, Orchestrator, SyncError,
};
use parking_lot::Mutex;
use rstest::rstest;
use serde_json::{json, Value};

#[derive(Default)]
struct RecordingAlerts(Mutex<Vec<Alert>>);

impl AlertSink for RecordingAlerts {
    fn alert(&self, alert: &Alert) {
        self.0.lock().push(alert.clone());
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    canonical: Arc<MemoryRecordStore>,
    shadow: Arc<MemoryRecordStore>,
    baselines: Arc<MemoryBaselineStore>,
    events: Arc<MemoryEventStore>,
    alerts: Arc<RecordingAlerts>,
}

fn harness(config: SyncConfig) -> Harness {
    let canonical = Arc::new(MemoryRecordStore::new(Side::Canonical));
    let shadow = Arc::new(MemoryRecordStore::new(Side::Shadow));
    let baselines = Arc::new(MemoryBaselineStore::new());
    let events = Arc::new(MemoryEventStore::new());
    let alerts = Arc::new(RecordingAlerts::default());
    let orchestrator = Orchestrator::builder()
        .config(config)
        .canonical(canonical.clone())
        .shadow(shadow.clone())
        .baselines(baselines.clone())
        .events(events.clone())
        .alerts(alerts.clone())
        .build()
        .expect("build orchestrator");
    Harness {
        orchestrator: Arc::new(orchestrator),
        canonical,
        shadow,
        baselines,
        events,
        alerts,
    }
}

fn id() -> RecordId {
    RecordId::from("ms-1")
}

/// Put `fields` on the canonical side and sync them across.
async fn seeded(config: SyncConfig, fields: &[(&str, Value)]) -> Harness {
    let h = harness(config);
    for (field, value) in fields {
        h.canonical.set_field(&id(), field, value.clone());
    }
    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success, "seed sync: {:?}", event.error);
    h
}

fn both_sides(h: &Harness, field: &str) -> (Option<Value>, Option<Value>) {
    (h.canonical.field(&id(), field), h.shadow.field(&id(), field))
}

// ---------------------------------------------------------------------------
// Idempotence and convergence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_sync_without_changes_is_a_noop() {
    let h = seeded(SyncConfig::default(), &[("title", json!("Acne")), ("status", json!("submitted"))]).await;
    let writes = h.canonical.write_count() + h.shadow.write_count();

    let event = h.orchestrator.synchronize(&id()).await;
    assert!(event.is_noop());
    assert!(event.changes.is_empty());
    assert!(!event.committed);
    assert_eq!(h.canonical.write_count() + h.shadow.write_count(), writes);
    assert_eq!(h.events.len(), 2);
}

#[rstest]
#[case::canonical_edit(Some(("title", json!("Rosacea"))), None)]
#[case::shadow_edit(None, Some(("abstract", json!("Updated abstract"))))]
#[case::disjoint_edits(Some(("title", json!("Rosacea"))), Some(("abstract", json!("New"))))]
#[case::agreeing_edits(Some(("title", json!("Same"))), Some(("title", json!("Same"))))]
#[case::canonical_delete(Some(("abstract", Value::Null)), None)]
#[tokio::test]
async fn non_conflicting_changes_converge(
    #[case] canonical_edit: Option<(&str, Value)>,
    #[case] shadow_edit: Option<(&str, Value)>,
) {
    let h = seeded(
        SyncConfig::default(),
        &[("title", json!("Acne")), ("abstract", json!("Original"))],
    )
    .await;
    if let Some((field, value)) = canonical_edit {
        h.canonical.set_field(&id(), field, value);
    }
    if let Some((field, value)) = shadow_edit {
        h.shadow.set_field(&id(), field, value);
    }

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success, "{:?}", event.error);
    assert!(event.conflicts.is_empty());

    let canonical = h.canonical.snapshot(&id()).expect("canonical");
    let shadow = h.shadow.snapshot(&id()).expect("shadow");
    assert_eq!(canonical.fields, shadow.fields);

    let baseline = h.baselines.load(&id()).await.unwrap().expect("baseline");
    assert_eq!(baseline.fields, canonical.fields);
    assert_eq!(baseline.generation, 2);
    assert_eq!(baseline.canonical_revision, canonical.revision);
    assert_eq!(baseline.shadow_revision, shadow.revision);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sensitive_status_conflict_escalates_and_other_fields_commit() {
    let h = seeded(
        SyncConfig::default(),
        &[("status", json!("submitted")), ("title", json!("Acne"))],
    )
    .await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("revision_requested"));
    h.canonical.set_field(&id(), "title", json!("Acne vulgaris"));

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Escalated);
    assert!(event.committed);
    assert_eq!(event.escalated_fields, vec!["status".to_string()]);

    assert_eq!(both_sides(&h, "status"), (Some(json!("submitted")), Some(json!("submitted"))));
    assert_eq!(
        both_sides(&h, "title"),
        (Some(json!("Acne vulgaris")), Some(json!("Acne vulgaris")))
    );

    let open = h.orchestrator.escalations().open();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].field, "status");
    assert_eq!(open[0].canonical, Some(json!("under_review")));
    assert_eq!(open[0].shadow, Some(json!("revision_requested")));
    assert_eq!(open[0].baseline, Some(json!("submitted")));

    let baseline = h.baselines.load(&id()).await.unwrap().expect("baseline");
    assert_eq!(baseline.fields["status"], json!("submitted"));
    assert_eq!(baseline.fields["title"], json!("Acne vulgaris"));
    assert_eq!(h.orchestrator.health().escalation_queue_depth, 1);
}

#[tokio::test]
async fn shadow_keyword_addition_updates_canonical_and_baseline() {
    let h = seeded(SyncConfig::default(), &[("keywords", json!(["acne"]))]).await;
    h.shadow.set_field(&id(), "keywords", json!(["acne", "retinoids"]));

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success);
    assert_eq!(event.baseline_generation, 2);
    assert_eq!(h.canonical.field(&id(), "keywords"), Some(json!(["acne", "retinoids"])));

    let baseline = h.baselines.load(&id()).await.unwrap().expect("baseline");
    assert_eq!(baseline.fields["keywords"], json!(["acne", "retinoids"]));
    assert_eq!(baseline.generation, 2);
}

#[tokio::test]
async fn concurrent_keyword_additions_merge_by_union() {
    let h = seeded(SyncConfig::default(), &[("keywords", json!(["acne"]))]).await;
    h.canonical.set_field(&id(), "keywords", json!(["acne", "isotretinoin"]));
    h.shadow.set_field(&id(), "keywords", json!(["acne", "retinoids"]));

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success);
    assert_eq!(event.resolutions.len(), 1);
    assert_eq!(event.resolutions[0].rule, ResolutionRule::ListUnion);
    let merged = json!(["acne", "isotretinoin", "retinoids"]);
    assert_eq!(both_sides(&h, "keywords"), (Some(merged.clone()), Some(merged)));
}

#[tokio::test]
async fn scalar_conflict_uses_configured_precedence() {
    let config = SyncConfig {
        default_precedence: Precedence::CanonicalWins,
        ..SyncConfig::default()
    };
    let h = seeded(config, &[("title", json!("Acne"))]).await;
    h.canonical.set_field(&id(), "title", json!("From CMS"));
    h.shadow.set_field(&id(), "title", json!("From agent"));

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success);
    assert_eq!(
        event.resolutions[0].rule,
        ResolutionRule::Precedence(Precedence::CanonicalWins)
    );
    assert_eq!(event.resolutions[0].reason, "canonical-wins policy");
    assert_eq!(
        both_sides(&h, "title"),
        (Some(json!("From CMS")), Some(json!("From CMS")))
    );
}

#[rstest]
#[case(0.0)]
#[case(0.95)]
#[case(1.0)]
#[tokio::test]
async fn sensitive_fields_escalate_at_any_confidence(#[case] score: f64) {
    let canonical = Arc::new(MemoryRecordStore::new(Side::Canonical));
    let shadow = Arc::new(MemoryRecordStore::new(Side::Shadow));
    let orchestrator = Orchestrator::builder()
        .canonical(canonical.clone())
        .shadow(shadow.clone())
        .scorer(Arc::new(FixedScorer(score)))
        .build()
        .expect("build");
    canonical.set_field(&id(), "decision", json!("pending"));
    orchestrator.synchronize(&id()).await;

    canonical.set_field(&id(), "decision", json!("accept"));
    shadow.set_field(&id(), "decision", json!("reject"));
    let event = orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Escalated);
    assert_eq!(canonical.field(&id(), "decision"), Some(json!("pending")));
    assert_eq!(shadow.field(&id(), "decision"), Some(json!("pending")));
}

// ---------------------------------------------------------------------------
// Escalation lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn editorial_decision_is_applied_on_next_sync() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("revision_requested"));
    h.orchestrator.synchronize(&id()).await;

    let err = h
        .orchestrator
        .resolve_escalation(&id(), "title", json!("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NoOpenEscalation { .. }));

    h.orchestrator
        .resolve_escalation(&id(), "status", json!("accepted"))
        .await
        .expect("decide");
    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success);
    assert_eq!(event.resolutions.len(), 1);
    assert_eq!(event.resolutions[0].rule, ResolutionRule::EditorialDecision);
    assert_eq!(
        both_sides(&h, "status"),
        (Some(json!("accepted")), Some(json!("accepted")))
    );
    assert_eq!(h.orchestrator.escalations().open_count(), 0);

    let baseline = h.baselines.load(&id()).await.unwrap().expect("baseline");
    assert_eq!(baseline.fields["status"], json!("accepted"));
}

#[tokio::test]
async fn unchanged_candidates_are_not_republished() {
    let h = harness(SyncConfig::default());
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("rejected"));

    let first = h.orchestrator.synchronize(&id()).await;
    assert_eq!(first.outcome, SyncOutcome::Escalated);
    // Never agreed, so neither side is rewritten.
    assert_eq!(
        both_sides(&h, "status"),
        (Some(json!("under_review")), Some(json!("rejected")))
    );
    let second = h.orchestrator.synchronize(&id()).await;
    assert_eq!(second.outcome, SyncOutcome::Escalated);
    assert_eq!(h.orchestrator.escalations().last_seq(), 1);

    h.shadow.set_field(&id(), "status", json!("withdrawn"));
    h.orchestrator.synchronize(&id()).await;
    assert_eq!(h.orchestrator.escalations().last_seq(), 2);
    assert_eq!(h.orchestrator.escalations().open_count(), 1);
}

#[tokio::test]
async fn one_sided_rewrite_of_an_escalated_field_is_held() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("revision_requested"));
    let first = h.orchestrator.synchronize(&id()).await;
    assert_eq!(first.outcome, SyncOutcome::Escalated);
    assert_eq!(h.orchestrator.escalations().open_count(), 1);

    // The agent repeats its side while the editor has not decided yet.
    h.shadow.set_field(&id(), "status", json!("revision_requested"));
    let second = h.orchestrator.synchronize(&id()).await;
    assert_eq!(second.outcome, SyncOutcome::Escalated, "{:?}", second.error);
    assert_eq!(second.escalated_fields, vec!["status".to_string()]);
    assert_eq!(
        both_sides(&h, "status"),
        (Some(json!("submitted")), Some(json!("submitted")))
    );
    let baseline = h.baselines.load(&id()).await.unwrap().expect("baseline");
    assert_eq!(baseline.fields["status"], json!("submitted"));
    assert_eq!(h.orchestrator.escalations().open_count(), 1);
    assert_eq!(h.orchestrator.escalations().last_seq(), 1);

    // Other fields still flow while one is held.
    h.canonical.set_field(&id(), "title", json!("Acne"));
    h.canonical.set_field(&id(), "status", json!("withdrawn"));
    let third = h.orchestrator.synchronize(&id()).await;
    assert_eq!(third.outcome, SyncOutcome::Escalated);
    assert_eq!(h.shadow.field(&id(), "title"), Some(json!("Acne")));
    assert_eq!(
        both_sides(&h, "status"),
        (Some(json!("submitted")), Some(json!("submitted")))
    );
    let open = h.orchestrator.escalations().open();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].canonical, Some(json!("withdrawn")));
    assert_eq!(open[0].shadow, Some(json!("revision_requested")));
}

#[tokio::test]
async fn decisions_survive_failed_syncs_and_restarts() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("revision_requested"));
    h.orchestrator.synchronize(&id()).await;

    let decisions = Arc::new(MemoryDecisionStore::new());
    let restart = || {
        Orchestrator::builder()
            .canonical(h.canonical.clone())
            .shadow(h.shadow.clone())
            .baselines(h.baselines.clone())
            .events(h.events.clone())
            .decisions(decisions.clone())
            .build()
            .expect("build")
    };
    let first = restart();
    assert_eq!(first.restore_escalations().await.unwrap(), 1);
    first
        .resolve_escalation(&id(), "status", json!("accepted"))
        .await
        .expect("decide");
    assert_eq!(decisions.len(), 1);

    h.canonical.fail_always(true);
    let failed = first.synchronize(&id()).await;
    assert_eq!(failed.outcome, SyncOutcome::FailedRetryable);
    assert_eq!(decisions.len(), 1);
    drop(first);

    h.canonical.fail_always(false);
    let second = restart();
    assert_eq!(second.restore_escalations().await.unwrap(), 1);
    let event = second.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success, "{:?}", event.error);
    assert_eq!(event.resolutions[0].rule, ResolutionRule::EditorialDecision);
    assert_eq!(
        both_sides(&h, "status"),
        (Some(json!("accepted")), Some(json!("accepted")))
    );
    assert!(decisions.is_empty());
    assert_eq!(restart().restore_escalations().await.unwrap(), 0);
}

#[tokio::test]
async fn decision_recorded_elsewhere_is_picked_up_by_the_next_sync() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("rejected"));

    let decisions = Arc::new(MemoryDecisionStore::new());
    let build = || {
        Orchestrator::builder()
            .canonical(h.canonical.clone())
            .shadow(h.shadow.clone())
            .baselines(h.baselines.clone())
            .events(h.events.clone())
            .decisions(decisions.clone())
            .build()
            .expect("build")
    };
    let syncer = build();
    syncer.synchronize(&id()).await;

    let editor = build();
    editor.restore_escalations().await.unwrap();
    editor
        .resolve_escalation(&id(), "status", json!("accepted"))
        .await
        .expect("decide");

    let event = syncer.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::Success, "{:?}", event.error);
    assert_eq!(
        both_sides(&h, "status"),
        (Some(json!("accepted")), Some(json!("accepted")))
    );
    assert_eq!(syncer.escalations().open_count(), 0);
    assert!(decisions.is_empty());
}

#[tokio::test]
async fn stale_decisions_are_discarded_on_restore() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("rejected"));
    h.orchestrator.synchronize(&id()).await;

    let decisions = Arc::new(MemoryDecisionStore::new());
    let build = || {
        Orchestrator::builder()
            .canonical(h.canonical.clone())
            .shadow(h.shadow.clone())
            .baselines(h.baselines.clone())
            .events(h.events.clone())
            .decisions(decisions.clone())
            .build()
            .expect("build")
    };
    let editor = build();
    editor.restore_escalations().await.unwrap();
    editor
        .resolve_escalation(&id(), "status", json!("accepted"))
        .await
        .expect("decide");

    // The conflict changes before the decision is applied.
    h.shadow.set_field(&id(), "status", json!("withdrawn"));
    h.orchestrator.synchronize(&id()).await;

    assert_eq!(build().restore_escalations().await.unwrap(), 1);
    assert!(decisions.is_empty());
}

#[tokio::test]
async fn escalation_of_a_failed_commit_is_not_restored() {
    let h = seeded(
        SyncConfig::default(),
        &[("status", json!("submitted")), ("title", json!("Acne"))],
    )
    .await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("rejected"));
    h.canonical.set_field(&id(), "title", json!("Acne vulgaris"));
    h.shadow.fail_next_writes(1);

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::FailedRetryable);
    assert_eq!(event.escalated_fields, vec!["status".to_string()]);
    assert_eq!(h.orchestrator.escalations().open_count(), 0);

    let restarted = Orchestrator::builder()
        .canonical(h.canonical.clone())
        .shadow(h.shadow.clone())
        .baselines(h.baselines.clone())
        .events(h.events.clone())
        .build()
        .expect("build");
    assert_eq!(restarted.restore_escalations().await.unwrap(), 0);
}

#[tokio::test]
async fn subscribers_receive_escalations() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    let mut subscription = h.orchestrator.subscribe_escalations(0);

    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("rejected"));
    h.orchestrator.synchronize(&id()).await;

    let escalation = tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("escalation delivered");
    assert_eq!(escalation.field, "status");
    assert_eq!(subscription.cursor(), escalation.seq);
}

#[tokio::test]
async fn escalations_are_restored_from_the_event_log() {
    let h = seeded(SyncConfig::default(), &[("status", json!("submitted"))]).await;
    h.canonical.set_field(&id(), "status", json!("under_review"));
    h.shadow.set_field(&id(), "status", json!("rejected"));
    h.orchestrator.synchronize(&id()).await;

    let restart = || {
        Orchestrator::builder()
            .canonical(h.canonical.clone())
            .shadow(h.shadow.clone())
            .baselines(h.baselines.clone())
            .events(h.events.clone())
            .build()
            .expect("build")
    };
    let restarted = restart();
    assert_eq!(restarted.restore_escalations().await.unwrap(), 1);

    restarted
        .resolve_escalation(&id(), "status", json!("accepted"))
        .await
        .expect("decide");
    restarted.synchronize(&id()).await;
    assert_eq!(restart().restore_escalations().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_stop_after_the_configured_maximum() {
    let mut config = SyncConfig::default();
    config.retry.max_retries = 3;
    config.retry.base_backoff_ms = 0;
    config.retry.max_backoff_ms = 0;
    let h = harness(config);
    h.canonical.fail_always(true);

    let mut outcomes = vec![h.orchestrator.synchronize(&id()).await];
    loop {
        let batch = h.orchestrator.run_due_retries().await;
        if batch.is_empty() {
            break;
        }
        outcomes.extend(batch);
    }

    let kinds: Vec<SyncOutcome> = outcomes.iter().map(|e| e.outcome).collect();
    assert_eq!(
        kinds,
        vec![
            SyncOutcome::FailedRetryable,
            SyncOutcome::FailedRetryable,
            SyncOutcome::FailedRetryable,
            SyncOutcome::FailedPermanent,
        ]
    );
    let attempts: Vec<u32> = outcomes.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    assert_eq!(outcomes[0].failed_phase, Some(SyncPhase::Detecting));
    assert_eq!(outcomes[3].actor, "retry");

    let alerts = h.alerts.0.lock();
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].integrity);
    assert_eq!(h.orchestrator.health().retry_queue_depth, 0);
}

#[tokio::test]
async fn failed_shadow_write_rolls_back_canonical() {
    let h = seeded(
        SyncConfig::default(),
        &[("title", json!("Acne")), ("abstract", json!("Original"))],
    )
    .await;
    h.shadow.set_field(&id(), "title", json!("Agent title"));
    h.canonical.set_field(&id(), "abstract", json!("Editor abstract"));
    h.shadow.fail_next_writes(1);

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::FailedRetryable);
    assert_eq!(event.failed_phase, Some(SyncPhase::Committing));
    assert!(!event.committed);
    assert_eq!(h.canonical.field(&id(), "title"), Some(json!("Acne")));
    assert_eq!(h.shadow.field(&id(), "abstract"), Some(json!("Original")));
    assert_eq!(h.baselines.load(&id()).await.unwrap().unwrap().generation, 1);
    assert_eq!(h.orchestrator.health().metrics.rollbacks, 1);

    let retried = h.orchestrator.synchronize(&id()).await;
    assert_eq!(retried.outcome, SyncOutcome::Success);
    assert_eq!(retried.attempt, 2);
    assert_eq!(both_sides(&h, "title"), (Some(json!("Agent title")), Some(json!("Agent title"))));
    assert_eq!(
        both_sides(&h, "abstract"),
        (Some(json!("Editor abstract")), Some(json!("Editor abstract")))
    );
}

#[tokio::test(start_paused = true)]
async fn revision_conflict_restarts_detection() {
    let h = seeded(SyncConfig::default(), &[("title", json!("Acne"))]).await;
    h.shadow.set_field(&id(), "title", json!("Agent title"));
    h.canonical.delay_writes(Duration::from_millis(100));

    let task = {
        let orchestrator = Arc::clone(&h.orchestrator);
        tokio::spawn(async move { orchestrator.synchronize(&id()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.canonical.set_field(&id(), "abstract", json!("Edited mid-sync"));

    let event = task.await.expect("join");
    assert_eq!(event.outcome, SyncOutcome::Success, "{:?}", event.error);
    assert_eq!(event.redetections, 1);
    assert_eq!(both_sides(&h, "title"), (Some(json!("Agent title")), Some(json!("Agent title"))));
    assert_eq!(
        both_sides(&h, "abstract"),
        (Some(json!("Edited mid-sync")), Some(json!("Edited mid-sync")))
    );
}

#[tokio::test(start_paused = true)]
async fn redetection_budget_is_bounded() {
    let mut config = SyncConfig::default();
    config.max_redetections = 0;
    let h = seeded(config, &[("title", json!("Acne"))]).await;
    h.shadow.set_field(&id(), "title", json!("Agent title"));
    h.canonical.delay_writes(Duration::from_millis(100));

    let task = {
        let orchestrator = Arc::clone(&h.orchestrator);
        tokio::spawn(async move { orchestrator.synchronize(&id()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.canonical.set_field(&id(), "abstract", json!("Edited mid-sync"));

    let event = task.await.expect("join");
    assert_eq!(event.outcome, SyncOutcome::FailedRetryable);
    assert!(event.error.as_deref().unwrap_or_default().contains("revision conflict"));
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_slow_attempt_before_commit() {
    let config = SyncConfig {
        deadline_ms: 1_000,
        adapter_timeout_ms: 5_000,
        ..SyncConfig::default()
    };
    let h = seeded(config, &[("title", json!("Acne"))]).await;
    h.canonical.set_field(&id(), "title", json!("Edited"));
    h.shadow.delay_reads(Duration::from_secs(10));

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::FailedRetryable);
    assert_eq!(event.failed_phase, Some(SyncPhase::Detecting));
    assert!(event.error.as_deref().unwrap_or_default().contains("deadline"));
    assert_eq!(h.shadow.field(&id(), "title"), Some(json!("Acne")));
    assert_eq!(h.orchestrator.health().locks.held, 0);
}

#[tokio::test]
async fn missing_baseline_with_history_is_permanent() {
    let h = seeded(SyncConfig::default(), &[("title", json!("Acne"))]).await;
    h.baselines.forget(&id());

    let event = h.orchestrator.synchronize(&id()).await;
    assert_eq!(event.outcome, SyncOutcome::FailedPermanent);
    assert!(event.error.as_deref().unwrap_or_default().contains("integrity"));

    let alerts = h.alerts.0.lock();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].integrity);
    let health = h.orchestrator.health();
    assert_eq!(health.metrics.integrity_errors, 1);
    assert_eq!(health.retry_queue_depth, 0);
    assert!(!health.is_healthy());
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_attempt_appends_one_chained_event() {
    let h = seeded(SyncConfig::default(), &[("title", json!("Acne"))]).await;
    h.canonical.set_field(&id(), "title", json!("Edited"));
    h.orchestrator.synchronize(&id()).await;
    h.canonical.fail_next_reads(1);
    h.orchestrator.synchronize(&id()).await;
    h.orchestrator.synchronize(&RecordId::from("ms-2")).await;

    assert_eq!(h.events.verify_chain().await.unwrap(), 4);

    let for_record: Vec<u64> = h
        .orchestrator
        .list_events(Some(id()), 0)
        .map_ok(|e| e.seq)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(for_record, vec![1, 2, 3]);

    let since: Vec<u64> = h
        .orchestrator
        .list_events(None, 2)
        .map_ok(|e| e.seq)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(since, vec![3, 4]);
}
