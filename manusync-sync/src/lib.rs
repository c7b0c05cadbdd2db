//! Manuscript state-sync engine.
//!
//! Keeps a manuscript's canonical (CMS) record and its shadow (agent) copy in
//! agreement:
//!
//! - [`detector`]: per-field diff of both sides against the last baseline
//! - [`classifier`] / [`resolver`]: conflict scoring, merge rules, precedence
//! - [`lock`]: per-record leases with fencing tokens
//! - [`event_store`]: hash-chained audit trail
//! - [`decision_store`]: editorial decisions awaiting a sync
//! - [`orchestrator`]: the per-record state machine tying it together
//! - [`pipeline`]: file-backed wiring shared by the CLI and daemon

pub mod adapter;
pub mod baseline_store;
pub mod classifier;
pub mod decision_store;
pub mod detector;
pub mod error;
pub mod escalation;
pub mod event_store;
pub mod health;
pub mod json_store;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod resolver;
pub mod retry;

pub use adapter::{AgentStateStore, MemoryRecordStore, RecordStore};
pub use baseline_store::{BaselineStore, FileBaselineStore, MemoryBaselineStore};
pub use classifier::{classify, Classified, ConflictScorer, FixedScorer, RuleTableScorer, ScoringInput};
pub use decision_store::{DecisionStore, FileDecisionStore, MemoryDecisionStore};
pub use detector::{detect_changes, BaselineState};
pub use error::SyncError;
pub use escalation::{EscalationFeed, EscalationSubscription};
pub use event_store::{EventPage, EventStore, JsonlEventStore, MemoryEventStore};
pub use health::{Alert, AlertSink, HealthSnapshot, MetricsSnapshot, TracingAlertSink};
pub use json_store::JsonRecordStore;
pub use lock::{Acquire, AcquireMode, FileLockManager, Lease, LockManager, LockStats, MemoryLockManager};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use resolver::{resolve, Resolved, SideTimes};
pub use retry::{RetryDecision, RetryQueue};
