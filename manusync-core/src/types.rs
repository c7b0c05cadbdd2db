//! Domain types shared by the sync engine, daemon and CLI.
//!
//! Field values are plain JSON values. A JSON `null` inside a record's field
//! map is an explicit deletion; a missing key means "unchanged since baseline".

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single manuscript field value.
pub type FieldValue = serde_json::Value;

/// Field name → value, ordered so every derived artefact is deterministic.
pub type FieldMap = BTreeMap<String, FieldValue>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of a manuscript, shared by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// True if the id can be used verbatim as a file stem.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && !self.0.contains(['/', '\\', '\0'])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which copy of a manuscript a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    /// The CMS, system of record.
    Canonical,
    /// The agent subsystem's derived copy.
    Shadow,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Canonical, Side::Shadow];

    pub fn other(self) -> Side {
        match self {
            Side::Canonical => Side::Shadow,
            Side::Shadow => Side::Canonical,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Canonical => write!(f, "canonical"),
            Side::Shadow => write!(f, "shadow"),
        }
    }
}

/// Shape of a field, which decides the automatic merge rule available to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    #[default]
    Scalar,
    /// JSON array; concurrent pure additions merge by ordered union.
    List,
    /// JSON number that only grows; concurrent writes merge by max.
    Counter,
}

/// How a `needs-merge` conflict picks a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Precedence {
    CanonicalWins,
    ShadowWins,
    #[default]
    NewestWins,
    /// No precedence rule; conflicts on the field go to editorial review.
    Escalate,
}

impl fmt::Display for Precedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precedence::CanonicalWins => write!(f, "canonical-wins"),
            Precedence::ShadowWins => write!(f, "shadow-wins"),
            Precedence::NewestWins => write!(f, "newest-wins"),
            Precedence::Escalate => write!(f, "escalate"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records and baselines
// ---------------------------------------------------------------------------

/// One side's copy of a manuscript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManuscriptRecord {
    pub id: RecordId,
    #[serde(default)]
    pub fields: FieldMap,
    pub revision: u64,
    pub modified_at: DateTime<Utc>,
    pub modified_by: Side,
}

impl ManuscriptRecord {
    /// An empty, never-written record (revision 0).
    pub fn empty(id: RecordId, side: Side) -> Self {
        Self {
            id,
            fields: FieldMap::new(),
            revision: 0,
            modified_at: DateTime::<Utc>::default(),
            modified_by: side,
        }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Live value of a field; explicit `null` tombstones read as absent.
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }
}

/// Last mutually agreed snapshot of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub record_id: RecordId,
    /// Never holds `null`; deleted fields are removed.
    #[serde(default)]
    pub fields: FieldMap,
    pub canonical_revision: u64,
    pub shadow_revision: u64,
    /// Bumped on every commit; 0 means "no agreement yet".
    pub generation: u64,
    pub synced_at: DateTime<Utc>,
}

impl Baseline {
    /// The implicit baseline used before the first successful sync.
    pub fn initial(record_id: RecordId) -> Self {
        Self {
            record_id,
            fields: FieldMap::new(),
            canonical_revision: 0,
            shadow_revision: 0,
            generation: 0,
            synced_at: DateTime::<Utc>::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Change sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeltaKind {
    Set,
    Deleted,
}

/// A change to one field on one side, relative to the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub field: String,
    pub origin: Side,
    pub kind: DeltaKind,
    pub old: Option<FieldValue>,
    /// `None` iff `kind == Deleted`.
    pub new: Option<FieldValue>,
    pub baseline_generation: u64,
}

/// Ordered per-field deltas for one record, sorted by field then origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub record_id: RecordId,
    pub baseline_generation: u64,
    pub deltas: Vec<FieldDelta>,
}

impl ChangeSet {
    pub fn empty(record_id: RecordId, baseline_generation: u64) -> Self {
        Self {
            record_id,
            baseline_generation,
            deltas: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldDelta> + 'a {
        self.deltas.iter().filter(move |d| d.field == field)
    }

    /// Distinct changed field names, in order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for delta in &self.deltas {
            if out.last() != Some(&delta.field.as_str()) {
                out.push(delta.field.as_str());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Conflicts and resolutions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    AutoResolvable,
    NeedsMerge,
    NeedsEscalation,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::AutoResolvable => write!(f, "auto-resolvable"),
            Classification::NeedsMerge => write!(f, "needs-merge"),
            Classification::NeedsEscalation => write!(f, "needs-escalation"),
        }
    }
}

/// Both sides changed the same field to different values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub record_id: RecordId,
    pub field: String,
    pub canonical: FieldDelta,
    pub shadow: FieldDelta,
    pub classification: Classification,
    pub confidence: f64,
}

impl Conflict {
    pub fn baseline_value(&self) -> Option<&FieldValue> {
        self.canonical.old.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "precedence", rename_all = "kebab-case")]
pub enum ResolutionRule {
    ListUnion,
    NumericMax,
    Precedence(Precedence),
    EditorialDecision,
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionRule::ListUnion => write!(f, "list-union"),
            ResolutionRule::NumericMax => write!(f, "numeric-max"),
            ResolutionRule::Precedence(p) => p.fmt(f),
            ResolutionRule::EditorialDecision => write!(f, "editorial-decision"),
        }
    }
}

/// The value a field settles on, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub field: String,
    /// `None` deletes the field on both sides.
    pub value: Option<FieldValue>,
    pub rule: ResolutionRule,
    pub reason: String,
}

/// A conflict handed to editorial review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Position in the escalation feed; subscribers resume after it.
    pub seq: u64,
    pub record_id: RecordId,
    pub field: String,
    pub canonical: Option<FieldValue>,
    pub shadow: Option<FieldValue>,
    pub baseline: Option<FieldValue>,
    pub confidence: f64,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    /// True if this escalation carries the given candidate pair.
    pub fn same_candidates(&self, canonical: Option<&FieldValue>, shadow: Option<&FieldValue>) -> bool {
        self.canonical.as_ref() == canonical && self.shadow.as_ref() == shadow
    }
}

/// An editor's ruling on an open escalation, kept until a sync applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub record_id: RecordId,
    pub field: String,
    /// Decided value; `None` deletes the field.
    pub value: Option<FieldValue>,
    /// Candidate pair of the escalation being decided. A decision whose
    /// escalation was since replaced no longer applies.
    pub canonical: Option<FieldValue>,
    pub shadow: Option<FieldValue>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// Decide `escalation` with `value`; JSON `null` deletes the field.
    pub fn for_escalation(escalation: &Escalation, value: FieldValue, decided_at: DateTime<Utc>) -> Self {
        Self {
            record_id: escalation.record_id.clone(),
            field: escalation.field.clone(),
            value: Some(value).filter(|v| !v.is_null()),
            canonical: escalation.canonical.clone(),
            shadow: escalation.shadow.clone(),
            decided_at,
        }
    }

    pub fn decides(&self, escalation: &Escalation) -> bool {
        self.record_id == escalation.record_id
            && self.field == escalation.field
            && escalation.same_candidates(self.canonical.as_ref(), self.shadow.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Sync events
// ---------------------------------------------------------------------------

/// States of one synchronization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Idle,
    LockAcquired,
    Detecting,
    Classifying,
    Resolving,
    Committing,
    Completed,
    Escalated,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::LockAcquired => "lock-acquired",
            SyncPhase::Detecting => "detecting",
            SyncPhase::Classifying => "classifying",
            SyncPhase::Resolving => "resolving",
            SyncPhase::Committing => "committing",
            SyncPhase::Completed => "completed",
            SyncPhase::Escalated => "escalated",
            SyncPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    Success,
    Escalated,
    FailedRetryable,
    FailedPermanent,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success => write!(f, "success"),
            SyncOutcome::Escalated => write!(f, "escalated"),
            SyncOutcome::FailedRetryable => write!(f, "failed-retryable"),
            SyncOutcome::FailedPermanent => write!(f, "failed-permanent"),
        }
    }
}

/// Immutable audit record of one synchronization attempt.
///
/// `seq`, `prev_hash` and `hash` are assigned by the event store on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(default)]
    pub seq: u64,
    pub record_id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub attempt: u32,
    pub changes: ChangeSet,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub resolutions: Vec<Resolution>,
    #[serde(default)]
    pub escalated_fields: Vec<String>,
    pub outcome: SyncOutcome,
    /// True if adapters and baseline were written.
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub baseline_generation: u64,
    #[serde(default)]
    pub redetections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<SyncPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub hash: String,
}

impl SyncEvent {
    /// A success that found nothing to do.
    pub fn is_noop(&self) -> bool {
        self.outcome == SyncOutcome::Success && self.changes.is_empty() && self.resolutions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_display_and_equality() {
        assert_eq!(RecordId::from("ms-1").to_string(), "ms-1");
        assert_eq!(RecordId::from("ms-1"), RecordId::from(String::from("ms-1")));
    }

    #[test]
    fn record_id_path_safety() {
        assert!(RecordId::from("ms-42").is_path_safe());
        assert!(!RecordId::from("../etc/passwd").is_path_safe());
        assert!(!RecordId::from("").is_path_safe());
        assert!(!RecordId::from("..").is_path_safe());
    }

    #[test]
    fn null_field_reads_as_absent() {
        let record = ManuscriptRecord::empty(RecordId::from("ms-1"), Side::Canonical)
            .with_field("title", json!("Acne"))
            .with_field("abstract", serde_json::Value::Null);
        assert_eq!(record.value("title"), Some(&json!("Acne")));
        assert_eq!(record.value("abstract"), None);
        assert_eq!(record.value("missing"), None);
    }

    #[test]
    fn side_serializes_kebab_case() {
        assert_eq!(serde_json::to_value(Side::Canonical).unwrap(), json!("canonical"));
        assert_eq!(Side::Shadow.other(), Side::Canonical);
    }

    #[test]
    fn resolution_rule_serde_roundtrip() {
        let rule = ResolutionRule::Precedence(Precedence::ShadowWins);
        let encoded = serde_json::to_value(rule).unwrap();
        assert_eq!(encoded, json!({"rule": "precedence", "precedence": "shadow-wins"}));
        let decoded: ResolutionRule = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, rule);
    }

    #[test]
    fn changeset_fields_are_distinct() {
        let delta = |field: &str, origin| FieldDelta {
            field: field.to_string(),
            origin,
            kind: DeltaKind::Set,
            old: None,
            new: Some(json!(1)),
            baseline_generation: 0,
        };
        let changes = ChangeSet {
            record_id: RecordId::from("ms-1"),
            baseline_generation: 0,
            deltas: vec![
                delta("a", Side::Canonical),
                delta("a", Side::Shadow),
                delta("b", Side::Shadow),
            ],
        };
        assert_eq!(changes.fields(), vec!["a", "b"]);
        assert_eq!(changes.for_field("a").count(), 2);
    }
}
