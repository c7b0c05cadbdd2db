//! Conflict classification.
//!
//! Splits a [`ChangeSet`] into deltas that can be applied as-is and
//! [`Conflict`]s (both sides changed a field to different values). Each
//! conflict is scored by a pluggable [`ConflictScorer`] and classified
//! against the configured thresholds and field policy.

use manusync_core::{
    ChangeSet, Classification, Conflict, FieldDelta, FieldKind, FieldPolicy, FieldValue,
    Precedence, ResolutionRule, Side, SyncConfig,
};

/// Everything a scorer may look at for one conflicting field.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub field: &'a str,
    pub policy: &'a FieldPolicy,
    pub precedence: Precedence,
    pub canonical: &'a FieldDelta,
    pub shadow: &'a FieldDelta,
}

impl ScoringInput<'_> {
    /// The deterministic merge rule available for this pair, if any.
    pub fn merge_rule(&self) -> Option<ResolutionRule> {
        merge_rule(self.policy.kind, self.canonical, self.shadow)
    }
}

/// Confidence that a conflict can be settled without a human, in `[0, 1]`.
pub trait ConflictScorer: Send + Sync {
    fn score(&self, input: &ScoringInput<'_>) -> f64;
}

/// Default scorer: a rule table keyed on field kind and precedence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleTableScorer {
    /// Score for pairs with a deterministic merge rule.
    pub mergeable: f64,
    /// Score for pairs settled by a precedence policy.
    pub precedence: f64,
    /// Score when neither applies.
    pub unmatched: f64,
}

impl Default for RuleTableScorer {
    fn default() -> Self {
        Self {
            mergeable: 0.95,
            precedence: 0.6,
            unmatched: 0.1,
        }
    }
}

impl ConflictScorer for RuleTableScorer {
    fn score(&self, input: &ScoringInput<'_>) -> f64 {
        if input.merge_rule().is_some() {
            self.mergeable
        } else if input.precedence != Precedence::Escalate {
            self.precedence
        } else {
            self.unmatched
        }
    }
}

/// Returns the same score for every conflict. Useful for pinning the
/// classifier to one band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedScorer(pub f64);

impl ConflictScorer for FixedScorer {
    fn score(&self, _input: &ScoringInput<'_>) -> f64 {
        self.0
    }
}

/// Output of [`classify`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    /// Deltas safe to apply: one-sided changes, and two-sided changes that
    /// agree (canonical delta kept).
    pub passthrough: Vec<FieldDelta>,
    pub conflicts: Vec<Conflict>,
}

/// Classify every field of `changes`.
pub fn classify(
    changes: &ChangeSet,
    config: &SyncConfig,
    scorer: &dyn ConflictScorer,
) -> Classified {
    let mut out = Classified::default();
    for field in changes.fields() {
        let canonical = changes.for_field(field).find(|d| d.origin == Side::Canonical);
        let shadow = changes.for_field(field).find(|d| d.origin == Side::Shadow);
        match (canonical, shadow) {
            (Some(c), Some(s)) if c.new == s.new => out.passthrough.push(c.clone()),
            (Some(c), Some(s)) => out.conflicts.push(classify_pair(changes, config, scorer, c, s)),
            (Some(only), None) | (None, Some(only)) => out.passthrough.push(only.clone()),
            (None, None) => {}
        }
    }
    out
}

fn classify_pair(
    changes: &ChangeSet,
    config: &SyncConfig,
    scorer: &dyn ConflictScorer,
    canonical: &FieldDelta,
    shadow: &FieldDelta,
) -> Conflict {
    let field = canonical.field.as_str();
    let policy = config.policy_for(field);
    let input = ScoringInput {
        field,
        policy: &policy,
        precedence: config.precedence_for(field),
        canonical,
        shadow,
    };
    let confidence = clamp_score(scorer.score(&input));

    let classification = if policy.sensitive || confidence < config.thresholds.low {
        Classification::NeedsEscalation
    } else if confidence >= config.thresholds.high && input.merge_rule().is_some() {
        Classification::AutoResolvable
    } else if input.precedence != Precedence::Escalate {
        Classification::NeedsMerge
    } else {
        Classification::NeedsEscalation
    };

    tracing::debug!(
        record_id = %changes.record_id,
        field,
        confidence,
        classification = %classification,
        "classified conflict"
    );

    Conflict {
        record_id: changes.record_id.clone(),
        field: field.to_string(),
        canonical: canonical.clone(),
        shadow: shadow.clone(),
        classification,
        confidence,
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// The deterministic merge rule for a two-sided change, if the field kind
/// has one and the values fit it.
///
/// Lists merge only when neither side removed anything from the baseline.
/// Counters merge whenever both sides hold numbers.
pub fn merge_rule(
    kind: FieldKind,
    canonical: &FieldDelta,
    shadow: &FieldDelta,
) -> Option<ResolutionRule> {
    let (c, s) = (canonical.new.as_ref()?, shadow.new.as_ref()?);
    match kind {
        FieldKind::Scalar => None,
        FieldKind::List => {
            let base = match canonical.old.as_ref() {
                None => &[][..],
                Some(FieldValue::Array(items)) => items.as_slice(),
                Some(_) => return None,
            };
            let only_added = |v: &FieldValue| {
                v.as_array()
                    .is_some_and(|items| base.iter().all(|b| items.contains(b)))
            };
            (only_added(c) && only_added(s)).then_some(ResolutionRule::ListUnion)
        }
        FieldKind::Counter => {
            (c.is_number() && s.is_number()).then_some(ResolutionRule::NumericMax)
        }
    }
}
