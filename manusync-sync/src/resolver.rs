//! Conflict resolution.
//!
//! | classification     | action                                         |
//! |--------------------|------------------------------------------------|
//! | `auto-resolvable`  | merge rule for the field kind (union / max)    |
//! | `needs-merge`      | precedence policy for the field                |
//! | `needs-escalation` | left unresolved for editorial review           |

use chrono::{DateTime, Utc};

use manusync_core::{
    Classification, Conflict, FieldValue, Precedence, Resolution, ResolutionRule, Side,
    SyncConfig,
};

use crate::classifier::merge_rule;

/// Last-modified stamps of both sides, used by `newest-wins`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideTimes {
    pub canonical: DateTime<Utc>,
    pub shadow: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub resolutions: Vec<Resolution>,
    pub unresolved: Vec<Conflict>,
}

pub fn resolve(conflicts: Vec<Conflict>, config: &SyncConfig, times: SideTimes) -> Resolved {
    let mut out = Resolved::default();
    for conflict in conflicts {
        match resolve_one(&conflict, config, times) {
            Some(resolution) => out.resolutions.push(resolution),
            None => out.unresolved.push(conflict),
        }
    }
    out
}

fn resolve_one(conflict: &Conflict, config: &SyncConfig, times: SideTimes) -> Option<Resolution> {
    match conflict.classification {
        Classification::NeedsEscalation => None,
        Classification::AutoResolvable => {
            let kind = config.policy_for(&conflict.field).kind;
            match merge_rule(kind, &conflict.canonical, &conflict.shadow) {
                Some(ResolutionRule::ListUnion) => Some(list_union(conflict)),
                Some(ResolutionRule::NumericMax) => Some(numeric_max(conflict)),
                // A custom scorer can rate a pair highly that has no merge
                // rule; settle it like a needs-merge conflict.
                _ => by_precedence(conflict, config.precedence_for(&conflict.field), times),
            }
        }
        Classification::NeedsMerge => {
            by_precedence(conflict, config.precedence_for(&conflict.field), times)
        }
    }
}

fn list_union(conflict: &Conflict) -> Resolution {
    let items = |v: &Option<FieldValue>| {
        v.as_ref()
            .and_then(FieldValue::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let mut merged = items(&conflict.canonical.new);
    let mut added = 0;
    for item in items(&conflict.shadow.new) {
        if !merged.contains(&item) {
            merged.push(item);
            added += 1;
        }
    }
    Resolution {
        field: conflict.field.clone(),
        value: Some(FieldValue::Array(merged)),
        rule: ResolutionRule::ListUnion,
        reason: format!("ordered union: canonical additions kept, {added} shadow addition(s) appended"),
    }
}

fn numeric_max(conflict: &Conflict) -> Resolution {
    let number = |v: &Option<FieldValue>| v.as_ref().and_then(FieldValue::as_f64);
    let (c, s) = (number(&conflict.canonical.new), number(&conflict.shadow.new));
    let (winner, value) = match (c, s) {
        (Some(c), Some(s)) if s > c => (Side::Shadow, conflict.shadow.new.clone()),
        _ => (Side::Canonical, conflict.canonical.new.clone()),
    };
    Resolution {
        field: conflict.field.clone(),
        value,
        rule: ResolutionRule::NumericMax,
        reason: format!("numeric max: {winner} value is the larger"),
    }
}

fn by_precedence(conflict: &Conflict, precedence: Precedence, times: SideTimes) -> Option<Resolution> {
    let (winner, reason) = match precedence {
        Precedence::CanonicalWins => (Side::Canonical, "canonical-wins policy".to_string()),
        Precedence::ShadowWins => (Side::Shadow, "shadow-wins policy".to_string()),
        Precedence::NewestWins if times.shadow > times.canonical => (
            Side::Shadow,
            format!(
                "newest-wins: shadow modified at {} after canonical at {}",
                times.shadow.to_rfc3339(),
                times.canonical.to_rfc3339()
            ),
        ),
        Precedence::NewestWins => (
            Side::Canonical,
            format!(
                "newest-wins: canonical modified at {}, shadow at {}",
                times.canonical.to_rfc3339(),
                times.shadow.to_rfc3339()
            ),
        ),
        Precedence::Escalate => return None,
    };
    let value = match winner {
        Side::Canonical => conflict.canonical.new.clone(),
        Side::Shadow => conflict.shadow.new.clone(),
    };
    Some(Resolution {
        field: conflict.field.clone(),
        value,
        rule: ResolutionRule::Precedence(precedence),
        reason,
    })
}
