//! Baseline diff: what changed on each side since the last agreement.
//!
//! Each side is compared with the baseline independently:
//!
//! | side value         | baseline value | delta            |
//! |--------------------|----------------|------------------|
//! | absent key         | anything       | none (unchanged) |
//! | `null`             | present        | `deleted`        |
//! | `null`             | absent         | none             |
//! | `v`                | `v`            | none             |
//! | `v`                | other / absent | `set`            |

use std::collections::BTreeSet;

use manusync_core::{
    Baseline, ChangeSet, DeltaKind, FieldDelta, FieldValue, ManuscriptRecord, RecordId, Side,
};

use crate::error::SyncError;

/// What the orchestrator knows about a record's baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum BaselineState {
    /// Never synchronized; diff against an empty baseline.
    Never,
    Present(Baseline),
    /// History says a baseline must exist but none was found.
    Missing,
}

impl BaselineState {
    /// The baseline to diff against, or an integrity error.
    pub fn resolve(&self, record_id: &RecordId) -> Result<Baseline, SyncError> {
        match self {
            BaselineState::Never => Ok(Baseline::initial(record_id.clone())),
            BaselineState::Present(baseline) => Ok(baseline.clone()),
            BaselineState::Missing => Err(SyncError::Integrity(format!(
                "record {record_id} has committed sync history but no baseline"
            ))),
        }
    }
}

/// Compute the per-field deltas of both sides against `baseline`.
///
/// Pure and deterministic: deltas come out sorted by field name, canonical
/// before shadow.
pub fn detect_changes(
    canonical: &ManuscriptRecord,
    shadow: &ManuscriptRecord,
    baseline: &BaselineState,
) -> Result<ChangeSet, SyncError> {
    let record_id = &canonical.id;
    if shadow.id != *record_id {
        return Err(SyncError::Integrity(format!(
            "canonical record '{record_id}' paired with shadow record '{}'",
            shadow.id
        )));
    }
    let baseline = baseline.resolve(record_id)?;
    if baseline.record_id != *record_id {
        return Err(SyncError::Integrity(format!(
            "baseline of '{}' supplied for record '{record_id}'",
            baseline.record_id
        )));
    }

    let fields: BTreeSet<&String> = canonical
        .fields
        .keys()
        .chain(shadow.fields.keys())
        .chain(baseline.fields.keys())
        .collect();

    let mut changes = ChangeSet::empty(record_id.clone(), baseline.generation);
    for field in fields {
        let base = baseline.fields.get(field.as_str()).filter(|v| !v.is_null());
        for (side, record) in [(Side::Canonical, canonical), (Side::Shadow, shadow)] {
            let current = record.fields.get(field.as_str());
            if let Some(delta) = side_delta(field, side, current, base, baseline.generation) {
                changes.deltas.push(delta);
            }
        }
    }
    Ok(changes)
}

fn side_delta(
    field: &str,
    origin: Side,
    current: Option<&FieldValue>,
    base: Option<&FieldValue>,
    generation: u64,
) -> Option<FieldDelta> {
    let current = current?;
    let (kind, new) = if current.is_null() {
        base?;
        (DeltaKind::Deleted, None)
    } else if Some(current) == base {
        return None;
    } else {
        (DeltaKind::Set, Some(current.clone()))
    };
    Some(FieldDelta {
        field: field.to_string(),
        origin,
        kind,
        old: base.cloned(),
        new,
        baseline_generation: generation,
    })
}
