//! Generic predicate evaluation driven by [`FieldDef`] entries.
//!
//! Every failure mode (missing path, unexpected type, unsupported operator)
//! resolves to `false`. Callers treat a `false` as "does not match" and move on.

use std::collections::BTreeSet;

use serde_json::Value;

use super::{ComparatorKind, FieldDef, MatchPolicy};
use crate::model::Phase;
use crate::query::token::Operator;
use crate::temporal::Coverage;

/// Tests `record` against `field` using the selector's operator and value.
pub fn evaluate(field: &FieldDef, op: Operator, expected: &Value, record: &Value) -> bool {
    let Some(stored) = field.path.resolve(record) else {
        tracing::trace!(field = %field.label, path = %field.path, "field absent from record");
        return false;
    };
    match field.kind {
        ComparatorKind::Exact => exact(field, op, expected, stored),
        ComparatorKind::Numeric => numeric(op, expected, stored),
        ComparatorKind::Multiset => multiset(field, op, expected, stored),
        ComparatorKind::Coverage => {
            tracing::debug!(field = %field.label, "coverage field cannot test a single record");
            false
        }
    }
}

fn exact(field: &FieldDef, op: Operator, expected: &Value, stored: &Value) -> bool {
    let Some(stored) = scalar_text(stored) else {
        return false;
    };
    let stored = stored.trim();
    let matches_label = |label: &str| field.code_for(label) == stored;
    match op {
        Operator::Eq => scalar_text(expected).is_some_and(|label| matches_label(&label)),
        Operator::Ne => scalar_text(expected).is_some_and(|label| !matches_label(&label)),
        Operator::In => labels(expected).iter().any(|label| matches_label(label)),
        other => {
            tracing::debug!(field = %field.label, op = %other, "operator unsupported for exact field");
            false
        }
    }
}

fn numeric(op: Operator, expected: &Value, stored: &Value) -> bool {
    let (Some(stored), Some(expected)) = (number(stored), number(expected)) else {
        return false;
    };
    match op {
        Operator::Eq => stored == expected,
        Operator::Ne => stored != expected,
        Operator::Lt => stored < expected,
        Operator::Le => stored <= expected,
        Operator::Gt => stored > expected,
        Operator::Ge => stored >= expected,
        Operator::In => false,
    }
}

fn multiset(field: &FieldDef, op: Operator, expected: &Value, stored: &Value) -> bool {
    if !matches!(op, Operator::Eq | Operator::In) {
        tracing::debug!(field = %field.label, op = %op, "operator unsupported for multiset field");
        return false;
    }
    let wanted: BTreeSet<String> = labels(expected)
        .iter()
        .map(|label| field.code_for(label).to_owned())
        .collect();
    if wanted.is_empty() {
        return false;
    }
    let present = set_keys(stored);
    match field.policy {
        MatchPolicy::AnyOf => wanted.iter().any(|key| present.contains(key)),
        MatchPolicy::ExactSet => wanted == present,
    }
}

/// Requested state of a coverage-status selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoverageState {
    /// `true` for "Covered in Phase k", `false` for "Not Covered in Phase k".
    pub covered: bool,
    /// Phase the state refers to.
    pub phase: Phase,
}

impl CoverageState {
    /// Parses `Covered in Phase 1`, `Not Covered in Phase 2` and similar.
    pub fn parse(value: &Value) -> Option<Self> {
        let text = value.as_str()?.trim().to_ascii_lowercase();
        if !text.contains("covered") {
            return None;
        }
        let covered = !text.starts_with("not");
        let phase = Phase::parse_loose(&text)?;
        Some(Self { covered, phase })
    }
}

/// Whether the coverage flags of a family's timestamped members satisfy `state`.
///
/// A family is covered in phase `k` when every timestamped member holds at
/// least one record in `k`.
pub fn coverage_matches(state: CoverageState, members: &[Coverage]) -> bool {
    let covered = !members.is_empty() && members.iter().all(|flags| flags.has(state.phase));
    covered == state.covered
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn labels(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        Value::String(text) => text
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_owned)
            .collect(),
        other => scalar_text(other).into_iter().collect(),
    }
}

fn set_keys(stored: &Value) -> BTreeSet<String> {
    match stored {
        Value::Object(map) => map
            .iter()
            .filter(|(_, flag)| truthy(flag))
            .map(|(key, _)| key.clone())
            .collect(),
        Value::Array(_) | Value::String(_) => labels(stored).into_iter().collect(),
        _ => BTreeSet::new(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "y" | "yes" | "true" | "1"
        ),
        _ => false,
    }
}
