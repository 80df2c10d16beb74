//! Phase-aware projection of timestamp-versioned node data.
//!
//! Entity data in timestamped categories is stored as `{ "<epoch secs>": record }`.
//! Predicates only ever see one record at a time, so this module picks the
//! active record(s) for a requested [`PhaseMode`] and reports which phases the
//! entity has any data in at all.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Phase, PhaseTag};

/// Start of phase 2: 2024-01-01T00:00:00Z.
pub const DEFAULT_PHASE_CUTOFF: i64 = 1_704_067_200;

/// Cutoff instant separating the two collection phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseCutoff {
    /// Boundary instant in Unix epoch seconds.
    pub cutoff: i64,
    /// When set, a record stamped exactly at `cutoff` belongs to phase 1.
    pub phase1_inclusive: bool,
}

impl Default for PhaseCutoff {
    fn default() -> Self {
        Self {
            cutoff: DEFAULT_PHASE_CUTOFF,
            phase1_inclusive: false,
        }
    }
}

impl PhaseCutoff {
    /// Cutoff at `cutoff` with the default exclusive phase 1 boundary.
    pub fn new(cutoff: i64) -> Self {
        Self {
            cutoff,
            phase1_inclusive: false,
        }
    }

    /// Phase a timestamp falls into.
    pub fn phase_of(&self, ts: i64) -> Phase {
        let in_phase1 = if self.phase1_inclusive {
            ts <= self.cutoff
        } else {
            ts < self.cutoff
        };
        if in_phase1 {
            Phase::One
        } else {
            Phase::Two
        }
    }

    /// Classifies a closed date range relative to the cutoff.
    pub fn classify_range(&self, lo: i64, hi: i64) -> RangeClass {
        match (self.phase_of(lo), self.phase_of(hi)) {
            (Phase::One, Phase::One) => RangeClass::Phase1,
            (Phase::Two, Phase::Two) => RangeClass::Phase2,
            _ => RangeClass::Between,
        }
    }
}

/// Position of a date range relative to the phase cutoff.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeClass {
    /// Both bounds before the cutoff.
    Phase1,
    /// Both bounds on or after the cutoff.
    Phase2,
    /// The range straddles the cutoff.
    Between,
}

impl RangeClass {
    /// Tag given to candidates matched through a range of this class.
    pub fn tag(self) -> PhaseTag {
        match self {
            RangeClass::Phase1 => PhaseTag::One,
            RangeClass::Phase2 => PhaseTag::Two,
            RangeClass::Between => PhaseTag::All,
        }
    }
}

/// Which record(s) a projection selects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhaseMode {
    /// Latest record of each phase independently.
    Unscoped,
    /// Latest record within the closed range `[lo, hi]`.
    DateRange {
        /// Lower bound, epoch seconds.
        lo: i64,
        /// Upper bound, epoch seconds.
        hi: i64,
    },
    /// Latest record of a single phase.
    PhaseOnly(Phase),
}

/// Which phases an entity has any data in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Coverage {
    /// At least one record before the cutoff.
    pub has_phase1: bool,
    /// At least one record on or after the cutoff.
    pub has_phase2: bool,
}

impl Coverage {
    /// Coverage flag for one phase.
    pub fn has(&self, phase: Phase) -> bool {
        match phase {
            Phase::One => self.has_phase1,
            Phase::Two => self.has_phase2,
        }
    }
}

/// A record chosen by the projector.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedRecord {
    /// Timestamp key the record was stored under.
    pub timestamp: i64,
    /// Phase of `timestamp`.
    pub phase: Phase,
    /// The record itself.
    pub record: Value,
}

/// Output of [`project`]: zero, one or two active records plus coverage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectedView {
    /// Selected records, phase 1 first.
    pub records: Vec<ProjectedRecord>,
    /// Coverage computed over every numeric key, not only the selected ones.
    pub coverage: Coverage,
}

impl ProjectedView {
    /// Whether no record was selected.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The selected record for `phase`, if any.
    pub fn record_for(&self, phase: Phase) -> Option<&ProjectedRecord> {
        self.records.iter().find(|record| record.phase == phase)
    }

    /// Rebuilds the `{ timestamp: record }` shape from the selected records.
    pub fn to_raw(&self) -> Value {
        let map: Map<String, Value> = self
            .records
            .iter()
            .map(|record| (record.timestamp.to_string(), record.record.clone()))
            .collect();
        Value::Object(map)
    }
}

/// Parses a timestamp key. Fractional keys are truncated; anything else is rejected.
pub fn parse_timestamp(key: &str) -> Option<i64> {
    let key = key.trim();
    if let Ok(ts) = key.parse::<i64>() {
        return Some(ts);
    }
    key.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| value.trunc() as i64)
}

/// Iterates the numeric timestamp entries of a raw node value.
pub fn timestamped_entries(raw: &Value) -> impl Iterator<Item = (i64, &Value)> {
    raw.as_object()
        .into_iter()
        .flat_map(|map| map.iter())
        .filter_map(|(key, record)| parse_timestamp(key).map(|ts| (ts, record)))
}

/// Coverage flags of a raw node value.
pub fn coverage(raw: &Value, cutoff: &PhaseCutoff) -> Coverage {
    let mut coverage = Coverage::default();
    for (ts, _) in timestamped_entries(raw) {
        match cutoff.phase_of(ts) {
            Phase::One => coverage.has_phase1 = true,
            Phase::Two => coverage.has_phase2 = true,
        }
        if coverage.has_phase1 && coverage.has_phase2 {
            break;
        }
    }
    coverage
}

/// Projects raw timestamped data for one entity under `mode`.
pub fn project(raw: &Value, mode: PhaseMode, cutoff: &PhaseCutoff) -> ProjectedView {
    let coverage = coverage(raw, cutoff);
    let records = match mode {
        PhaseMode::Unscoped => [Phase::One, Phase::Two]
            .into_iter()
            .filter_map(|phase| latest(raw, cutoff, |ts| cutoff.phase_of(ts) == phase))
            .collect(),
        PhaseMode::DateRange { lo, hi } => latest(raw, cutoff, |ts| lo <= ts && ts <= hi)
            .into_iter()
            .collect(),
        PhaseMode::PhaseOnly(phase) => latest(raw, cutoff, |ts| cutoff.phase_of(ts) == phase)
            .into_iter()
            .collect(),
    };
    ProjectedView { records, coverage }
}

fn latest(
    raw: &Value,
    cutoff: &PhaseCutoff,
    accept: impl Fn(i64) -> bool,
) -> Option<ProjectedRecord> {
    timestamped_entries(raw)
        .filter(|(ts, _)| accept(*ts))
        .max_by_key(|(ts, _)| *ts)
        .map(|(timestamp, record)| ProjectedRecord {
            timestamp,
            phase: cutoff.phase_of(timestamp),
            record: record.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form1() -> Value {
        json!({
            "1700000000": { "rec": "A" },
            "1710000000": { "rec": "B" },
        })
    }

    #[test]
    fn unscoped_projects_one_record_per_phase() {
        let cutoff = PhaseCutoff::default();
        let view = project(&form1(), PhaseMode::Unscoped, &cutoff);
        assert_eq!(view.records.len(), 2);
        let first = view.record_for(Phase::One).expect("phase 1 record");
        assert_eq!(first.record, json!({ "rec": "A" }));
        let second = view.record_for(Phase::Two).expect("phase 2 record");
        assert_eq!(second.record, json!({ "rec": "B" }));
        assert!(view.coverage.has_phase1 && view.coverage.has_phase2);
    }

    #[test]
    fn phase_only_selects_latest_on_that_side() {
        let cutoff = PhaseCutoff::default();
        let view = project(&form1(), PhaseMode::PhaseOnly(Phase::Two), &cutoff);
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.records[0].record, json!({ "rec": "B" }));
        assert_eq!(view.records[0].timestamp, 1_710_000_000);
    }

    #[test]
    fn latest_timestamp_wins_within_a_phase() {
        let raw = json!({
            "1690000000": { "v": 1 },
            "1695000000": { "v": 2 },
            "1712000000": { "v": 3 },
        });
        let view = project(&raw, PhaseMode::PhaseOnly(Phase::One), &PhaseCutoff::default());
        assert_eq!(view.records[0].record, json!({ "v": 2 }));
    }

    #[test]
    fn projection_is_idempotent() {
        let cutoff = PhaseCutoff::default();
        for mode in [
            PhaseMode::Unscoped,
            PhaseMode::PhaseOnly(Phase::One),
            PhaseMode::DateRange {
                lo: 1_690_000_000,
                hi: 1_720_000_000,
            },
        ] {
            let once = project(&form1(), mode, &cutoff);
            let twice = project(&once.to_raw(), mode, &cutoff);
            assert_eq!(once.records, twice.records, "mode {mode:?}");
        }
    }

    #[test]
    fn date_range_picks_latest_inside_bounds() {
        let cutoff = PhaseCutoff::default();
        let mode = PhaseMode::DateRange {
            lo: 1_699_000_000,
            hi: 1_701_000_000,
        };
        let view = project(&form1(), mode, &cutoff);
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.records[0].phase, Phase::One);
        assert!(view.coverage.has_phase2, "coverage ignores the range");
    }

    #[test]
    fn non_numeric_keys_are_discarded() {
        let raw = json!({ "draft": { "v": 0 }, "1700000000": { "v": 1 } });
        let view = project(&raw, PhaseMode::Unscoped, &PhaseCutoff::default());
        assert_eq!(view.records.len(), 1);
        assert!(!view.coverage.has_phase2);

        let empty = project(&json!({ "draft": {} }), PhaseMode::Unscoped, &PhaseCutoff::default());
        assert!(empty.is_empty());
        assert_eq!(empty.coverage, Coverage::default());
        assert!(project(&Value::Null, PhaseMode::Unscoped, &PhaseCutoff::default()).is_empty());
    }

    #[test]
    fn boundary_convention_is_configurable() {
        let exclusive = PhaseCutoff::default();
        assert_eq!(exclusive.phase_of(DEFAULT_PHASE_CUTOFF), Phase::Two);
        assert_eq!(exclusive.phase_of(DEFAULT_PHASE_CUTOFF - 1), Phase::One);
        let inclusive = PhaseCutoff {
            phase1_inclusive: true,
            ..PhaseCutoff::default()
        };
        assert_eq!(inclusive.phase_of(DEFAULT_PHASE_CUTOFF), Phase::One);
        assert_eq!(inclusive.phase_of(DEFAULT_PHASE_CUTOFF + 1), Phase::Two);
    }

    #[test]
    fn ranges_classify_against_cutoff() {
        let cutoff = PhaseCutoff::default();
        assert_eq!(cutoff.classify_range(1, 2), RangeClass::Phase1);
        assert_eq!(
            cutoff.classify_range(DEFAULT_PHASE_CUTOFF, DEFAULT_PHASE_CUTOFF + 10),
            RangeClass::Phase2
        );
        assert_eq!(
            cutoff.classify_range(1, DEFAULT_PHASE_CUTOFF),
            RangeClass::Between
        );
        assert_eq!(RangeClass::Between.tag(), PhaseTag::All);
    }

    #[test]
    fn fractional_keys_truncate() {
        assert_eq!(parse_timestamp("1700000000.75"), Some(1_700_000_000));
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("NaN"), None);
    }
}
