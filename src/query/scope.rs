//! Scope descriptors derived from general selectors.
//!
//! A general selector is not a record test: it names a partition of the key
//! space (`Panchayath`, `Village`) or a temporal slice (`Date`, `Phase`). The
//! evaluator uses these descriptors both as candidate generators and as
//! ambient restrictions pushed into sibling subtrees.

use std::fmt;

use serde_json::Value;
use time::macros::format_description;
use time::Date;

use crate::model::{EntityKey, Phase, PhaseTag};
use crate::query::errors::QueryError;
use crate::query::token::Selector;

/// Default length of the region code prefixed to every subregion id.
pub const DEFAULT_SUBREGION_PREFIX_LEN: usize = 3;

const SECONDS_PER_DAY: i64 = 86_400;

/// A resolved general selector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GeneralScope {
    /// Every entity in one region.
    Region(String),
    /// Every entity in one subregion.
    Subregion(String),
    /// Entities with a `Form_1` record stamped in the closed range.
    DateRange {
        /// Lower bound, epoch seconds.
        lo: i64,
        /// Upper bound, epoch seconds.
        hi: i64,
    },
    /// Entities with a `Form_1` record in the phase.
    Phase(Phase),
}

impl GeneralScope {
    /// Resolves a general selector.
    pub fn from_selector(selector: &Selector) -> Result<Self, QueryError> {
        let label = selector.to_string();
        match selector.field.trim().to_ascii_lowercase().as_str() {
            "panchayath" | "region" => partition_id(&selector.value)
                .map(GeneralScope::Region)
                .ok_or_else(|| QueryError::invalid(label, "expected a region id")),
            "village" | "subregion" => partition_id(&selector.value)
                .map(GeneralScope::Subregion)
                .ok_or_else(|| QueryError::invalid(label, "expected a subregion id")),
            "date" | "date range" => {
                let (lo, hi) = date_bounds(&selector.value)
                    .ok_or_else(|| QueryError::invalid(&label, "expected a from/to date range"))?;
                if lo > hi {
                    return Err(QueryError::invalid(label, "lower bound is after upper bound"));
                }
                Ok(GeneralScope::DateRange { lo, hi })
            }
            "phase" => phase_value(&selector.value)
                .map(GeneralScope::Phase)
                .ok_or_else(|| QueryError::invalid(label, "expected Phase 1 or Phase 2")),
            other => Err(QueryError::invalid(
                label,
                format!("unknown general selector '{other}'"),
            )),
        }
    }

    /// Whether the scope restricts partitions rather than time.
    pub fn is_partition(&self) -> bool {
        matches!(self, GeneralScope::Region(_) | GeneralScope::Subregion(_))
    }

    /// Ambient restriction this scope contributes when pushed into a sibling.
    ///
    /// Date ranges return `None`: their candidates are tagged by range class,
    /// so the sibling must be evaluated unscoped and intersected.
    pub fn pushdown(&self, prefix_len: usize) -> Option<Scope> {
        match self {
            GeneralScope::Region(region) => Some(Scope {
                partition: PartitionScope::region(region.clone()),
                phase: None,
            }),
            GeneralScope::Subregion(subregion) => Some(Scope {
                partition: PartitionScope::subregion(subregion.clone(), prefix_len),
                phase: None,
            }),
            GeneralScope::Phase(phase) => Some(Scope {
                partition: PartitionScope::default(),
                phase: Some(*phase),
            }),
            GeneralScope::DateRange { .. } => None,
        }
    }
}

impl fmt::Display for GeneralScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneralScope::Region(region) => write!(f, "region {region}"),
            GeneralScope::Subregion(subregion) => write!(f, "subregion {subregion}"),
            GeneralScope::DateRange { lo, hi } => write!(f, "date [{lo}, {hi}]"),
            GeneralScope::Phase(phase) => phase.fmt(f),
        }
    }
}

/// Restriction on the `(region, subregion)` partitions scanned.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PartitionScope {
    /// Only this region.
    pub region: Option<String>,
    /// Only this subregion.
    pub subregion: Option<String>,
}

impl PartitionScope {
    /// Restriction to one region.
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            subregion: None,
        }
    }

    /// Restriction to one subregion; the region is derived from its prefix.
    pub fn subregion(subregion: impl Into<String>, prefix_len: usize) -> Self {
        let subregion = subregion.into();
        let region = (prefix_len > 0 && subregion.len() > prefix_len)
            .then(|| subregion.get(..prefix_len).map(str::to_owned))
            .flatten();
        Self {
            region,
            subregion: Some(subregion),
        }
    }

    /// Whether `key` lies inside the restriction.
    ///
    /// A derived region is only a lookup hint; the subregion id decides.
    pub fn contains(&self, key: &EntityKey) -> bool {
        match (&self.region, &self.subregion) {
            (_, Some(subregion)) => &key.subregion == subregion,
            (Some(region), None) => &key.region == region,
            (None, None) => true,
        }
    }

    /// Intersection of two restrictions; `None` when they are disjoint.
    pub fn narrow(&self, other: &PartitionScope) -> Option<PartitionScope> {
        let subregion = merge(&self.subregion, &other.subregion)?;
        let region = merge(&self.region, &other.region)?;
        Some(PartitionScope { region, subregion })
    }
}

fn merge(a: &Option<String>, b: &Option<String>) -> Option<Option<String>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => None,
        (Some(x), _) | (_, Some(x)) => Some(Some(x.clone())),
        (None, None) => Some(None),
    }
}

/// Ambient scope passed down while evaluating a subtree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Scope {
    /// Partition restriction.
    pub partition: PartitionScope,
    /// Temporal restriction.
    pub phase: Option<Phase>,
}

impl Scope {
    /// Tag given to record and coverage matches under this scope.
    pub fn base_tag(&self) -> PhaseTag {
        self.phase.map(PhaseTag::from).unwrap_or(PhaseTag::All)
    }

    /// Combines two ambient scopes; `None` when their restrictions are disjoint.
    pub fn narrow(&self, other: &Scope) -> Option<Scope> {
        let partition = self.partition.narrow(&other.partition)?;
        let phase = match (self.phase, other.phase) {
            (Some(a), Some(b)) if a != b => return None,
            (a, b) => a.or(b),
        };
        Some(Scope { partition, phase })
    }
}

fn partition_id(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) if items.len() == 1 => return partition_id(&items[0]),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

fn phase_value(value: &Value) -> Option<Phase> {
    match value {
        Value::Number(number) => match number.as_u64()? {
            1 => Some(Phase::One),
            2 => Some(Phase::Two),
            _ => None,
        },
        Value::String(text) => Phase::parse_loose(text),
        _ => None,
    }
}

fn date_bounds(value: &Value) -> Option<(i64, i64)> {
    let (lo, hi) = match value {
        Value::Object(map) => (
            map.get("from").or_else(|| map.get("start"))?,
            map.get("to").or_else(|| map.get("end"))?,
        ),
        Value::Array(items) if items.len() == 2 => (&items[0], &items[1]),
        Value::String(text) => {
            let (lo, hi) = text.split_once(" to ")?;
            return Some((date_bound(&Value::from(lo), false)?, date_bound(&Value::from(hi), true)?));
        }
        _ => return None,
    };
    Some((date_bound(lo, false)?, date_bound(hi, true)?))
}

/// Epoch seconds from a bound; calendar dates cover the whole day.
fn date_bound(value: &Value, end_of_day: bool) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(epoch) = text.parse::<i64>() {
                return Some(epoch);
            }
            let date = Date::parse(text, format_description!("[year]-[month]-[day]")).ok()?;
            let start = date.midnight().assume_utc().unix_timestamp();
            Some(if end_of_day {
                start + SECONDS_PER_DAY - 1
            } else {
                start
            })
        }
        _ => None,
    }
}
