//! Core identities shared by every layer of the engine: node categories,
//! entity keys, collection phases and the phase-tag lattice.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the five data collections held by the remote store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum NodeCategory {
    /// Demographic record, stored flat without a timestamp level.
    #[serde(rename = "patients1")]
    Patients,
    /// Household survey form.
    #[serde(rename = "Form_1")]
    Form1,
    /// Vitals captured by field staff.
    #[serde(rename = "manual_vital_data")]
    ManualVitals,
    /// Screening form.
    #[serde(rename = "Form_3")]
    Form3,
    /// Treatment and care coordination form.
    #[serde(rename = "tcc_form")]
    TccForm,
}

impl NodeCategory {
    /// Every category, in store order.
    pub const ALL: [NodeCategory; 5] = [
        NodeCategory::Patients,
        NodeCategory::Form1,
        NodeCategory::ManualVitals,
        NodeCategory::Form3,
        NodeCategory::TccForm,
    ];

    /// Name of the category as it appears in store paths.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeCategory::Patients => "patients1",
            NodeCategory::Form1 => "Form_1",
            NodeCategory::ManualVitals => "manual_vital_data",
            NodeCategory::Form3 => "Form_3",
            NodeCategory::TccForm => "tcc_form",
        }
    }

    /// Whether entity data in this category is keyed by Unix timestamps.
    pub fn is_timestamped(self) -> bool {
        !matches!(self, NodeCategory::Patients)
    }
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a string does not name a node category.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown node category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for NodeCategory {
    type Err = UnknownCategory;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        NodeCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownCategory(value.to_owned()))
    }
}

/// Identity of a survey subject.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Region (Panchayath) identifier.
    pub region: String,
    /// Subregion (Village) identifier, prefixed by its region code.
    pub subregion: String,
    /// Subject uuid.
    pub id: String,
}

impl EntityKey {
    /// Builds a key from its three path segments.
    pub fn new(
        region: impl Into<String>,
        subregion: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            subregion: subregion.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.subregion, self.id)
    }
}

/// Temporal collection phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Phase {
    /// Records collected before the cutoff.
    One,
    /// Records collected at or after the cutoff.
    Two,
}

impl Phase {
    /// Numeric form used in frames and selector values.
    pub fn number(self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
        }
    }

    /// Parses `1`/`2` in any of the spellings the client emits
    /// (`"Phase 1"`, `"phase-2"`, `"2"`).
    pub fn parse_loose(value: &str) -> Option<Phase> {
        let value = value.trim();
        let digits = value.trim_start_matches(|c: char| !c.is_ascii_digit());
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match digits.parse::<u32>().ok()? {
            1 => Some(Phase::One),
            2 => Some(Phase::Two),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {}", self.number())
    }
}

/// Phase annotation carried by a candidate match.
///
/// `All` is the top of the lattice: `join` widens towards it and `meet`
/// narrows away from it. Two different concrete phases have no meet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PhaseTag {
    /// Matched in phase 1 only.
    #[serde(rename = "1")]
    One,
    /// Matched in phase 2 only.
    #[serde(rename = "2")]
    Two,
    /// Matched independent of phase, or in both.
    #[serde(rename = "all")]
    All,
}

impl PhaseTag {
    /// Least upper bound.
    pub fn join(self, other: PhaseTag) -> PhaseTag {
        if self == other {
            self
        } else {
            PhaseTag::All
        }
    }

    /// Greatest lower bound; `None` when the two tags name different phases.
    pub fn meet(self, other: PhaseTag) -> Option<PhaseTag> {
        match (self, other) {
            (PhaseTag::All, tag) | (tag, PhaseTag::All) => Some(tag),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }

    /// The concrete phase, if the tag names one.
    pub fn phase(self) -> Option<Phase> {
        match self {
            PhaseTag::One => Some(Phase::One),
            PhaseTag::Two => Some(Phase::Two),
            PhaseTag::All => None,
        }
    }
}

impl From<Phase> for PhaseTag {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::One => PhaseTag::One,
            Phase::Two => PhaseTag::Two,
        }
    }
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTag::One => f.write_str("1"),
            PhaseTag::Two => f.write_str("2"),
            PhaseTag::All => f.write_str("all"),
        }
    }
}
