//! Phase-tagged candidate sets and their hash-indexed algebra.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::model::{EntityKey, PhaseTag};

/// An entity plus the phase(s) it matched in.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct Candidate {
    /// Entity identity.
    pub key: EntityKey,
    /// Matched phase.
    pub tag: PhaseTag,
}

/// Set of candidates keyed by entity; at most one tag per entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CandidateSet {
    entries: FxHashMap<EntityKey, PhaseTag>,
}

impl CandidateSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity, joining with any tag already present.
    pub fn insert(&mut self, key: EntityKey, tag: PhaseTag) {
        self.entries
            .entry(key)
            .and_modify(|existing| *existing = existing.join(tag))
            .or_insert(tag);
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tag of `key`, if present.
    pub fn get(&self, key: &EntityKey) -> Option<PhaseTag> {
        self.entries.get(key).copied()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, PhaseTag)> {
        self.entries.iter().map(|(key, tag)| (key, *tag))
    }

    /// Entity-wise union; shared entities get the join of their tags.
    pub fn union(self, other: CandidateSet) -> CandidateSet {
        let (mut large, small) = if self.len() >= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        for (key, tag) in small.entries {
            large.insert(key, tag);
        }
        large
    }

    /// Entity-wise intersection; tags meet and entities whose tags have no
    /// meet are dropped.
    pub fn intersect(self, other: CandidateSet) -> CandidateSet {
        self.intersect_with(other, |a, b| a.meet(b))
    }

    /// Intersection by entity key alone; tags are joined.
    ///
    /// Used to combine independently evaluated groups that each pin a
    /// different phase.
    pub fn intersect_by_key(self, other: CandidateSet) -> CandidateSet {
        self.intersect_with(other, |a, b| Some(a.join(b)))
    }

    fn intersect_with(
        self,
        other: CandidateSet,
        combine: impl Fn(PhaseTag, PhaseTag) -> Option<PhaseTag>,
    ) -> CandidateSet {
        let (smaller, index) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut entries = FxHashMap::default();
        entries.reserve(smaller.len());
        for (key, tag) in smaller.entries {
            let Some(other_tag) = index.entries.get(&key) else {
                continue;
            };
            if let Some(merged) = combine(tag, *other_tag) {
                entries.insert(key, merged);
            }
        }
        CandidateSet { entries }
    }

    /// Restricts every tag to `tag`, dropping entities with no meet.
    pub fn restrict(self, tag: PhaseTag) -> CandidateSet {
        if tag == PhaseTag::All {
            return self;
        }
        let entries = self
            .entries
            .into_iter()
            .filter_map(|(key, current)| current.meet(tag).map(|merged| (key, merged)))
            .collect();
        CandidateSet { entries }
    }

    /// Candidates sorted by entity key.
    pub fn into_sorted_vec(self) -> Vec<Candidate> {
        let mut out: Vec<_> = self
            .entries
            .into_iter()
            .map(|(key, tag)| Candidate { key, tag })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

impl FromIterator<(EntityKey, PhaseTag)> for CandidateSet {
    fn from_iter<I: IntoIterator<Item = (EntityKey, PhaseTag)>>(iter: I) -> Self {
        let mut set = CandidateSet::new();
        for (key, tag) in iter {
            set.insert(key, tag);
        }
        set
    }
}
