#![allow(missing_docs)]

use cohort::query::candidates::CandidateSet;
use cohort::temporal::{project, PhaseCutoff, PhaseMode};
use cohort::{EntityKey, Phase, PhaseTag};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn arb_tag() -> impl Strategy<Value = PhaseTag> {
    prop_oneof![Just(PhaseTag::One), Just(PhaseTag::Two), Just(PhaseTag::All)]
}

fn arb_set() -> impl Strategy<Value = Vec<(u8, PhaseTag)>> {
    prop::collection::vec((0u8..16, arb_tag()), 0..24)
}

fn build(entries: &[(u8, PhaseTag)]) -> CandidateSet {
    entries
        .iter()
        .map(|(id, tag)| (EntityKey::new("032", "03217", format!("e{id}")), *tag))
        .collect()
}

fn arb_mode() -> impl Strategy<Value = PhaseMode> {
    prop_oneof![
        Just(PhaseMode::Unscoped),
        Just(PhaseMode::PhaseOnly(Phase::One)),
        Just(PhaseMode::PhaseOnly(Phase::Two)),
        (1_690_000_000i64..1_720_000_000, 0i64..10_000_000)
            .prop_map(|(lo, width)| PhaseMode::DateRange { lo, hi: lo + width }),
    ]
}

fn arb_node() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(1_690_000_000i64..1_720_000_000, 0u32..100, 0..6).prop_map(
        |records| {
            let map: Map<String, Value> = records
                .into_iter()
                .map(|(ts, v)| (ts.to_string(), Value::from(v)))
                .collect();
            Value::Object(map)
        },
    )
}

proptest! {
    #[test]
    fn join_and_meet_are_commutative_and_associative(
        a in arb_tag(),
        b in arb_tag(),
        c in arb_tag(),
    ) {
        prop_assert_eq!(a.join(b), b.join(a));
        prop_assert_eq!(a.meet(b), b.meet(a));
        prop_assert_eq!(a.join(b).join(c), a.join(b.join(c)));
        let left = a.meet(b).and_then(|ab| ab.meet(c));
        let right = b.meet(c).and_then(|bc| a.meet(bc));
        prop_assert_eq!(left, right);
        prop_assert_eq!(PhaseTag::All.meet(a), Some(a));
        prop_assert_eq!(PhaseTag::All.join(a), PhaseTag::All);
    }

    #[test]
    fn intersection_keeps_only_shared_entities(left in arb_set(), right in arb_set()) {
        let (s1, s2) = (build(&left), build(&right));
        let out = s1.clone().intersect(s2.clone());
        for (key, tag) in out.iter() {
            let (a, b) = (s1.get(key), s2.get(key));
            prop_assert!(a.is_some() && b.is_some());
            prop_assert_eq!(a.and_then(|a| b.and_then(|b| a.meet(b))), Some(tag));
        }
        for (key, a) in s1.iter() {
            if let Some(b) = s2.get(key) {
                prop_assert_eq!(out.contains(key), a.meet(b).is_some());
            }
        }
    }

    #[test]
    fn union_joins_tags_entity_wise(left in arb_set(), right in arb_set()) {
        let (s1, s2) = (build(&left), build(&right));
        let out = s1.clone().union(s2.clone());
        for (key, tag) in out.iter() {
            let expected = match (s1.get(key), s2.get(key)) {
                (Some(a), Some(b)) => a.join(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => unreachable!("entity from neither side"),
            };
            prop_assert_eq!(tag, expected);
        }
        prop_assert!(s1.iter().all(|(key, _)| out.contains(key)));
        prop_assert!(s2.iter().all(|(key, _)| out.contains(key)));
    }

    #[test]
    fn set_operations_commute(left in arb_set(), right in arb_set()) {
        let (s1, s2) = (build(&left), build(&right));
        prop_assert_eq!(
            s1.clone().union(s2.clone()).into_sorted_vec(),
            s2.clone().union(s1.clone()).into_sorted_vec()
        );
        prop_assert_eq!(
            s1.clone().intersect(s2.clone()).into_sorted_vec(),
            s2.intersect(s1).into_sorted_vec()
        );
    }

    #[test]
    fn projection_is_idempotent(raw in arb_node(), mode in arb_mode()) {
        let cutoff = PhaseCutoff::default();
        let once = project(&raw, mode, &cutoff);
        let twice = project(&once.to_raw(), mode, &cutoff);
        prop_assert_eq!(once.records, twice.records);
    }
}
