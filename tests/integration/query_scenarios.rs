#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use cohort::coordinator::QueryEvent;
use cohort::query::QueryError;
use cohort::store::MemoryStore;
use cohort::NodeCategory;
use serde_json::json;
use support::*;

fn engine() -> Arc<cohort::Coordinator> {
    coordinator(Arc::new(MemoryStore::from_value(fixture())), options())
}

#[tokio::test]
async fn age_and_village_returns_only_resident_over_45() {
    let coordinator = engine();
    let frames = run(&coordinator, &request(age_in_village())).await;
    assert_eq!(matched(&frames), vec![("e1".to_owned(), "all".to_owned())]);

    let Some(QueryEvent::Data { data }) = frames.last() else {
        panic!("missing data frame");
    };
    let profile = &data[0];
    assert_eq!(profile.key.subregion, "03217");
    assert_eq!(profile.nodes[&NodeCategory::Patients]["age"], json!(50));
    assert_eq!(
        profile.nodes[&NodeCategory::Form1],
        json!({ P1: { "habits": { "smoking": "y" } }, P2: { "habits": { "smoking": "n" } } })
    );
    assert_eq!(
        profile.nodes[&NodeCategory::ManualVitals],
        json!({ P2: { "bp": { "systolic": 150 } } })
    );
    assert_eq!(profile.nodes[&NodeCategory::TccForm], json!(null));
}

#[tokio::test]
async fn or_of_villages_unions_residents() {
    let coordinator = engine();
    let tokens = vec![
        general("Village", json!("03217")),
        choice("OR"),
        general("Village", json!("03218")),
    ];
    let ids: Vec<_> = matched(&run(&coordinator, &request(tokens)).await)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, vec!["e1", "e2", "e3", "e4"]);
}

#[tokio::test]
async fn coverage_status_tracks_phase_existence() {
    let coordinator = engine();
    let coverage = |value: &str| {
        request(vec![selector(
            "Survey Coverage Status",
            "=",
            json!(value),
            "Form_1",
        )])
    };

    let covered1 = matched(&run(&coordinator, &coverage("Covered in Phase 1")).await);
    assert!(covered1.contains(&("e4".to_owned(), "all".to_owned())));
    assert!(!covered1.iter().any(|(id, _)| id == "e2"));

    let not_covered2 = matched(&run(&coordinator, &coverage("Not Covered in Phase 2")).await);
    assert_eq!(not_covered2, vec![("e4".to_owned(), "all".to_owned())]);

    let covered2 = matched(&run(&coordinator, &coverage("Covered in Phase 2")).await);
    assert!(!covered2.iter().any(|(id, _)| id == "e4"));
    assert_eq!(covered2.len(), 3);
}

#[tokio::test]
async fn phase_scope_projects_only_that_phase() {
    let coordinator = engine();
    let tokens = vec![
        general("Phase", json!("Phase 2")),
        choice("AND"),
        selector("Smoking", "=", json!("No"), "Form_1"),
    ];
    let frames = run(&coordinator, &request(tokens)).await;
    assert_eq!(
        matched(&frames),
        vec![
            ("e1".to_owned(), "2".to_owned()),
            ("e3".to_owned(), "2".to_owned())
        ]
    );
    let Some(QueryEvent::Data { data }) = frames.last() else {
        panic!("missing data frame");
    };
    assert_eq!(
        data[0].nodes[&NodeCategory::Form1],
        json!({ P2: { "habits": { "smoking": "n" } } })
    );
}

#[tokio::test]
async fn date_scope_within_one_phase_projects_the_requested_range() {
    let coordinator = engine();
    let tokens = vec![general(
        "Date",
        json!({ "from": "2023-07-01", "to": "2023-07-31" }),
    )];
    let frames = run(&coordinator, &request(tokens)).await;
    assert_eq!(matched(&frames), vec![("e4".to_owned(), "1".to_owned())]);
    let Some(QueryEvent::Data { data }) = frames.last() else {
        panic!("missing data frame");
    };
    assert_eq!(
        data[0].nodes[&NodeCategory::Form1],
        json!({ P1_EARLY: { "habits": { "smoking": "q" } } })
    );
}

#[tokio::test]
async fn record_leaves_matching_in_different_phases_intersect() {
    let coordinator = engine();
    let tokens = vec![
        selector("Smoking", "=", json!("Yes"), "Form_1"),
        choice("AND"),
        selector("Systolic BP", ">", json!("140"), "manual_vital_data"),
    ];
    let frames = run(&coordinator, &request(tokens)).await;
    assert_eq!(matched(&frames), vec![("e1".to_owned(), "all".to_owned())]);
}

#[tokio::test]
async fn unmatched_open_paren_is_a_client_error() {
    let coordinator = engine();
    let mut tokens = vec![choice("(")];
    tokens.extend(age_in_village());
    let err = coordinator.prepare(&request(tokens)).unwrap_err();
    assert!(matches!(err, QueryError::Structural { .. }));
    assert_eq!(err.code(), "MalformedExpression");
    assert!(err.to_string().contains("unmatched"));
}

#[tokio::test]
async fn rejected_requests_never_touch_the_store() {
    let store = Arc::new(MemoryStore::from_value(fixture()));
    let coordinator = coordinator(Arc::clone(&store), options());

    assert!(matches!(
        coordinator.prepare(&request(vec![])),
        Err(QueryError::Empty)
    ));
    let conflict = vec![
        general("Date", json!({ "from": "2023-11-01", "to": "2023-11-30" })),
        choice("AND"),
        general("Phase", json!("Phase 2")),
    ];
    assert_eq!(
        coordinator.prepare(&request(conflict)).unwrap_err().code(),
        "ScopeConflict"
    );
    let backwards = vec![general(
        "Date",
        json!({ "from": "2024-02-01", "to": "2024-01-01" }),
    )];
    assert_eq!(
        coordinator.prepare(&request(backwards)).unwrap_err().code(),
        "InvalidSelector"
    );
    assert_eq!(store.requests(), 0);
}

#[tokio::test]
async fn unknown_fields_and_malformed_entities_match_nothing() {
    let mut data = fixture();
    data["patients1"]["032"]["03217"]["bad"] = json!("not an object");
    let coordinator = coordinator(Arc::new(MemoryStore::from_value(data)), options());

    let unknown = vec![selector("Shoe Size", "=", json!("9"), "patients1")];
    assert!(matched(&run(&coordinator, &request(unknown)).await).is_empty());

    let all_ages = vec![selector("Age", ">=", json!(0), "patients1")];
    let ids: Vec<_> = matched(&run(&coordinator, &request(all_ages)).await)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, vec!["e1", "e2", "e3", "e4"]);
}
