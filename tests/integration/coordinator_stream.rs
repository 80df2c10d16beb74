#![allow(missing_docs)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use cohort::coordinator::{CoordinatorOptions, QueryEvent};
use cohort::store::MemoryStore;
use cohort::NodeCategory;
use serde_json::json;
use support::*;

fn error_status(frames: &[QueryEvent]) -> Option<u16> {
    match frames.last() {
        Some(QueryEvent::Error { error }) => Some(error.status),
        _ => None,
    }
}

#[tokio::test]
async fn frames_report_fetches_then_progress_then_data() {
    let coordinator = coordinator(Arc::new(MemoryStore::from_value(fixture())), options());
    let frames = run(&coordinator, &request(age_in_village())).await;

    let fetched: Vec<_> = frames
        .iter()
        .filter_map(|frame| match frame {
            QueryEvent::Fetching { fetching } => Some(*fetching),
            _ => None,
        })
        .collect();
    assert_eq!(fetched.len(), 2);
    assert!(fetched.contains(&NodeCategory::Patients));
    assert!(fetched.contains(&NodeCategory::Form1));

    let first_progress = frames
        .iter()
        .position(|frame| matches!(frame, QueryEvent::Processed { .. }))
        .expect("progress frame");
    assert!(frames[..first_progress]
        .iter()
        .all(|frame| matches!(frame, QueryEvent::Fetching { .. })));
    assert!(matches!(frames.last(), Some(QueryEvent::Data { .. })));
    assert_eq!(
        frames.iter().filter(|frame| frame.is_terminal()).count(),
        1
    );
}

#[tokio::test]
async fn detail_fetches_are_bounded_by_batch_size() {
    let store = Arc::new(
        MemoryStore::from_value(wide_fixture(20)).with_latency(Duration::from_millis(2)),
    );
    let options = CoordinatorOptions {
        batch_size: 4,
        ..options()
    };
    let coordinator = coordinator(Arc::clone(&store), options);
    let tokens = vec![selector("Age", ">", json!(45), "patients1")];
    let frames = run(&coordinator, &request(tokens)).await;

    let processed: Vec<_> = frames
        .iter()
        .filter_map(|frame| match frame {
            QueryEvent::Processed { processed } => Some(*processed),
            _ => None,
        })
        .collect();
    assert_eq!(processed, (1..=20).collect::<Vec<_>>());
    assert_eq!(matched(&frames).len(), 20);
    assert!(store.peak_in_flight() <= 4, "peak {}", store.peak_in_flight());
    // one snapshot plus four detail categories per entity
    assert_eq!(store.requests(), 1 + 20 * 4);
}

#[tokio::test]
async fn failed_entity_fetch_becomes_null() {
    let store = Arc::new(
        MemoryStore::from_value(fixture()).with_failure("manual_vital_data/032/03217/e1"),
    );
    let coordinator = coordinator(store, options());
    let frames = run(&coordinator, &request(age_in_village())).await;
    let Some(QueryEvent::Data { data }) = frames.last() else {
        panic!("expected data, got {:?}", frames.last());
    };
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].nodes[&NodeCategory::ManualVitals], json!(null));
    assert_eq!(data[0].nodes[&NodeCategory::Patients]["age"], json!(50));
}

#[tokio::test]
async fn failed_category_fetch_is_fatal() {
    let store = Arc::new(MemoryStore::from_value(fixture()).with_failure("patients1"));
    let coordinator = coordinator(store, options());
    let frames = run(&coordinator, &request(age_in_village())).await;
    assert_eq!(error_status(&frames), Some(502));
    assert!(!frames
        .iter()
        .any(|frame| matches!(frame, QueryEvent::Data { .. })));
}

#[tokio::test]
async fn slow_queries_time_out() {
    let store = Arc::new(
        MemoryStore::from_value(fixture()).with_latency(Duration::from_millis(500)),
    );
    let options = CoordinatorOptions {
        query_timeout: Duration::from_millis(50),
        ..options()
    };
    let coordinator = coordinator(store, options);
    let frames = run(&coordinator, &request(age_in_village())).await;
    assert_eq!(error_status(&frames), Some(504));
}

#[tokio::test]
async fn cancelled_queries_stop_without_a_terminal_frame() {
    let store = Arc::new(
        MemoryStore::from_value(wide_fixture(40)).with_latency(Duration::from_millis(20)),
    );
    let options = CoordinatorOptions {
        batch_size: 4,
        ..options()
    };
    let coordinator = coordinator(Arc::clone(&store), options);
    let tokens = vec![selector("Age", ">", json!(45), "patients1")];
    let plan = coordinator.prepare(&request(tokens)).expect("plan");
    let mut stream = coordinator.stream(plan);

    let first = stream.events.recv().await.expect("first frame");
    assert!(matches!(first, QueryEvent::Fetching { .. }));
    stream.cancel.cancel();

    let mut rest = Vec::new();
    while let Some(frame) = stream.events.recv().await {
        rest.push(frame);
    }
    assert!(rest.iter().all(|frame| !frame.is_terminal()));
    assert!(store.requests() < 1 + 40 * 4);
}

#[tokio::test]
async fn grouped_phase_intersection_reports_mode_and_groups() {
    let coordinator = coordinator(Arc::new(MemoryStore::from_value(fixture())), options());
    let tokens = vec![
        choice("("),
        general("Phase", json!("Phase 1")),
        choice("AND"),
        selector("Smoking", "=", json!("Yes"), "Form_1"),
        choice(")"),
        choice("AND"),
        choice("("),
        general("Phase", json!("Phase 2")),
        choice("AND"),
        selector("Smoking", "=", json!("No"), "Form_1"),
        choice(")"),
    ];
    let plan = coordinator.prepare(&request(tokens.clone())).expect("plan");
    assert_eq!(plan.strategy.name(), "grouped-intersection");

    let frames = run(&coordinator, &request(tokens)).await;
    assert!(frames.contains(&QueryEvent::Mode {
        mode: "grouped-intersection".into(),
        groups: 2,
    }));
    let groups: Vec<_> = frames
        .iter()
        .filter_map(|frame| match frame {
            QueryEvent::Group { group, .. } => Some(*group),
            _ => None,
        })
        .collect();
    assert_eq!(groups, vec![1, 2]);
    assert_eq!(matched(&frames), vec![("e1".to_owned(), "all".to_owned())]);
}
