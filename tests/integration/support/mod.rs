#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cohort::coordinator::{Coordinator, CoordinatorOptions, QueryEvent};
use cohort::query::QueryRequest;
use cohort::schema::FieldSchema;
use cohort::store::{MemoryStore, RemoteStore};
use serde_json::{json, Value};

/// Before the default cutoff.
pub const P1: &str = "1700000000";
/// Also before the default cutoff.
pub const P1_EARLY: &str = "1690000000";
/// After the default cutoff.
pub const P2: &str = "1710000000";

pub fn selector(field: &str, operator: &str, value: Value, target: &str) -> Value {
    json!({
        "type": "selector",
        "field": field,
        "operator": operator,
        "value": value,
        "targetNode": target,
    })
}

pub fn general(field: &str, value: Value) -> Value {
    selector(field, "=", value, "general")
}

pub fn choice(value: &str) -> Value {
    json!({ "type": "choice", "value": value })
}

pub fn request(tokens: Vec<Value>) -> QueryRequest {
    serde_json::from_value(json!({ "expression": tokens })).expect("valid request")
}

pub fn request_json(tokens: Vec<Value>) -> Value {
    json!({ "expression": tokens, "expressionString": "" })
}

/// `Age > 45 AND Village = 03217`.
pub fn age_in_village() -> Vec<Value> {
    vec![
        selector("Age", ">", json!("45"), "patients1"),
        choice("AND"),
        general("Village", json!("03217")),
    ]
}

/// Two villages in region `032`:
///
/// * `e1` (50, 03217): smoker in phase 1, quit smoking in phase 2; systolic
///   BP of 150 in phase 2.
/// * `e2` (30, 03217): phase 2 data only.
/// * `e3` (60, 03218): non-smoker in both phases.
/// * `e4` (41, 03218): `Form_1` records only before the cutoff.
pub fn fixture() -> Value {
    json!({
        "patients1": {
            "032": {
                "03217": {
                    "e1": { "age": 50, "gender": "m" },
                    "e2": { "age": 30, "gender": "f" }
                },
                "03218": {
                    "e3": { "age": "60", "gender": "m" },
                    "e4": { "age": 41, "gender": "f" }
                }
            }
        },
        "Form_1": {
            "032": {
                "03217": {
                    "e1": {
                        P1: { "habits": { "smoking": "y" } },
                        P2: { "habits": { "smoking": "n" } }
                    },
                    "e2": { P2: { "habits": { "smoking": "y" } } }
                },
                "03218": {
                    "e3": {
                        P1: { "habits": { "smoking": "n" } },
                        P2: { "habits": { "smoking": "n" } }
                    },
                    "e4": {
                        P1_EARLY: { "habits": { "smoking": "q" } },
                        P1: { "habits": { "smoking": "y" } }
                    }
                }
            }
        },
        "manual_vital_data": {
            "032": { "03217": { "e1": { P2: { "bp": { "systolic": 150 } } } } }
        }
    })
}

/// `count` entities in village `03217`, all aged 50 with a phase 1 record.
pub fn wide_fixture(count: usize) -> Value {
    let mut patients = serde_json::Map::new();
    let mut form1 = serde_json::Map::new();
    for i in 0..count {
        let id = format!("w{i:03}");
        patients.insert(id.clone(), json!({ "age": 50 }));
        form1.insert(id, json!({ P1: { "habits": { "smoking": "y" } } }));
    }
    json!({
        "patients1": { "032": { "03217": patients } },
        "Form_1": { "032": { "03217": form1 } }
    })
}

pub fn options() -> CoordinatorOptions {
    CoordinatorOptions {
        query_timeout: Duration::from_secs(10),
        ..CoordinatorOptions::default()
    }
}

pub fn coordinator(store: Arc<MemoryStore>, options: CoordinatorOptions) -> Arc<Coordinator> {
    let schema = FieldSchema::builtin().expect("builtin schema");
    let store: Arc<dyn RemoteStore> = store;
    Arc::new(Coordinator::new(store, Arc::new(schema), options))
}

/// Plans and streams `request`, collecting every frame.
pub async fn run(coordinator: &Arc<Coordinator>, request: &QueryRequest) -> Vec<QueryEvent> {
    let plan = coordinator.prepare(request).expect("query plans");
    let mut stream = coordinator.stream(plan);
    let mut frames = Vec::new();
    while let Some(frame) = stream.events.recv().await {
        frames.push(frame);
    }
    frames
}

/// `(id, phase)` pairs of the terminal data frame.
pub fn matched(frames: &[QueryEvent]) -> Vec<(String, String)> {
    match frames.last() {
        Some(QueryEvent::Data { data }) => data
            .iter()
            .map(|profile| (profile.key.id.clone(), profile.phase.to_string()))
            .collect(),
        other => panic!("expected a data frame, got {other:?}"),
    }
}
