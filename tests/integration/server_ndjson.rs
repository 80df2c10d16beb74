#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
use cohort::config::ServerSection;
use cohort::server::build_router;
use cohort::store::MemoryStore;
use serde_json::{json, Value};
use support::*;
use tower::ServiceExt;

fn router() -> axum::Router {
    let coordinator = coordinator(Arc::new(MemoryStore::from_value(fixture())), options());
    build_router(coordinator, &ServerSection::default())
}

fn post_query(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/query")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn query_streams_ndjson_frames() {
    let response = router()
        .oneshot(post_query(&request_json(age_in_village())))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "application/x-ndjson"
    );

    let text = body_text(response).await;
    let frames: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert!(text.ends_with('\n'));
    assert!(frames[0].get("fetching").is_some());
    let last = frames.last().expect("frames");
    assert_eq!(last["data"][0]["id"], json!("e1"));
    assert_eq!(last["data"][0]["phase"], json!("all"));
    assert_eq!(last["data"][0]["nodes"]["patients1"]["age"], json!(50));
}

#[tokio::test]
async fn malformed_query_is_rejected_before_streaming() {
    let mut tokens = age_in_village();
    tokens.push(choice(")"));
    let response = router()
        .oneshot(post_query(&request_json(tokens)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(payload["code"], json!("MalformedExpression"));
}

#[tokio::test]
async fn fields_lists_schema_labels() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/fields")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    let fields = payload["fields"].as_array().expect("field list");
    let age = fields
        .iter()
        .find(|field| field["label"] == json!("Age"))
        .expect("Age field");
    assert_eq!(age["node"], json!("patients1"));
    assert_eq!(age["kind"], json!("numeric"));
    let coverage = fields
        .iter()
        .find(|field| field["label"] == json!("Survey Coverage Status"))
        .expect("coverage field");
    assert_eq!(coverage["family"], json!("survey"));
}

#[tokio::test]
async fn health_reports_store() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(payload, json!({ "status": "ok", "store": "memory" }));
}
