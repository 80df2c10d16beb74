//! HTTP surface: `POST /query` streams NDJSON frames.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{EngineConfig, ServerSection};
use crate::coordinator::{CancelFlag, Coordinator, QueryStream};
use crate::error::CohortError;
use crate::model::NodeCategory;
use crate::query::{QueryError, QueryRequest};
use crate::schema::{ComparatorKind, CoverageFamily, MatchPolicy};

const NDJSON: &str = "application/x-ndjson";

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Store, schema or config setup failed.
    #[error(transparent)]
    Startup(#[from] CohortError),
    /// `server.bind` is not a socket address.
    #[error("invalid bind address '{addr}': {source}")]
    Addr {
        /// Configured value.
        addr: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },
    /// Binding or serving failed.
    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

type AppState = Arc<ServerState>;

struct ServerState {
    coordinator: Arc<Coordinator>,
}

/// Starts the server and runs until ctrl-c.
pub async fn serve(config: EngineConfig) -> Result<(), ServerError> {
    install_tracing_subscriber();

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .map_err(|source| ServerError::Addr {
            addr: config.server.bind.clone(),
            source,
        })?;
    let coordinator = Arc::new(Coordinator::from_config(&config)?);
    let app = build_router(Arc::clone(&coordinator), &config.server);
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(
        %addr,
        store = %coordinator.store().describe(),
        allow_origins = ?config.server.allow_origins,
        "cohort listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Router with every endpoint, CORS and request tracing.
pub fn build_router(coordinator: Arc<Coordinator>, server: &ServerSection) -> Router {
    let state = Arc::new(ServerState { coordinator });
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/fields", get(fields_handler))
        .route("/query", post(query_handler));

    if let Some(layer) = build_cors_layer(&server.allow_origins) {
        router = router.layer(layer);
    }

    router.with_state(state).layer(TraceLayer::new_for_http())
}

fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            let trimmed = origin.trim().trim_end_matches('/');
            match HeaderValue::from_str(trimmed) {
                Ok(value) if !trimmed.is_empty() => Some(value),
                _ => {
                    tracing::warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([ACCEPT, CONTENT_TYPE]),
    )
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.coordinator.store().describe(),
    })
}

async fn fields_handler(State(state): State<AppState>) -> Json<FieldListResponse> {
    let fields = state
        .coordinator
        .schema()
        .fields()
        .into_iter()
        .map(|def| FieldEntry {
            label: def.label.clone(),
            node: def.node,
            kind: def.kind,
            policy: (def.kind == ComparatorKind::Multiset).then_some(def.policy),
            family: def.family,
            values: def.values.keys().cloned().collect(),
        })
        .collect();
    Json(FieldListResponse { fields })
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let plan = state.coordinator.prepare(&request).map_err(|err| {
        tracing::info!(code = err.code(), error = %err, "query rejected");
        err
    })?;
    let stream = state.coordinator.stream(plan);
    Ok(ndjson_response(stream))
}

/// Cancels the query when the response body is dropped.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn ndjson_response(query: QueryStream) -> Response {
    let guard = CancelOnDrop(query.cancel);
    let frames = stream::unfold((query.events, guard), |(mut events, guard)| async move {
        let event = events.recv().await?;
        Some((event.to_ndjson(), (events, guard)))
    });
    ([(CONTENT_TYPE, NDJSON)], Body::from_stream(frames)).into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: String,
}

#[derive(Debug, Serialize)]
struct FieldListResponse {
    fields: Vec<FieldEntry>,
}

#[derive(Debug, Serialize)]
struct FieldEntry {
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<NodeCategory>,
    kind: ComparatorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy: Option<MatchPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    family: Option<CoverageFamily>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    values: Vec<String>,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let AppError::Query(err) = &self;
        let body = Json(ErrorPayload {
            code: err.code(),
            message: err.to_string(),
        });
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(?err, "failed to listen for shutdown signal"),
    }
}

/// Installs the `fmt` subscriber once, honouring `RUST_LOG` (default `info`).
pub fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_skips_invalid_origins() {
        assert!(build_cors_layer(&[]).is_none());
        assert!(build_cors_layer(&["  ".into(), "/".into()]).is_none());
        assert!(build_cors_layer(&["https://dash.example.org/".into()]).is_some());
    }

    #[test]
    fn client_errors_map_to_bad_request() {
        let response = AppError::Query(QueryError::Empty).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
