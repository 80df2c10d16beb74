//! Crate-level error type and its HTTP status mapping.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::query::errors::QueryError;
use crate::schema::SchemaError;
use crate::store::StoreError;

/// Result alias used by the engine's fallible entry points.
pub type Result<T> = std::result::Result<T, CohortError>;

/// Top-level error surfaced by query execution and startup.
#[derive(Debug, Error)]
pub enum CohortError {
    /// The request was rejected before any fetch work started.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A category-level round trip against the remote store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The field schema asset could not be loaded.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// The configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The query did not finish within the configured deadline.
    #[error("query exceeded the {}ms deadline", .0.as_millis())]
    Timeout(Duration),
    /// The caller went away or cancelled the query.
    #[error("query cancelled")]
    Cancelled,
}

impl CohortError {
    /// HTTP status equivalent used for error frames and responses.
    pub fn http_status(&self) -> u16 {
        match self {
            CohortError::Query(_) => 400,
            CohortError::Cancelled => 499,
            CohortError::Timeout(_) => 504,
            CohortError::Store(_) => 502,
            CohortError::Schema(_) | CohortError::Config(_) => 500,
        }
    }

    /// Whether the failure was caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, CohortError::Query(_))
    }
}
