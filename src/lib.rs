//! Cohort query engine.
//!
//! Evaluates boolean expressions of field selectors over a hierarchical,
//! read-only survey store where every entity's records are versioned by
//! timestamp and split into two collection phases. Matching entities are
//! returned as phase-filtered profiles, streamed as NDJSON frames.
//!
//! The usual entry point is [`coordinator::Coordinator`]: build it from an
//! [`config::EngineConfig`], [`prepare`](coordinator::Coordinator::prepare)
//! a [`query::QueryRequest`] and [`stream`](coordinator::Coordinator::stream)
//! the resulting plan.

#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod query;
pub mod schema;
pub mod server;
pub mod store;
pub mod temporal;

pub use config::EngineConfig;
pub use coordinator::{Coordinator, CoordinatorOptions, EntityProfile, QueryEvent};
pub use error::{CohortError, Result};
pub use model::{EntityKey, NodeCategory, Phase, PhaseTag};
pub use query::QueryRequest;
