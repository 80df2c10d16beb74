//! Query parsing, analysis, planning and evaluation.
//!
//! A request flows through these stages in order: the client token list
//! ([`token`]) is parsed into an expression tree ([`parser`], [`ast`]),
//! resolved against the field schema ([`analyze`]), planned ([`planner`]) and
//! finally evaluated over fetched snapshots ([`evaluator`]) into a
//! phase-tagged [`candidates::CandidateSet`].

/// Expression tree produced by the parser.
pub mod ast;

/// Semantic analysis: leaf resolution and client-error detection.
pub mod analyze;

/// Phase-tagged candidate sets.
pub mod candidates;

/// Client errors.
pub mod errors;

/// Tree-walking evaluator.
pub mod evaluator;

/// Operator-precedence parser and top-level group splitting.
pub mod parser;

/// Required categories, scan order and strategy selection.
pub mod planner;

/// Performance profiling for query operations.
///
/// Collects timing and count statistics to identify performance bottlenecks.
pub mod profile;

/// Scope descriptors for general selectors.
pub mod scope;

/// Inbound request and token model.
pub mod token;

pub use analyze::AnalyzedQuery;
pub use candidates::{Candidate, CandidateSet};
pub use errors::QueryError;
pub use planner::{explain, PlanExplain, Planner, PlannerConfig, QueryPlan, Strategy};
pub use token::{QueryRequest, Token};
