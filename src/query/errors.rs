use std::fmt;

use thiserror::Error;

use crate::query::parser::StructuralIssue;

/// Client errors raised while preparing a query.
///
/// Every variant is detected before any store round-trip, so callers can map
/// the whole enum to a 4xx response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The request carried no selector tokens.
    #[error("query requires at least one selector")]
    Empty,
    /// The token stream exceeds the configured budget.
    #[error("expression exceeds {max} tokens (got {count})")]
    TooManyTokens {
        /// Tokens supplied.
        count: usize,
        /// Maximum accepted.
        max: usize,
    },
    /// The token stream is structurally malformed.
    #[error("malformed expression: {}", IssueList(.issues))]
    Structural {
        /// Every defect the parser reported.
        issues: Vec<StructuralIssue>,
    },
    /// No expression could be built from the token stream.
    #[error("expression could not be parsed")]
    Unparseable,
    /// A selector's value cannot be interpreted.
    #[error("invalid selector '{label}': {reason}")]
    InvalidSelector {
        /// Display label of the selector.
        label: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Two scope selectors cannot be combined in one query.
    #[error("'{first}' cannot be combined with '{second}'")]
    ScopeConflict {
        /// Label of the first conflicting selector.
        first: String,
        /// Label of the second conflicting selector.
        second: String,
    },
}

impl QueryError {
    /// Builds an [`QueryError::InvalidSelector`].
    pub fn invalid(label: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::InvalidSelector {
            label: label.into(),
            reason: reason.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Empty => "EmptyQuery",
            QueryError::TooManyTokens { .. } => "TooManyTokens",
            QueryError::Structural { .. } => "MalformedExpression",
            QueryError::Unparseable => "MalformedExpression",
            QueryError::InvalidSelector { .. } => "InvalidSelector",
            QueryError::ScopeConflict { .. } => "ScopeConflict",
        }
    }
}

/// Convenience wrapper that formats query errors with their codes.
pub struct QueryErrorWithCode<'a>(pub &'a QueryError);

impl fmt::Display for QueryErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

struct IssueList<'a>(&'a [StructuralIssue]);

impl fmt::Display for IssueList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            issue.fmt(f)?;
        }
        Ok(())
    }
}
