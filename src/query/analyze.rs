//! Semantic analysis of a parsed token stream.
//!
//! Analysis resolves every leaf against the field schema, turns general
//! selectors into [`GeneralScope`]s and rejects client errors (structural
//! defects, bad selector values, conflicting scopes) before any store work
//! begins. The resulting [`AnalyzedQuery`] is all the planner and evaluator
//! need; neither performs schema lookups of its own.

use std::collections::BTreeMap;

use crate::model::{NodeCategory, Phase};
use crate::query::ast::Expr;
use crate::query::errors::QueryError;
use crate::query::parser::parse;
use crate::query::scope::GeneralScope;
use crate::query::token::{render_tokens, Selector, Token};
use crate::schema::predicate::CoverageState;
use crate::schema::{ComparatorKind, CoverageFamily, FieldDef, FieldSchema};

/// Maximum number of tokens accepted in one expression.
pub const MAX_EXPRESSION_TOKENS: usize = 4_096;

/// Convenience alias for analyzer results.
pub type AnalyzeResult<T> = std::result::Result<T, QueryError>;

/// What a leaf tests once resolved.
#[derive(Clone, Debug)]
pub enum LeafKind {
    /// General selector.
    Scope(GeneralScope),
    /// Predicate over records of one category.
    Record {
        /// Schema entry.
        field: FieldDef,
        /// Category scanned.
        category: NodeCategory,
    },
    /// Coverage status over a family of categories.
    Coverage {
        /// Family whose coverage is tested.
        family: CoverageFamily,
        /// Requested state.
        state: CoverageState,
    },
    /// The schema has no entry for the field; the leaf matches nothing.
    Unresolved {
        /// Category named by the selector.
        category: NodeCategory,
    },
}

/// A selector paired with its resolution.
#[derive(Clone, Debug)]
pub struct ResolvedLeaf {
    /// Position of the selector in the token list.
    pub index: usize,
    /// The selector as sent.
    pub selector: Selector,
    /// Resolution.
    pub kind: LeafKind,
}

impl ResolvedLeaf {
    /// Category the leaf scans, if it tests records.
    pub fn category(&self) -> Option<NodeCategory> {
        match &self.kind {
            LeafKind::Record { category, .. } | LeafKind::Unresolved { category } => {
                Some(*category)
            }
            LeafKind::Scope(_) | LeafKind::Coverage { .. } => None,
        }
    }

    /// Explicit phase the leaf pins the query to, if any.
    pub fn explicit_phase(&self) -> Option<Phase> {
        match &self.kind {
            LeafKind::Scope(GeneralScope::Phase(phase)) => Some(*phase),
            LeafKind::Coverage { state, .. } if state.covered => Some(state.phase),
            _ => None,
        }
    }
}

/// Fully analyzed query ready for planning.
#[derive(Clone, Debug)]
pub struct AnalyzedQuery {
    /// Token list the query was built from.
    pub tokens: Vec<Token>,
    /// Expression tree.
    pub expr: Expr,
    /// Resolved leaves keyed by token position.
    pub leaves: BTreeMap<usize, ResolvedLeaf>,
    /// Human-readable rendering.
    pub display: String,
}

impl AnalyzedQuery {
    /// Resolved leaf at token position `index`.
    pub fn leaf(&self, index: usize) -> Option<&ResolvedLeaf> {
        self.leaves.get(&index)
    }

    /// The date range of the first date selector, if any.
    pub fn date_scope(&self) -> Option<(i64, i64)> {
        self.leaves.values().find_map(|leaf| match leaf.kind {
            LeafKind::Scope(GeneralScope::DateRange { lo, hi }) => Some((lo, hi)),
            _ => None,
        })
    }

    /// Distinct explicit phases named by the query.
    pub fn explicit_phases(&self) -> Vec<Phase> {
        let mut phases: Vec<_> = self
            .leaves
            .values()
            .filter_map(ResolvedLeaf::explicit_phase)
            .collect();
        phases.sort();
        phases.dedup();
        phases
    }

    /// Whether any general or coverage selector appears.
    pub fn has_scope_or_coverage(&self) -> bool {
        self.leaves.values().any(|leaf| {
            matches!(
                leaf.kind,
                LeafKind::Scope(_) | LeafKind::Coverage { .. }
            )
        })
    }
}

/// Parses and analyzes a token stream.
///
/// `display` falls back to a rendering of the tokens when empty.
pub fn analyze(tokens: &[Token], display: &str, schema: &FieldSchema) -> AnalyzeResult<AnalyzedQuery> {
    if tokens.len() > MAX_EXPRESSION_TOKENS {
        return Err(QueryError::TooManyTokens {
            count: tokens.len(),
            max: MAX_EXPRESSION_TOKENS,
        });
    }
    if !tokens.iter().any(|token| token.as_selector().is_some()) {
        return Err(QueryError::Empty);
    }
    let outcome = parse(tokens);
    if !outcome.is_clean() {
        return Err(QueryError::Structural {
            issues: outcome.issues,
        });
    }
    let expr = outcome.expr.ok_or(QueryError::Unparseable)?;

    let mut leaves = BTreeMap::new();
    for leaf in expr.leaves() {
        let Some(selector) = tokens.get(leaf.index).and_then(Token::as_selector) else {
            return Err(QueryError::Unparseable);
        };
        let kind = resolve(selector, schema)?;
        leaves.insert(
            leaf.index,
            ResolvedLeaf {
                index: leaf.index,
                selector: selector.clone(),
                kind,
            },
        );
    }
    check_conflicts(&leaves)?;

    let display = if display.trim().is_empty() {
        render_tokens(tokens)
    } else {
        display.trim().to_owned()
    };
    Ok(AnalyzedQuery {
        tokens: tokens.to_vec(),
        expr,
        leaves,
        display,
    })
}

fn resolve(selector: &Selector, schema: &FieldSchema) -> AnalyzeResult<LeafKind> {
    if selector.is_general() {
        return GeneralScope::from_selector(selector).map(LeafKind::Scope);
    }
    let Some(field) = schema.get(&selector.field) else {
        let category = selector
            .target_node
            .category()
            .ok_or_else(|| QueryError::invalid(selector.to_string(), "missing target node"))?;
        tracing::warn!(field = %selector.field, node = %category, "field not in schema; leaf matches nothing");
        return Ok(LeafKind::Unresolved { category });
    };
    match (field.kind, field.family) {
        (ComparatorKind::Coverage, Some(family)) => {
            let state = CoverageState::parse(&selector.value).ok_or_else(|| {
                QueryError::invalid(
                    selector.to_string(),
                    "expected 'Covered in Phase k' or 'Not Covered in Phase k'",
                )
            })?;
            Ok(LeafKind::Coverage { family, state })
        }
        _ => {
            let category = field
                .node
                .or(selector.target_node.category())
                .ok_or_else(|| QueryError::invalid(selector.to_string(), "field has no node"))?;
            if let Some(target) = selector.target_node.category() {
                if target != category {
                    tracing::debug!(
                        field = %field.label,
                        target = %target,
                        schema_node = %category,
                        "selector target differs from schema; using schema node"
                    );
                }
            }
            Ok(LeafKind::Record {
                field: field.clone(),
                category,
            })
        }
    }
}

/// A date range cannot be combined with another temporal selector: phase
/// scopes and coverage states both pin records to a phase, and the range
/// already decides which records are active.
fn check_conflicts(leaves: &BTreeMap<usize, ResolvedLeaf>) -> AnalyzeResult<()> {
    let Some(date) = leaves
        .values()
        .find(|leaf| matches!(leaf.kind, LeafKind::Scope(GeneralScope::DateRange { .. })))
    else {
        return Ok(());
    };
    let conflicting = leaves.values().find(|leaf| {
        matches!(
            leaf.kind,
            LeafKind::Scope(GeneralScope::Phase(_)) | LeafKind::Coverage { .. }
        )
    });
    match conflicting {
        Some(other) => Err(QueryError::ScopeConflict {
            first: date.selector.to_string(),
            second: other.selector.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::token::{ChoiceKind, Operator, TargetNode};
    use serde_json::{json, Value};

    fn schema() -> FieldSchema {
        FieldSchema::builtin().expect("builtin schema parses")
    }

    fn node(field: &str, op: Operator, value: Value, target: NodeCategory) -> Token {
        Token::Selector(Selector {
            label: String::new(),
            field: field.to_owned(),
            operator: op,
            value,
            target_node: TargetNode::Node(target),
        })
    }

    fn general(field: &str, value: Value) -> Token {
        Token::Selector(Selector {
            label: String::new(),
            field: field.to_owned(),
            operator: Operator::Eq,
            value,
            target_node: TargetNode::General,
        })
    }

    fn and() -> Token {
        Token::choice(ChoiceKind::And)
    }

    #[test]
    fn resolves_leaves_and_display() {
        let tokens = vec![
            node("Age", Operator::Gt, json!(45), NodeCategory::Patients),
            and(),
            general("Village", json!("03217")),
        ];
        let query = analyze(&tokens, "", &schema()).expect("analyzes");
        assert_eq!(query.display, "Age > 45 AND Village = 03217");
        assert!(matches!(
            query.leaf(0).unwrap().kind,
            LeafKind::Record {
                category: NodeCategory::Patients,
                ..
            }
        ));
        assert!(matches!(
            query.leaf(2).unwrap().kind,
            LeafKind::Scope(GeneralScope::Subregion(_))
        ));
        assert!(query.has_scope_or_coverage());
    }

    #[test]
    fn rejects_empty_and_malformed_streams() {
        assert_eq!(
            analyze(&[and()], "", &schema()).unwrap_err(),
            QueryError::Empty
        );
        let tokens = vec![
            Token::choice(ChoiceKind::Open),
            node("Age", Operator::Gt, json!(45), NodeCategory::Patients),
        ];
        let err = analyze(&tokens, "", &schema()).unwrap_err();
        assert_eq!(err.code(), "MalformedExpression");
    }

    #[test]
    fn unknown_fields_resolve_to_nothing() {
        let tokens = vec![node("Shoe Size", Operator::Eq, json!(9), NodeCategory::Form3)];
        let query = analyze(&tokens, "", &schema()).expect("analyzes");
        assert!(matches!(
            query.leaf(0).unwrap().kind,
            LeafKind::Unresolved {
                category: NodeCategory::Form3
            }
        ));
    }

    #[test]
    fn date_conflicts_with_coverage_and_phase() {
        let date = general("Date", json!({ "from": "2023-01-01", "to": "2023-06-30" }));
        let coverage = node(
            "Survey Coverage Status",
            Operator::Eq,
            json!("Covered in Phase 1"),
            NodeCategory::Form1,
        );
        let err = analyze(&[date.clone(), and(), coverage], "", &schema()).unwrap_err();
        assert_eq!(err.code(), "ScopeConflict");

        let phase = general("Phase", json!("Phase 2"));
        let err = analyze(&[phase, and(), date.clone()], "", &schema()).unwrap_err();
        assert_eq!(err.code(), "ScopeConflict");

        let age = node("Age", Operator::Gt, json!(45), NodeCategory::Patients);
        let query = analyze(&[date, and(), age], "", &schema()).expect("analyzes");
        assert_eq!(query.date_scope().map(|(lo, _)| lo), Some(1_672_531_200));
    }

    #[test]
    fn coverage_values_must_name_a_state() {
        let coverage = node(
            "TCC Coverage Status",
            Operator::Eq,
            json!("sometimes"),
            NodeCategory::TccForm,
        );
        let err = analyze(&[coverage], "", &schema()).unwrap_err();
        assert_eq!(err.code(), "InvalidSelector");
    }

    #[test]
    fn collects_explicit_phases() {
        let tokens = vec![
            general("Phase", json!("Phase 1")),
            and(),
            node(
                "Survey Coverage Status",
                Operator::Eq,
                json!("Covered in Phase 2"),
                NodeCategory::Form1,
            ),
        ];
        let query = analyze(&tokens, "", &schema()).expect("analyzes");
        assert_eq!(query.explicit_phases(), vec![Phase::One, Phase::Two]);
    }
}
