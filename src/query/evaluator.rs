//! Tree-walking evaluator over fetched category snapshots.
//!
//! Leaves produce phase-tagged candidate sets; `AND` intersects them with
//! `meet` and `OR` unions them with `join`. Only `Phase` and `Date` leaves
//! carry a concrete phase; record and coverage leaves are tagged `All`, or the
//! ambient phase when one was pushed down. Scopes found directly under an
//! `AND` are evaluated first and pushed into the sibling subtree as an
//! ambient restriction; the result equals intersecting the unscoped sibling.

use serde_json::Value;
use thiserror::Error;

use crate::model::{EntityKey, NodeCategory, PhaseTag};
use crate::query::analyze::{AnalyzedQuery, LeafKind, ResolvedLeaf};
use crate::query::ast::{BoolOp, Expr};
use crate::query::candidates::CandidateSet;
use crate::query::planner::{scope_side, Priority, Side};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::scope::{GeneralScope, Scope};
use crate::schema::predicate::{self, coverage_matches, CoverageState};
use crate::schema::{CoverageFamily, FieldDef};
use crate::store::Snapshots;
use crate::temporal::{self, PhaseCutoff, PhaseMode};

/// Raised for a single entity whose payload cannot be evaluated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The entity's data has the wrong shape for its category.
    #[error("entity {key} in {category} is {found}, expected an object")]
    MalformedEntity {
        /// Offending entity.
        key: EntityKey,
        /// Category the payload came from.
        category: NodeCategory,
        /// Shape that was found.
        found: &'static str,
    },
}

/// Inputs shared by every leaf.
#[derive(Clone, Copy, Debug)]
pub struct EvalContext<'a> {
    /// Category snapshots fetched for this query.
    pub snapshots: &'a Snapshots,
    /// Phase boundary.
    pub cutoff: PhaseCutoff,
    /// Length of the region prefix of subregion ids.
    pub subregion_prefix_len: usize,
}

/// Evaluates an analyzed query to its final candidate set.
pub fn evaluate(query: &AnalyzedQuery, ctx: EvalContext<'_>) -> CandidateSet {
    let evaluator = Evaluator {
        query,
        ctx,
        priority: Priority::for_query(query),
    };
    let out = evaluator.eval(&query.expr, &Scope::default());
    tracing::debug!(query = %query.display, candidates = out.len(), "evaluated expression");
    out
}

struct Evaluator<'a> {
    query: &'a AnalyzedQuery,
    ctx: EvalContext<'a>,
    priority: Priority,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr, scope: &Scope) -> CandidateSet {
        match expr {
            Expr::Leaf(leaf) => match self.query.leaf(leaf.index) {
                Some(resolved) => {
                    let start = profile_timer();
                    let out = self.eval_leaf(resolved, scope);
                    record_profile_timer(QueryProfileKind::LeafScan, start);
                    out
                }
                None => {
                    tracing::warn!(token = leaf.index, "leaf has no resolution");
                    CandidateSet::new()
                }
            },
            Expr::Binary {
                op: BoolOp::And,
                left,
                right,
            } => match scope_side(left, right, self.query) {
                Some((side, general)) => {
                    let (scope_expr, other) = match side {
                        Side::Left => (left, right),
                        Side::Right => (right, left),
                    };
                    self.eval_scoped_and(scope_expr, general, other, scope)
                }
                None => {
                    let (first, second) = self.ordered(left, right);
                    let first = self.eval(first, scope);
                    if first.is_empty() {
                        return first;
                    }
                    let second = self.eval(second, scope);
                    combine(first, second, BoolOp::And)
                }
            },
            Expr::Binary {
                op: BoolOp::Or,
                left,
                right,
            } => {
                let (first, second) = self.ordered(left, right);
                let first = self.eval(first, scope);
                let second = self.eval(second, scope);
                combine(first, second, BoolOp::Or)
            }
        }
    }

    fn ordered<'e>(&self, left: &'e Expr, right: &'e Expr) -> (&'e Expr, &'e Expr) {
        if self.priority.right_first(left, right, self.query) {
            (right, left)
        } else {
            (left, right)
        }
    }

    /// Partition scopes prune the scan of `other` and phase scopes set its tag;
    /// date scopes tag candidates by range class, so `other` is evaluated
    /// under the outer scope.
    fn eval_scoped_and(
        &self,
        scope_expr: &Expr,
        general: &GeneralScope,
        other: &Expr,
        scope: &Scope,
    ) -> CandidateSet {
        let scoped = self.eval(scope_expr, scope);
        if scoped.is_empty() {
            return scoped;
        }
        let ambient = match general.pushdown(self.ctx.subregion_prefix_len) {
            Some(pushed) => match scope.narrow(&pushed) {
                Some(narrowed) => narrowed,
                None => return CandidateSet::new(),
            },
            None => scope.clone(),
        };
        tracing::trace!(scope = %general, "pushing scope into sibling");
        let rest = self.eval(other, &ambient);
        combine(scoped, rest, BoolOp::And)
    }

    fn eval_leaf(&self, leaf: &ResolvedLeaf, scope: &Scope) -> CandidateSet {
        match &leaf.kind {
            LeafKind::Scope(general) => self.scope_candidates(general, scope),
            LeafKind::Record { field, category } => self.record_candidates(leaf, field, *category, scope),
            LeafKind::Coverage { family, state } => self.coverage_candidates(*family, *state, scope),
            LeafKind::Unresolved { category } => {
                tracing::debug!(field = %leaf.selector.field, node = %category, "unresolved leaf matches nothing");
                CandidateSet::new()
            }
        }
    }

    fn scope_candidates(&self, general: &GeneralScope, scope: &Scope) -> CandidateSet {
        let base = scope.base_tag();
        match general {
            GeneralScope::Region(_) | GeneralScope::Subregion(_) => {
                let Some(ambient) = general.pushdown(self.ctx.subregion_prefix_len) else {
                    return CandidateSet::new();
                };
                let Some(partition) = scope.partition.narrow(&ambient.partition) else {
                    return CandidateSet::new();
                };
                let mut out = CandidateSet::new();
                for (_, snapshot) in self.ctx.snapshots.iter() {
                    for (key, _) in snapshot.scan(&partition) {
                        out.insert(key, base);
                    }
                }
                out
            }
            GeneralScope::DateRange { lo, hi } => {
                let tag = self.ctx.cutoff.classify_range(*lo, *hi).tag();
                self.form1_candidates(scope, |ts| *lo <= ts && ts <= *hi, tag)
                    .restrict(base)
            }
            GeneralScope::Phase(phase) => {
                let cutoff = self.ctx.cutoff;
                self.form1_candidates(scope, |ts| cutoff.phase_of(ts) == *phase, (*phase).into())
                    .restrict(base)
            }
        }
    }

    fn form1_candidates(
        &self,
        scope: &Scope,
        accept: impl Fn(i64) -> bool,
        tag: PhaseTag,
    ) -> CandidateSet {
        let Some(snapshot) = self.ctx.snapshots.get(NodeCategory::Form1) else {
            tracing::warn!("Form_1 snapshot missing; scope matches nothing");
            return CandidateSet::new();
        };
        let mut out = CandidateSet::new();
        for (key, raw) in snapshot.scan(&scope.partition) {
            if temporal::timestamped_entries(raw).any(|(ts, _)| accept(ts)) {
                out.insert(key, tag);
            }
        }
        out
    }

    fn record_candidates(
        &self,
        leaf: &ResolvedLeaf,
        field: &FieldDef,
        category: NodeCategory,
        scope: &Scope,
    ) -> CandidateSet {
        let Some(snapshot) = self.ctx.snapshots.get(category) else {
            tracing::warn!(node = %category, "snapshot missing; leaf matches nothing");
            return CandidateSet::new();
        };
        let selector = &leaf.selector;
        let tag = scope.base_tag();
        let mut out = CandidateSet::new();
        let mut excluded = 0usize;
        for (key, raw) in snapshot.scan(&scope.partition) {
            if let Err(err) = check_entity(&key, category, raw) {
                tracing::warn!(error = %err, "excluding entity");
                excluded += 1;
                continue;
            }
            let matched = if category.is_timestamped() {
                temporal::project(raw, PhaseMode::Unscoped, &self.ctx.cutoff)
                    .records
                    .iter()
                    .any(|rec| {
                        predicate::evaluate(field, selector.operator, &selector.value, &rec.record)
                    })
            } else {
                predicate::evaluate(field, selector.operator, &selector.value, raw)
            };
            if matched {
                out.insert(key, tag);
            }
        }
        if excluded > 0 {
            tracing::debug!(node = %category, excluded, "entities excluded from leaf");
        }
        out
    }

    fn coverage_candidates(
        &self,
        family: CoverageFamily,
        state: CoverageState,
        scope: &Scope,
    ) -> CandidateSet {
        let members: Vec<NodeCategory> = family
            .nodes()
            .iter()
            .copied()
            .filter(|category| category.is_timestamped())
            .collect();
        let mut keys = CandidateSet::new();
        for category in family.nodes() {
            if let Some(snapshot) = self.ctx.snapshots.get(*category) {
                for (key, _) in snapshot.scan(&scope.partition) {
                    keys.insert(key, PhaseTag::All);
                }
            }
        }
        let tag = scope.base_tag();
        let mut out = CandidateSet::new();
        for (key, _) in keys.iter() {
            let flags: Vec<_> = members
                .iter()
                .map(|category| {
                    self.ctx
                        .snapshots
                        .get(*category)
                        .and_then(|snapshot| snapshot.get(key))
                        .map(|raw| temporal::coverage(raw, &self.ctx.cutoff))
                        .unwrap_or_default()
                })
                .collect();
            if coverage_matches(state, &flags) {
                out.insert(key.clone(), tag);
            }
        }
        out
    }
}

fn combine(left: CandidateSet, right: CandidateSet, op: BoolOp) -> CandidateSet {
    let start = profile_timer();
    let out = match op {
        BoolOp::And => left.intersect(right),
        BoolOp::Or => left.union(right),
    };
    record_profile_timer(QueryProfileKind::Combine, start);
    out
}

fn check_entity(key: &EntityKey, category: NodeCategory, raw: &Value) -> Result<(), EvalError> {
    let found = match raw {
        Value::Object(_) => return Ok(()),
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
    };
    Err(EvalError::MalformedEntity {
        key: key.clone(),
        category,
        found,
    })
}
