//! Rule-based planner: required categories, evaluation order and strategy.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::model::NodeCategory;
use crate::query::analyze::{analyze, AnalyzedQuery, LeafKind, ResolvedLeaf};
use crate::query::ast::{BoolOp, Expr};
use crate::query::errors::QueryError;
use crate::query::parser::split_groups;
use crate::query::scope::GeneralScope;
use crate::query::token::{render_tokens, QueryRequest, Token};
use crate::schema::{CoverageFamily, FieldSchema};

/// Planner inputs that influence rule selection.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Whether the grouped-intersection strategy may be chosen.
    pub grouped_intersection: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            grouped_intersection: true,
        }
    }
}

/// How the final candidate set is computed.
#[derive(Clone, Debug)]
pub enum Strategy {
    /// Evaluate the whole expression as one tree.
    SingleTree(AnalyzedQuery),
    /// Evaluate each top-level group independently and intersect the
    /// results by entity key.
    GroupedIntersection(Vec<QueryGroup>),
}

impl Strategy {
    /// Name used in frames and explain output.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::SingleTree(_) => "single-tree",
            Strategy::GroupedIntersection(_) => "grouped-intersection",
        }
    }
}

/// One top-level group of a grouped-intersection plan.
#[derive(Clone, Debug)]
pub struct QueryGroup {
    /// 1-based group number.
    pub index: usize,
    /// Rendering of the group's tokens.
    pub display: String,
    /// The group analyzed on its own.
    pub query: AnalyzedQuery,
}

/// Top-level operator context used to pick a scan order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatorContext {
    /// More `AND` than `OR` connectives.
    AndDominant,
    /// At least as many `OR` as `AND` connectives.
    OrDominant,
}

/// Static scan-order heuristic. It only reorders evaluation.
#[derive(Clone, Debug)]
pub struct Priority {
    context: OperatorContext,
    promoted: Vec<NodeCategory>,
}

const AND_ORDER: [NodeCategory; 5] = [
    NodeCategory::Patients,
    NodeCategory::TccForm,
    NodeCategory::Form3,
    NodeCategory::ManualVitals,
    NodeCategory::Form1,
];

const OR_ORDER: [NodeCategory; 5] = [
    NodeCategory::Form1,
    NodeCategory::Patients,
    NodeCategory::ManualVitals,
    NodeCategory::Form3,
    NodeCategory::TccForm,
];

impl Priority {
    /// Heuristic for `query`.
    pub fn for_query(query: &AnalyzedQuery) -> Self {
        let (mut ands, mut ors) = (0usize, 0usize);
        count_ops(&query.expr, &mut ands, &mut ors);
        let context = if ands > ors {
            OperatorContext::AndDominant
        } else {
            OperatorContext::OrDominant
        };
        let promoted = query
            .leaves
            .values()
            .find_map(|leaf| match leaf.kind {
                LeafKind::Coverage { family, .. } => Some(family.nodes().to_vec()),
                _ => None,
            })
            .unwrap_or_default();
        Self { context, promoted }
    }

    /// Operator context.
    pub fn context(&self) -> OperatorContext {
        self.context
    }

    /// Rank of a category; lower scans first.
    pub fn rank(&self, category: NodeCategory) -> usize {
        if let Some(pos) = self.promoted.iter().position(|c| *c == category) {
            return pos;
        }
        let order = match self.context {
            OperatorContext::AndDominant => &AND_ORDER,
            OperatorContext::OrDominant => &OR_ORDER,
        };
        let pos = order.iter().position(|c| *c == category).unwrap_or(order.len());
        self.promoted.len() + pos
    }

    /// Rank of a subtree: the best rank among its leaves. Scope leaves rank first.
    pub fn subtree_rank(&self, expr: &Expr, query: &AnalyzedQuery) -> usize {
        expr.leaves()
            .into_iter()
            .map(|leaf| match query.leaf(leaf.index) {
                Some(ResolvedLeaf {
                    kind: LeafKind::Scope(_),
                    ..
                }) => 0,
                Some(ResolvedLeaf {
                    kind: LeafKind::Coverage { family, .. },
                    ..
                }) => family
                    .nodes()
                    .iter()
                    .map(|c| self.rank(*c))
                    .min()
                    .unwrap_or(0),
                Some(resolved) => resolved.category().map(|c| self.rank(c)).unwrap_or(0),
                None => usize::MAX,
            })
            .min()
            .unwrap_or(usize::MAX)
    }

    /// Whether the right child should be evaluated before the left one.
    pub fn right_first(&self, left: &Expr, right: &Expr, query: &AnalyzedQuery) -> bool {
        self.subtree_rank(right, query) < self.subtree_rank(left, query)
    }
}

fn count_ops(expr: &Expr, ands: &mut usize, ors: &mut usize) {
    if let Expr::Binary { op, left, right } = expr {
        match op {
            BoolOp::And => *ands += 1,
            BoolOp::Or => *ors += 1,
        }
        count_ops(left, ands, ors);
        count_ops(right, ands, ors);
    }
}

/// Planner output.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Chosen strategy.
    pub strategy: Strategy,
    /// Categories fetched in full before evaluation, in store order.
    pub required: Vec<NodeCategory>,
    /// Date range of the query, if scoped by date.
    pub date_scope: Option<(i64, i64)>,
    /// Rendering of the whole expression.
    pub display: String,
    /// Deterministic fingerprint for logs.
    pub fingerprint: u64,
}

impl QueryPlan {
    /// Categories fetched per candidate after evaluation.
    pub fn detail_categories(&self) -> Vec<NodeCategory> {
        NodeCategory::ALL
            .into_iter()
            .filter(|category| !self.required.contains(category))
            .collect()
    }
}

/// Planner that turns a request into a [`QueryPlan`].
pub struct Planner {
    schema: Arc<FieldSchema>,
    config: PlannerConfig,
}

impl Planner {
    /// Creates a planner over `schema`.
    pub fn new(config: PlannerConfig, schema: Arc<FieldSchema>) -> Self {
        Self { schema, config }
    }

    /// Validates and plans a request.
    pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan, QueryError> {
        let whole = analyze(
            &request.expression,
            &request.expression_string,
            &self.schema,
        )?;
        let required = required_categories(&whole);
        let date_scope = whole.date_scope();
        let display = whole.display.clone();
        let strategy = match self.grouped(&request.expression)? {
            Some(groups) => Strategy::GroupedIntersection(groups),
            None => Strategy::SingleTree(whole),
        };
        let fingerprint = compute_fingerprint(&request.expression, &strategy, &required);
        tracing::debug!(
            fingerprint = %format!("{fingerprint:016x}"),
            strategy = strategy.name(),
            required = ?required,
            "planned query"
        );
        Ok(QueryPlan {
            strategy,
            required,
            date_scope,
            display,
            fingerprint,
        })
    }

    fn grouped(&self, tokens: &[Token]) -> Result<Option<Vec<QueryGroup>>, QueryError> {
        if !self.config.grouped_intersection {
            return Ok(None);
        }
        let split = split_groups(tokens);
        if !split.is_clean() || !split.all_and() || split.groups.len() < 2 {
            return Ok(None);
        }
        let mut groups = Vec::with_capacity(split.groups.len());
        let mut pinned = BTreeSet::new();
        for (i, group) in split.groups.iter().enumerate() {
            let display = render_tokens(&group.tokens);
            let query = analyze(&group.tokens, &display, &self.schema)?;
            if let [phase] = query.explicit_phases().as_slice() {
                pinned.insert(*phase);
            }
            groups.push(QueryGroup {
                index: i + 1,
                display,
                query,
            });
        }
        Ok((pinned.len() >= 2).then_some(groups))
    }
}

/// Categories scanned during evaluation.
///
/// `Form_1` is always included once a general or coverage selector appears,
/// since dates and phases are derived from its timestamps.
pub fn required_categories(query: &AnalyzedQuery) -> Vec<NodeCategory> {
    let mut needed = BTreeSet::new();
    for leaf in query.leaves.values() {
        match &leaf.kind {
            LeafKind::Record { category, .. } | LeafKind::Unresolved { category } => {
                needed.insert(*category);
            }
            LeafKind::Coverage { family, .. } => needed.extend(family.nodes().iter().copied()),
            LeafKind::Scope(_) => {}
        }
    }
    if query.has_scope_or_coverage() {
        needed.insert(NodeCategory::Form1);
    }
    NodeCategory::ALL
        .into_iter()
        .filter(|category| needed.contains(category))
        .collect()
}

fn compute_fingerprint(tokens: &[Token], strategy: &Strategy, required: &[NodeCategory]) -> u64 {
    let mut hasher = Xxh64::new(0);
    for token in tokens {
        hasher.write(token.to_string().as_bytes());
        if let Some(selector) = token.as_selector() {
            hasher.write(selector.field.as_bytes());
            hasher.write(selector.value.to_string().as_bytes());
            hasher.write(String::from(selector.target_node).as_bytes());
        }
        hasher.write_u8(0);
    }
    hasher.write(strategy.name().as_bytes());
    for category in required {
        hasher.write(category.as_str().as_bytes());
    }
    hasher.finish()
}

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree.
    pub root: ExplainNode,
    /// Deterministic fingerprint of the plan.
    pub fingerprint: u64,
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Additional properties describing the operator.
    pub props: Vec<ExplainProp>,
    /// Input operators, in evaluation order.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn prop(mut self, prop: ExplainProp) -> Self {
        self.props.push(prop);
        self
    }

    /// Indented text rendering, one operator per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;
        let _ = write!(out, "{}{}", "  ".repeat(depth), self.op);
        if !self.props.is_empty() {
            let props: Vec<_> = self.props.iter().map(ToString::to_string).collect();
            let _ = write!(out, " [{}]", props.join(", "));
        }
        out.push('\n');
        for input in &self.inputs {
            input.render_into(out, depth + 1);
        }
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

impl fmt::Display for ExplainProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Builds the explain tree of a plan.
pub fn explain(plan: &QueryPlan) -> PlanExplain {
    let required: Vec<_> = plan.required.iter().map(|c| c.as_str()).collect();
    let mut root = ExplainNode::new("Query")
        .prop(ExplainProp::plain("strategy", plan.strategy.name()))
        .prop(ExplainProp::plain("required", required.join(",")))
        .prop(ExplainProp::plain(
            "fingerprint",
            format!("{:016x}", plan.fingerprint),
        ));
    match &plan.strategy {
        Strategy::SingleTree(query) => root.inputs.push(explain_query(query)),
        Strategy::GroupedIntersection(groups) => {
            root.inputs = groups
                .iter()
                .map(|group| {
                    let mut node = ExplainNode::new("Group")
                        .prop(ExplainProp::plain("index", group.index.to_string()))
                        .prop(ExplainProp::literal("query", group.display.clone()));
                    node.inputs.push(explain_query(&group.query));
                    node
                })
                .collect();
        }
    }
    PlanExplain {
        root,
        fingerprint: plan.fingerprint,
    }
}

fn explain_query(query: &AnalyzedQuery) -> ExplainNode {
    let priority = Priority::for_query(query);
    let context = match priority.context() {
        OperatorContext::AndDominant => "and-dominant",
        OperatorContext::OrDominant => "or-dominant",
    };
    let mut node = explain_expr(&query.expr, query, &priority);
    node.props.push(ExplainProp::plain("context", context));
    node
}

fn explain_expr(expr: &Expr, query: &AnalyzedQuery, priority: &Priority) -> ExplainNode {
    match expr {
        Expr::Leaf(leaf) => match query.leaf(leaf.index) {
            Some(resolved) => explain_leaf(resolved),
            None => ExplainNode::new("Missing").prop(ExplainProp::plain("token", leaf.index.to_string())),
        },
        Expr::Binary { op, left, right } => {
            let name = match op {
                BoolOp::And => "Intersect",
                BoolOp::Or => "Union",
            };
            let mut node = ExplainNode::new(name);
            let scoped = (*op == BoolOp::And)
                .then(|| scope_side(left, right, query))
                .flatten();
            let right_first = match scoped {
                Some((side, scope)) => {
                    let pushed = if scope.is_partition() {
                        "partition"
                    } else if matches!(scope, GeneralScope::Phase(_)) {
                        "phase"
                    } else {
                        "none"
                    };
                    node.props.push(ExplainProp::plain("pushdown", pushed));
                    side == Side::Right
                }
                None => priority.right_first(left, right, query),
            };
            let (first, second) = if right_first { (right, left) } else { (left, right) };
            node.inputs = vec![
                explain_expr(first, query, priority),
                explain_expr(second, query, priority),
            ];
            node
        }
    }
}

/// Which child of a binary node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    /// Left operand.
    Left,
    /// Right operand.
    Right,
}

/// The scope selector directly under an `AND`, if either child is one.
/// The left child wins when both are.
pub fn scope_side<'q>(
    left: &Expr,
    right: &Expr,
    query: &'q AnalyzedQuery,
) -> Option<(Side, &'q GeneralScope)> {
    scope_of(left, query)
        .map(|scope| (Side::Left, scope))
        .or_else(|| scope_of(right, query).map(|scope| (Side::Right, scope)))
}

fn scope_of<'q>(expr: &Expr, query: &'q AnalyzedQuery) -> Option<&'q GeneralScope> {
    match expr {
        Expr::Leaf(leaf) => match &query.leaf(leaf.index)?.kind {
            LeafKind::Scope(scope) => Some(scope),
            _ => None,
        },
        Expr::Binary { .. } => None,
    }
}

fn explain_leaf(leaf: &ResolvedLeaf) -> ExplainNode {
    let selector = &leaf.selector;
    match &leaf.kind {
        LeafKind::Scope(scope) => ExplainNode::new("Scope").prop(ExplainProp::literal(
            "scope",
            scope.to_string(),
        )),
        LeafKind::Record { field, category } => ExplainNode::new("Match")
            .prop(ExplainProp::plain("field", field.label.clone()))
            .prop(ExplainProp::plain("node", category.as_str()))
            .prop(ExplainProp::plain("path", field.path.to_string()))
            .prop(ExplainProp::plain("op", selector.operator.to_string()))
            .prop(ExplainProp::literal("value", selector.value.to_string())),
        LeafKind::Coverage { family, state } => ExplainNode::new("Coverage")
            .prop(ExplainProp::plain("family", family_name(*family)))
            .prop(ExplainProp::plain("covered", state.covered.to_string()))
            .prop(ExplainProp::plain("phase", state.phase.number().to_string())),
        LeafKind::Unresolved { category } => ExplainNode::new("Empty")
            .prop(ExplainProp::plain("field", selector.field.clone()))
            .prop(ExplainProp::plain("node", category.as_str())),
    }
}

fn family_name(family: CoverageFamily) -> &'static str {
    match family {
        CoverageFamily::Survey => "survey",
        CoverageFamily::Screening => "screening",
        CoverageFamily::Tcc => "tcc",
    }
}
