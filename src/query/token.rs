//! Inbound request and the client's selector/choice token model.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::NodeCategory;

/// Request body accepted by the engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryRequest {
    /// Structured token list; the source of truth for parsing.
    pub expression: Vec<Token>,
    /// Human-readable rendering, used for display and logs.
    #[serde(rename = "expressionString", default)]
    pub expression_string: String,
}

/// One element of the flat token list.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Token {
    /// A field test or scope definition.
    Selector(Selector),
    /// A parenthesis or boolean connective.
    Choice(Choice),
}

impl Token {
    /// Convenience constructor for a connective or parenthesis.
    pub fn choice(kind: ChoiceKind) -> Self {
        Token::Choice(Choice { value: kind })
    }

    /// The selector, if this token is one.
    pub fn as_selector(&self) -> Option<&Selector> {
        match self {
            Token::Selector(selector) => Some(selector),
            Token::Choice(_) => None,
        }
    }

    /// The choice kind, if this token is one.
    pub fn choice_kind(&self) -> Option<ChoiceKind> {
        match self {
            Token::Choice(choice) => Some(choice.value),
            Token::Selector(_) => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Selector(selector) => selector.fmt(f),
            Token::Choice(choice) => choice.value.fmt(f),
        }
    }
}

/// A selector token.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Selector {
    /// Display label, e.g. `Age > 45`.
    #[serde(default)]
    pub label: String,
    /// Field label looked up in the field schema, or a general scope name.
    pub field: String,
    /// Comparison operator.
    #[serde(default)]
    pub operator: Operator,
    /// Comparison value: a label, a number, a list of labels or a range object.
    #[serde(default)]
    pub value: Value,
    /// Node category the selector targets, or `general` for scopes.
    #[serde(rename = "targetNode")]
    pub target_node: TargetNode,
}

impl Selector {
    /// Whether the selector defines a scope rather than a record test.
    pub fn is_general(&self) -> bool {
        matches!(self.target_node, TargetNode::General)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.label.trim().is_empty() {
            return f.write_str(self.label.trim());
        }
        match &self.value {
            Value::String(text) => write!(f, "{} {} {}", self.field, self.operator, text),
            other => write!(f, "{} {} {}", self.field, self.operator, other),
        }
    }
}

/// Target of a selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetNode {
    /// Scope selector (Panchayath, Village, Date, Phase).
    General,
    /// Record predicate against a node category.
    Node(NodeCategory),
}

impl TargetNode {
    /// The node category, unless this is a general selector.
    pub fn category(self) -> Option<NodeCategory> {
        match self {
            TargetNode::General => None,
            TargetNode::Node(category) => Some(category),
        }
    }
}

impl TryFrom<String> for TargetNode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().eq_ignore_ascii_case("general") {
            return Ok(TargetNode::General);
        }
        value
            .parse::<NodeCategory>()
            .map(TargetNode::Node)
            .map_err(|err| err.to_string())
    }
}

impl From<TargetNode> for String {
    fn from(value: TargetNode) -> Self {
        match value {
            TargetNode::General => "general".to_owned(),
            TargetNode::Node(category) => category.as_str().to_owned(),
        }
    }
}

/// Comparison operator carried by a selector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Operator {
    /// Equality (the default).
    #[default]
    #[serde(rename = "=", alias = "==")]
    Eq,
    /// Inequality.
    #[serde(rename = "!=")]
    Ne,
    /// Less than.
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal.
    #[serde(rename = "<=")]
    Le,
    /// Greater than.
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Membership in a list of labels.
    #[serde(rename = "in", alias = "IN")]
    In,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
        })
    }
}

/// A choice token.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Choice {
    /// Which parenthesis or connective this is.
    pub value: ChoiceKind,
}

/// Parentheses and boolean connectives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum ChoiceKind {
    /// `(`
    #[serde(rename = "(")]
    Open,
    /// `)`
    #[serde(rename = ")")]
    Close,
    /// `AND`
    #[serde(rename = "AND", alias = "and")]
    And,
    /// `OR`
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl fmt::Display for ChoiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChoiceKind::Open => "(",
            ChoiceKind::Close => ")",
            ChoiceKind::And => "AND",
            ChoiceKind::Or => "OR",
        })
    }
}

/// Joins tokens into the human-readable form used in frames and logs.
pub fn render_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
