//! Expression tree produced by the parser.
//!
//! Leaves point back into the token list by position so the evaluator can
//! reach the full selector (field, operator, value, target node).

use std::fmt;

/// Binary boolean connective.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BoolOp {
    /// Both sides must match.
    And,
    /// Either side may match.
    Or,
}

impl BoolOp {
    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BoolOp::Or => 1,
            BoolOp::And => 2,
        }
    }
}

impl fmt::Display for BoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoolOp::And => "AND",
            BoolOp::Or => "OR",
        })
    }
}

/// Reference from a leaf to its selector token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafRef {
    /// Position of the selector in the token list.
    pub index: usize,
    /// Display label of the selector.
    pub label: String,
}

/// Immutable boolean expression tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Expr {
    /// A single selector.
    Leaf(LeafRef),
    /// A binary application.
    Binary {
        /// Connective.
        op: BoolOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
}

impl Expr {
    /// Builds a leaf.
    pub fn leaf(index: usize, label: impl Into<String>) -> Self {
        Expr::Leaf(LeafRef {
            index,
            label: label.into(),
        })
    }

    /// Builds a binary node.
    pub fn binary(op: BoolOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Leaves in left-to-right order.
    pub fn leaves(&self) -> Vec<&LeafRef> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Expr::Leaf(leaf) => out.push(leaf),
                Expr::Binary { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        out
    }

    /// Height of the tree; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Leaf(_) => 1,
            Expr::Binary { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Leaf(leaf) => f.write_str(&leaf.label),
            Expr::Binary { op, left, right } => write!(f, "({left} {op} {right})"),
        }
    }
}
