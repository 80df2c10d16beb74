//! Operator-precedence parser for the client token stream.
//!
//! The parser never fails outright. Structural anomalies are collected as
//! [`StructuralIssue`]s and the malformed application is dropped, so callers
//! always get the best tree that could be built (or `None`) plus a list of
//! what was wrong with the input.

use std::fmt;

use crate::query::ast::{BoolOp, Expr};
use crate::query::token::{ChoiceKind, Token};

/// A structural defect found in a token stream. Positions index the token list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StructuralIssue {
    /// `(` never closed.
    UnmatchedOpen {
        /// Position of the `(`.
        position: usize,
    },
    /// `)` without a matching `(`.
    UnmatchedClose {
        /// Position of the `)`.
        position: usize,
    },
    /// A connective with fewer than two operands.
    MissingOperand {
        /// Position of the connective.
        position: usize,
        /// The connective.
        op: BoolOp,
    },
    /// Two operands with no connective between them.
    MissingOperator {
        /// Position of the second operand.
        position: usize,
    },
    /// `()` with nothing inside.
    EmptyGroup {
        /// Position of the `(`.
        position: usize,
    },
    /// A selector sitting outside every top-level group.
    DanglingSelector {
        /// Position of the selector.
        position: usize,
    },
    /// A top-level connective with no group after it.
    TrailingConnector {
        /// Position of the connective.
        position: usize,
    },
}

impl fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralIssue::UnmatchedOpen { position } => {
                write!(f, "unmatched '(' at token {position}")
            }
            StructuralIssue::UnmatchedClose { position } => {
                write!(f, "unmatched ')' at token {position}")
            }
            StructuralIssue::MissingOperand { position, op } => {
                write!(f, "{op} at token {position} is missing an operand")
            }
            StructuralIssue::MissingOperator { position } => {
                write!(f, "missing AND/OR before token {position}")
            }
            StructuralIssue::EmptyGroup { position } => {
                write!(f, "empty parentheses at token {position}")
            }
            StructuralIssue::DanglingSelector { position } => {
                write!(f, "selector at token {position} is outside any group")
            }
            StructuralIssue::TrailingConnector { position } => {
                write!(f, "connector at token {position} has no group after it")
            }
        }
    }
}

/// Result of [`parse`].
#[derive(Clone, Debug, Default)]
pub struct ParseOutcome {
    /// Best tree that could be built; `None` for a fully malformed stream.
    pub expr: Option<Expr>,
    /// Every defect encountered.
    pub issues: Vec<StructuralIssue>,
}

impl ParseOutcome {
    /// Whether the stream parsed without defects.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
enum Pending {
    Open { position: usize, base: usize },
    Op { op: BoolOp, position: usize },
}

struct ShuntingYard {
    operands: Vec<Expr>,
    pending: Vec<Pending>,
    issues: Vec<StructuralIssue>,
}

impl ShuntingYard {
    fn frame_base(&self) -> usize {
        self.pending
            .iter()
            .rev()
            .find_map(|entry| match entry {
                Pending::Open { base, .. } => Some(*base),
                Pending::Op { .. } => None,
            })
            .unwrap_or(0)
    }

    fn apply(&mut self, op: BoolOp, position: usize) {
        if self.operands.len() < self.frame_base() + 2 {
            self.issues
                .push(StructuralIssue::MissingOperand { position, op });
            return;
        }
        let (Some(right), Some(left)) = (self.operands.pop(), self.operands.pop()) else {
            return;
        };
        self.operands.push(Expr::binary(op, left, right));
    }

    fn push_operator(&mut self, op: BoolOp, position: usize) {
        while let Some(Pending::Op { op: top, position: top_pos }) = self.pending.last().copied() {
            if top.precedence() < op.precedence() {
                break;
            }
            self.pending.pop();
            self.apply(top, top_pos);
        }
        self.pending.push(Pending::Op { op, position });
    }

    fn close(&mut self, position: usize) {
        loop {
            match self.pending.pop() {
                Some(Pending::Op { op, position }) => self.apply(op, position),
                Some(Pending::Open {
                    position: open,
                    base,
                }) => {
                    if self.operands.len() == base {
                        self.issues
                            .push(StructuralIssue::EmptyGroup { position: open });
                    }
                    return;
                }
                None => {
                    self.issues
                        .push(StructuralIssue::UnmatchedClose { position });
                    return;
                }
            }
        }
    }

    fn finish(mut self) -> ParseOutcome {
        while let Some(entry) = self.pending.pop() {
            match entry {
                Pending::Op { op, position } => self.apply(op, position),
                Pending::Open { position, .. } => {
                    self.issues.push(StructuralIssue::UnmatchedOpen { position })
                }
            }
        }
        ParseOutcome {
            expr: self.operands.pop(),
            issues: self.issues,
        }
    }
}

/// Parses a token stream into an expression tree.
///
/// `AND` binds tighter than `OR`, both associate left, and parentheses
/// override precedence.
pub fn parse(tokens: &[Token]) -> ParseOutcome {
    let mut state = ShuntingYard {
        operands: Vec::new(),
        pending: Vec::new(),
        issues: Vec::new(),
    };
    let mut expect_operand = true;
    for (position, token) in tokens.iter().enumerate() {
        match token {
            Token::Selector(selector) => {
                if !expect_operand {
                    state
                        .issues
                        .push(StructuralIssue::MissingOperator { position });
                }
                state
                    .operands
                    .push(Expr::leaf(position, selector.to_string()));
                expect_operand = false;
            }
            Token::Choice(choice) => match choice.value {
                ChoiceKind::Open => {
                    if !expect_operand {
                        state
                            .issues
                            .push(StructuralIssue::MissingOperator { position });
                    }
                    let base = state.operands.len();
                    state.pending.push(Pending::Open { position, base });
                    expect_operand = true;
                }
                ChoiceKind::Close => {
                    state.close(position);
                    expect_operand = false;
                }
                ChoiceKind::And => {
                    state.push_operator(BoolOp::And, position);
                    expect_operand = true;
                }
                ChoiceKind::Or => {
                    state.push_operator(BoolOp::Or, position);
                    expect_operand = true;
                }
            },
        }
    }
    state.finish()
}

/// A top-level parenthesized group.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenGroup {
    /// Position of the group's `(` in the original stream.
    pub start: usize,
    /// Tokens between the group's parentheses.
    pub tokens: Vec<Token>,
}

/// Result of [`split_groups`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupSplit {
    /// Complete top-level groups, in order.
    pub groups: Vec<TokenGroup>,
    /// Connectives between consecutive groups.
    pub connectors: Vec<BoolOp>,
    /// Defects found while splitting.
    pub issues: Vec<StructuralIssue>,
}

impl GroupSplit {
    /// Whether the stream is a clean chain of groups joined by connectives.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.connectors.len() + 1 == self.groups.len()
    }

    /// Whether every connective is `AND`.
    pub fn all_and(&self) -> bool {
        self.connectors.iter().all(|op| *op == BoolOp::And)
    }
}

/// Splits a stream into top-level parenthesized groups and their connectives.
///
/// An unterminated group is reported and omitted.
pub fn split_groups(tokens: &[Token]) -> GroupSplit {
    let mut split = GroupSplit::default();
    let mut depth = 0usize;
    let mut current: Option<TokenGroup> = None;
    let mut pending_connector: Option<(BoolOp, usize)> = None;

    for (position, token) in tokens.iter().enumerate() {
        let kind = token.choice_kind();
        if depth == 0 {
            match kind {
                Some(ChoiceKind::Open) => {
                    if split.groups.len() > split.connectors.len() {
                        split
                            .issues
                            .push(StructuralIssue::MissingOperator { position });
                    }
                    depth = 1;
                    current = Some(TokenGroup {
                        start: position,
                        tokens: Vec::new(),
                    });
                    pending_connector = None;
                }
                Some(ChoiceKind::Close) => split
                    .issues
                    .push(StructuralIssue::UnmatchedClose { position }),
                Some(ChoiceKind::And) | Some(ChoiceKind::Or) => {
                    let op = if kind == Some(ChoiceKind::And) {
                        BoolOp::And
                    } else {
                        BoolOp::Or
                    };
                    if split.groups.len() == split.connectors.len() + 1 {
                        split.connectors.push(op);
                        pending_connector = Some((op, position));
                    } else {
                        split
                            .issues
                            .push(StructuralIssue::MissingOperand { position, op });
                    }
                }
                None => split
                    .issues
                    .push(StructuralIssue::DanglingSelector { position }),
            }
            continue;
        }

        match kind {
            Some(ChoiceKind::Open) => depth += 1,
            Some(ChoiceKind::Close) => depth -= 1,
            _ => {}
        }
        if depth == 0 {
            if let Some(group) = current.take() {
                if group.tokens.is_empty() {
                    split.issues.push(StructuralIssue::EmptyGroup {
                        position: group.start,
                    });
                }
                split.groups.push(group);
            }
        } else if let Some(group) = current.as_mut() {
            group.tokens.push(token.clone());
        }
    }

    if let Some(group) = current {
        split.issues.push(StructuralIssue::UnmatchedOpen {
            position: group.start,
        });
        // The connector that introduced the unterminated group has nothing to join.
        if split.connectors.len() >= split.groups.len() {
            split.connectors.pop();
        }
    } else if let Some((_, position)) = pending_connector {
        split
            .issues
            .push(StructuralIssue::TrailingConnector { position });
    }
    split
}
