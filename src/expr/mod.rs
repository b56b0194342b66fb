//! # Filter Expression Trees
//!
//! AST types for the embedded filter grammar consumed by index admission and
//! the select planner. The shape is deliberately small: column references,
//! constants, comparison operators, and boolean and/or. Trees are built
//! programmatically through the constructor methods on [`Expr`]; there is no
//! parser in this crate.
//!
//! ## Expression Types
//!
//! - **Column(ordinal)**: reference to a table column by ordinal
//! - **Literal(value)**: an owned constant
//! - **Binary { op, left, right }**: comparison or boolean combinator
//!
//! ## Operator Notes
//!
//! `Is` is null-safe equality: `a IS b` is true when both sides are null, or
//! both are non-null and equal. Its dominant use is `col.is_null()`. The
//! plain comparison operators follow SQL three-valued logic instead — a null
//! operand makes the comparison UNKNOWN, which the boolean coercion at the
//! filter root treats as not-true.
//!
//! The select planner inspects (never evaluates) these trees when it
//! decomposes a top-level AND-chain into indexable candidates; see
//! `crate::select`.

mod eval;

pub use eval::{ExprPredicate, RowPredicate};
pub(crate) use eval::eval;

use crate::types::Value;

/// Binary operators of the filter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// Null-safe equality; `col IS NULL` is the indexable null test.
    Is,
    And,
    Or,
}

/// One node of a filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(usize),
    Literal(Value),
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Column reference by ordinal.
    pub fn col(ordinal: usize) -> Expr {
        Expr::Column(ordinal)
    }

    /// Constant leaf.
    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    fn binary(self, op: BinaryOperator, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::Eq, right)
    }

    pub fn ne(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::NotEq, right)
    }

    pub fn lt(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::Lt, right)
    }

    pub fn le(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::LtEq, right)
    }

    pub fn gt(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::Gt, right)
    }

    pub fn ge(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::GtEq, right)
    }

    /// `self IS NULL`.
    pub fn is_null(self) -> Expr {
        self.binary(BinaryOperator::Is, Expr::Literal(Value::Null))
    }

    pub fn and(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::And, right)
    }

    pub fn or(self, right: Expr) -> Expr {
        self.binary(BinaryOperator::Or, right)
    }
}
