//! Filter evaluation with null-aware boolean coercion.
//!
//! [`RowPredicate`] is the single boolean-evaluation contract shared by index
//! admission and the select planner's residual filtering: given a row and the
//! version to read it under, decide whether the row passes. [`ExprPredicate`]
//! implements it by walking an [`Expr`] tree.
//!
//! Three-valued logic is carried through the walk as `Value::Null` and
//! collapsed only at the root: an UNKNOWN filter result admits nothing. A
//! root that evaluates to a non-boolean value is a caller error, as is a
//! comparison between incompatible value classes.

use eyre::{bail, Result};

use crate::expr::{BinaryOperator, Expr};
use crate::rows::{DataVersion, RowId, Table};
use crate::types::Value;

/// Boolean admission test over one row version.
pub trait RowPredicate: Send + Sync {
    fn invoke(&self, table: &Table, row: RowId, version: DataVersion) -> Result<bool>;
}

/// [`RowPredicate`] backed by a filter expression tree.
pub struct ExprPredicate {
    expr: Expr,
}

impl ExprPredicate {
    pub fn new(expr: Expr) -> Self {
        Self { expr }
    }

    /// The underlying tree, inspected by the select planner's candidate
    /// analysis.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl RowPredicate for ExprPredicate {
    fn invoke(&self, table: &Table, row: RowId, version: DataVersion) -> Result<bool> {
        match eval(&self.expr, table, row, version)? {
            Value::Bool(b) => Ok(b),
            // UNKNOWN at the root admits nothing.
            Value::Null => Ok(false),
            other => bail!("filter did not evaluate to a boolean: {:?}", other),
        }
    }
}

/// Evaluates one subtree. `Value::Null` doubles as the UNKNOWN truth value
/// for boolean-typed subtrees.
pub(crate) fn eval(
    expr: &Expr,
    table: &Table,
    row: RowId,
    version: DataVersion,
) -> Result<Value> {
    match expr {
        Expr::Column(ordinal) => table.row_value(row, *ordinal, version).cloned(),
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Binary { op, left, right } => {
            let l = eval(left, table, row, version)?;
            let r = eval(right, table, row, version)?;
            apply_binary(*op, &l, &r)
        }
    }
}

fn apply_binary(op: BinaryOperator, l: &Value, r: &Value) -> Result<Value> {
    use BinaryOperator::*;
    match op {
        And => Ok(and3(truth(l)?, truth(r)?)),
        Or => Ok(or3(truth(l)?, truth(r)?)),
        Is => match (l.is_null(), r.is_null()) {
            (true, true) => Ok(Value::Bool(true)),
            (true, false) | (false, true) => Ok(Value::Bool(false)),
            (false, false) => match l.compare(r) {
                Some(ord) => Ok(Value::Bool(ord == std::cmp::Ordering::Equal)),
                None => bail!("cannot compare {:?} with {:?}", l, r),
            },
        },
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let Some(ord) = l.compare(r) else {
                bail!("cannot compare {:?} with {:?}", l, r);
            };
            let b = match op {
                Eq => ord == std::cmp::Ordering::Equal,
                NotEq => ord != std::cmp::Ordering::Equal,
                Lt => ord == std::cmp::Ordering::Less,
                LtEq => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                GtEq => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(b))
        }
    }
}

/// Three-valued truth of a boolean-typed operand: Some(bool) or None for
/// UNKNOWN. Non-boolean operands of and/or are caller errors.
fn truth(v: &Value) -> Result<Option<bool>> {
    match v {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => bail!("boolean operator applied to non-boolean value: {:?}", other),
    }
}

fn and3(l: Option<bool>, r: Option<bool>) -> Value {
    match (l, r) {
        (Some(false), _) | (_, Some(false)) => Value::Bool(false),
        (Some(true), Some(true)) => Value::Bool(true),
        _ => Value::Null,
    }
}

fn or3(l: Option<bool>, r: Option<bool>) -> Value {
    match (l, r) {
        (Some(true), _) | (_, Some(true)) => Value::Bool(true),
        (Some(false), Some(false)) => Value::Bool(false),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::TableBuilder;
    use crate::types::DataType;

    fn sample_table() -> Table {
        let mut table = TableBuilder::new("t")
            .column("id", DataType::Int)
            .column("name", DataType::Text)
            .build();
        table
            .add_row(vec![Value::Int(1), Value::Text("alpha".into())])
            .unwrap();
        table.add_row(vec![Value::Int(2), Value::Null]).unwrap();
        table
    }

    fn invoke(table: &Table, row: u32, expr: Expr) -> Result<bool> {
        ExprPredicate::new(expr).invoke(table, row, DataVersion::Default)
    }

    #[test]
    fn comparison_and_chain() {
        let t = sample_table();
        let f = Expr::col(0).gt(Expr::lit(0)).and(Expr::col(1).eq(Expr::lit("alpha")));
        assert!(invoke(&t, 0, f.clone()).unwrap());
        // Row 1 has a null name: UNKNOWN collapses to false.
        assert!(!invoke(&t, 1, f).unwrap());
    }

    #[test]
    fn null_comparison_is_not_true() {
        let t = sample_table();
        assert!(!invoke(&t, 1, Expr::col(1).eq(Expr::lit("alpha"))).unwrap());
        assert!(!invoke(&t, 1, Expr::col(1).ne(Expr::lit("alpha"))).unwrap());
    }

    #[test]
    fn is_null_matches_nulls_only() {
        let t = sample_table();
        assert!(invoke(&t, 1, Expr::col(1).is_null()).unwrap());
        assert!(!invoke(&t, 0, Expr::col(1).is_null()).unwrap());
    }

    #[test]
    fn unknown_or_true_is_true() {
        let t = sample_table();
        let f = Expr::col(1).eq(Expr::lit("x")).or(Expr::col(0).eq(Expr::lit(2)));
        assert!(invoke(&t, 1, f).unwrap());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let t = sample_table();
        assert!(invoke(&t, 0, Expr::col(0).eq(Expr::lit("one"))).is_err());
    }

    #[test]
    fn non_boolean_root_is_an_error() {
        let t = sample_table();
        assert!(invoke(&t, 0, Expr::col(0)).is_err());
    }
}
