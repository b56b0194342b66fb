//! # Value Representation
//!
//! Owned, type-safe value representation for table cells. Values are stored
//! inline using enum variants to avoid boxing and enable efficient
//! comparison during index maintenance.
//!
//! ## Value Representation
//!
//! The `Value` enum represents all storable cell values:
//!
//! - **Null**: absence of a value
//! - **Bool**: boolean
//! - **Int**: 64-bit signed integer
//! - **Float**: 64-bit floating point
//! - **Text**: owned UTF-8 string
//! - **Blob**: owned binary data
//!
//! ## Comparison Semantics
//!
//! Two comparison operations exist, with different null handling:
//!
//! - [`Value::compare`] follows SQL three-valued logic: Null compared to
//!   anything (including Null) is UNKNOWN (`None`), and comparing
//!   incompatible classes (Int vs Text) is also `None` — callers that
//!   require a defined ordering surface that as a type-mismatch error.
//! - [`Value::total_cmp`] is the index collation: a total order where Null
//!   sorts first, then Bool, numerics, Text, Blob. Every index field is
//!   ordered by this collation, so nulls always occupy the low end of a
//!   sorted run.
//!
//! Int vs Float comparisons promote the integer to floating point in both
//! operations. Float NaN is ordered greater than every non-NaN float so the
//! collation stays total.

use std::cmp::Ordering;

/// Owned runtime value for one table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Schema-level column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int,
    Float,
    Text,
    Blob,
}

/// Rank used to order values of different classes under [`Value::total_cmp`].
fn class_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Text(_) => 3,
        Value::Blob(_) => 4,
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts above every non-NaN value; the collation must stay total.
    a.partial_cmp(&b).unwrap_or_else(|| match (a.is_nan(), b.is_nan()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => Ordering::Equal,
    })
}

impl Value {
    /// SQL three-valued comparison. `None` means UNKNOWN: either side is
    /// Null, or the two values belong to incomparable classes.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(cmp_f64(*a, *b)),
            (Value::Int(a), Value::Float(b)) => Some(cmp_f64(*a as f64, *b)),
            (Value::Float(a), Value::Int(b)) => Some(cmp_f64(*a, *b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Index collation: a total order over all values. Null sorts first;
    /// values of different classes order by class; numerics cross-compare
    /// by promotion.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => cmp_f64(*a, *b),
            (Value::Int(a), Value::Float(b)) => cmp_f64(*a as f64, *b),
            (Value::Float(a), Value::Int(b)) => cmp_f64(*a, *b as f64),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => class_rank(self).cmp(&class_rank(other)),
        }
    }

    /// Returns true for `Value::Null`.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl DataType {
    /// Type admission test for column writes. Null is accepted by every
    /// column; Int is accepted by Float columns (lossy widening happens at
    /// comparison time, not storage time).
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (DataType::Bool, Value::Bool(_)) => true,
            (DataType::Int, Value::Int(_)) => true,
            (DataType::Float, Value::Float(_) | Value::Int(_)) => true,
            (DataType::Text, Value::Text(_)) => true,
            (DataType::Blob, Value::Blob(_)) => true,
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
