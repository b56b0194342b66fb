//! # Select Planner
//!
//! Turns a `(filter, sort, row-state mask)` request into rows by driving an
//! [`Index`](crate::index::Index) instead of scanning the table.
//!
//! ```text
//! filter expression
//!   └─ AND-chain decomposition → per-column candidates (=, IS NULL, </>)
//!        └─ index choice: reuse a live index whose leading fields the
//!           candidates or the sort can drive, else build one
//!             └─ matched prefix → two ordinal binary searches → span
//!                  └─ residual filter over the span
//!                       └─ explicit sort, if the index order differs
//! ```
//!
//! A candidate is one column's conjunctive constraint set. Only a *leading*
//! run of index fields can be binary-searched: equality candidates extend
//! the run, the first range candidate closes it, and everything the run
//! does not prove is re-checked by the residual pass. The residual simply
//! re-evaluates the whole filter — candidates are implied true, so the
//! re-check changes nothing but keeps the pass independent of how much of
//! the expression the prefix consumed.
//!
//! The planner holds exactly one index reference for the duration of the
//! query; shared indexes built here stay registered only while somebody
//! else also holds them.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;
use tracing::debug;

use crate::expr::{eval, BinaryOperator, Expr, ExprPredicate};
use crate::index::{Index, IndexField, RecordRange};
use crate::rows::{RecordId, RowId, RowStateFilter, Table};
use crate::types::Value;

/// One column's conjunctive constraints, harvested from the filter.
#[derive(Debug, Clone, Default)]
struct Candidate {
    column: usize,
    /// Exact-match value; `Value::Null` encodes an IS NULL test.
    equals: Option<Value>,
    lower: Option<(Value, bool)>,
    upper: Option<(Value, bool)>,
}

impl Candidate {
    fn is_range(&self) -> bool {
        self.equals.is_none() && (self.lower.is_some() || self.upper.is_some())
    }
}

/// How one matched index field is probed during the binary search.
enum Probe {
    Exact(Value),
    /// Bounds already swapped into index order for descending fields.
    Range {
        low: Option<(Value, bool)>,
        high: Option<(Value, bool)>,
    },
}

struct MatchedField {
    field: IndexField,
    probe: Probe,
}

/// Holds one reference on an index for the duration of a query.
struct IndexLease<'a> {
    table: &'a Table,
    index: Arc<Index>,
}

impl Drop for IndexLease<'_> {
    fn drop(&mut self) {
        self.index.remove_ref(self.table);
    }
}

/// Rows matching `filter`, ordered by `sort`, drawn from the records the
/// row-state mask admits. An empty sort returns rows in index order.
pub fn select(
    table: &Table,
    filter: Option<&ExprPredicate>,
    sort: &[IndexField],
    mask: RowStateFilter,
) -> Result<Vec<RowId>> {
    mask.validate()?;
    let candidates = match filter {
        Some(f) => decompose(f.expr()),
        None => SmallVec::new(),
    };
    let lease = choose_index(table, &candidates, sort, mask)?;
    let index = &lease.index;

    let matched = matched_prefix(index.fields(), &candidates);
    let range = if matched.is_empty() {
        match index.len() {
            0 => RecordRange::Empty,
            n => RecordRange::span(0, n - 1),
        }
    } else {
        probe_range(table, index, &matched)?
    };

    let mut hits: Vec<RecordId> = Vec::with_capacity(range.count());
    for rec in index.get_records(range)? {
        let passes = match filter {
            None => true,
            Some(f) => {
                let row = table.row_of_record(rec);
                let version = table.version_of_record(rec);
                match eval(f.expr(), table, row, version)? {
                    Value::Bool(b) => b,
                    Value::Null => false,
                    other => eyre::bail!("filter did not evaluate to a boolean: {other:?}"),
                }
            }
        };
        if passes {
            hits.push(rec);
        }
    }

    let eq_len = matched
        .iter()
        .take_while(|m| matches!(m.probe, Probe::Exact(_)))
        .count();
    let ordered = sort_satisfied(index.fields(), eq_len, sort);
    if !ordered {
        sort_records(table, &mut hits, sort);
    }
    debug!(
        table = %table.name(),
        span = range.count(),
        hits = hits.len(),
        prefix = matched.len(),
        resorted = !ordered,
        "select"
    );
    Ok(hits.iter().map(|&rec| table.row_of_record(rec)).collect())
}

// --- candidate analysis ---------------------------------------------------

/// Harvests per-column candidates from the filter's top-level AND chain.
/// Anything that is not `column <op> literal` is left to the residual pass.
fn decompose(expr: &Expr) -> SmallVec<[Candidate; 4]> {
    let mut out: SmallVec<[Candidate; 4]> = SmallVec::new();
    let mut stack = vec![expr];
    while let Some(e) = stack.pop() {
        if let Expr::Binary { op, left, right } = e {
            if *op == BinaryOperator::And {
                stack.push(right);
                stack.push(left);
                continue;
            }
            harvest(*op, left, right, &mut out);
        }
    }
    out
}

fn harvest(op: BinaryOperator, left: &Expr, right: &Expr, out: &mut SmallVec<[Candidate; 4]>) {
    use BinaryOperator::*;
    let (column, literal, op) = match (left, right) {
        (Expr::Column(c), Expr::Literal(v)) => (*c, v, op),
        (Expr::Literal(v), Expr::Column(c)) => (*c, v, flip(op)),
        _ => return,
    };
    let cand = match out.iter_mut().find(|c| c.column == column) {
        Some(c) => c,
        None => {
            out.push(Candidate { column, ..Candidate::default() });
            out.last_mut().unwrap()
        }
    };
    match op {
        // `col = NULL` is never true; the residual pass rejects everything,
        // so it earns no candidate.
        Eq if !literal.is_null() => {
            cand.equals.get_or_insert_with(|| literal.clone());
        }
        Is if literal.is_null() => {
            cand.equals.get_or_insert(Value::Null);
        }
        Gt | GtEq if !literal.is_null() => {
            tighten(&mut cand.lower, literal, op == GtEq, Ordering::Greater);
        }
        Lt | LtEq if !literal.is_null() => {
            tighten(&mut cand.upper, literal, op == LtEq, Ordering::Less);
        }
        _ => {}
    }
}

fn flip(op: BinaryOperator) -> BinaryOperator {
    use BinaryOperator::*;
    match op {
        Lt => Gt,
        LtEq => GtEq,
        Gt => Lt,
        GtEq => LtEq,
        other => other,
    }
}

/// Keeps the tighter of two bounds on the same side; `keep` is the ordering
/// a new bound must have against the old one to replace it.
fn tighten(slot: &mut Option<(Value, bool)>, bound: &Value, inclusive: bool, keep: Ordering) {
    match slot {
        None => *slot = Some((bound.clone(), inclusive)),
        Some((old, old_incl)) => {
            let ord = bound.total_cmp(old);
            if ord == keep || (ord == Ordering::Equal && *old_incl && !inclusive) {
                *slot = Some((bound.clone(), inclusive));
            }
        }
    }
}

// --- index choice ---------------------------------------------------------

/// Leading index fields the candidates can drive: `(equality run, range)`.
fn prefix_score(fields: &[IndexField], candidates: &[Candidate]) -> (usize, bool) {
    let mut eq = 0;
    for f in fields {
        let Some(c) = candidates.iter().find(|c| c.column == f.column) else {
            return (eq, false);
        };
        if c.equals.is_some() {
            eq += 1;
        } else if c.is_range() {
            return (eq, true);
        } else {
            return (eq, false);
        }
    }
    (eq, false)
}

/// Whatever the equality run pins down, the rest of the index fields must
/// lead with the requested sort for the scan to come out ordered.
fn sort_satisfied(fields: &[IndexField], eq_len: usize, sort: &[IndexField]) -> bool {
    sort.is_empty() || fields.get(eq_len..).is_some_and(|rest| rest.starts_with(sort))
}

fn choose_index<'a>(
    table: &'a Table,
    candidates: &[Candidate],
    sort: &[IndexField],
    mask: RowStateFilter,
) -> Result<IndexLease<'a>> {
    let mut best: Option<((bool, usize), Arc<Index>)> = None;
    for ix in table.live_indexes() {
        if !ix.is_sharable() || ix.mask() != mask {
            continue;
        }
        let (eq, ranged) = prefix_score(ix.fields(), candidates);
        let matched = eq + ranged as usize;
        let ordered = sort_satisfied(ix.fields(), eq, sort);
        if matched == 0 && !(ordered && !sort.is_empty()) && !ix.fields().is_empty() {
            continue;
        }
        let score = (ordered, matched);
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, ix));
        }
    }
    // A bare positional index only serves a query with nothing to drive.
    let reusable = best.and_then(|(_, ix)| {
        let useless = ix.fields().is_empty() && (!candidates.is_empty() || !sort.is_empty());
        (!useless).then_some(ix)
    });
    let index = match reusable {
        Some(ix) => {
            ix.add_ref(table)?;
            debug!(table = %table.name(), "reusing live index");
            ix
        }
        None => {
            let mut fields: Vec<IndexField> = Vec::new();
            // Equality columns ahead of the sort: fixing them leaves the
            // remainder of the scan in sort order.
            for c in candidates.iter().filter(|c| c.equals.is_some()) {
                if !sort.iter().any(|f| f.column == c.column) {
                    fields.push(IndexField::asc(c.column));
                }
            }
            fields.extend_from_slice(sort);
            if let Some(c) = candidates.iter().find(|c| c.is_range()) {
                if !fields.iter().any(|f| f.column == c.column) {
                    fields.push(IndexField::asc(c.column));
                }
            }
            table.get_or_create_index(fields, mask, None, None)?
        }
    };
    Ok(IndexLease { table, index })
}

// --- range probing --------------------------------------------------------

/// The leading index fields the candidates prove, with probes rewritten
/// into index order (a descending field swaps its bounds).
fn matched_prefix(fields: &[IndexField], candidates: &[Candidate]) -> SmallVec<[MatchedField; 2]> {
    let mut out = SmallVec::new();
    for f in fields {
        let Some(c) = candidates.iter().find(|c| c.column == f.column) else {
            break;
        };
        if let Some(v) = &c.equals {
            out.push(MatchedField { field: *f, probe: Probe::Exact(v.clone()) });
        } else if c.is_range() {
            let (low, high) = if f.descending {
                (c.upper.clone(), c.lower.clone())
            } else {
                (c.lower.clone(), c.upper.clone())
            };
            out.push(MatchedField { field: *f, probe: Probe::Range { low, high } });
            break;
        } else {
            break;
        }
    }
    out
}

/// Where one record stands against the matched prefix, in index order:
/// `Less` before the span, `Greater` after it, `Equal` inside.
fn probe_record(table: &Table, rec: RecordId, matched: &[MatchedField]) -> Ordering {
    for m in matched {
        let v = table.record_value(rec, m.field.column);
        let dir = |ord: Ordering| if m.field.descending { ord.reverse() } else { ord };
        match &m.probe {
            Probe::Exact(target) => {
                let ord = dir(v.total_cmp(target));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Probe::Range { low, high } => {
                if let Some((bound, inclusive)) = low {
                    let ord = dir(v.total_cmp(bound));
                    if ord == Ordering::Less || (ord == Ordering::Equal && !inclusive) {
                        return Ordering::Less;
                    }
                }
                if let Some((bound, inclusive)) = high {
                    let ord = dir(v.total_cmp(bound));
                    if ord == Ordering::Greater || (ord == Ordering::Equal && !inclusive) {
                        return Ordering::Greater;
                    }
                }
            }
        }
    }
    Ordering::Equal
}

/// Two ordinal binary searches bracketing the records the prefix admits.
fn probe_range(table: &Table, index: &Index, matched: &[MatchedField]) -> Result<RecordRange> {
    let len = index.len();
    // First ordinal not before the span.
    let mut lo = 0usize;
    let mut hi = len;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if probe_record(table, index.record_at(mid)?, matched) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let first = lo;
    // First ordinal past the span.
    let mut hi = len;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if probe_record(table, index.record_at(mid)?, matched) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    if first == lo {
        Ok(RecordRange::Empty)
    } else {
        Ok(RecordRange::span(first, lo - 1))
    }
}

// --- sort fallback --------------------------------------------------------

/// Explicit sort for results the index order does not already satisfy.
/// Ties break by row id, then by record state, so repeated selects are
/// stable.
fn sort_records(table: &Table, records: &mut [RecordId], sort: &[IndexField]) {
    records.sort_unstable_by(|&a, &b| {
        for f in sort {
            let ord = table
                .record_value(a, f.column)
                .total_cmp(table.record_value(b, f.column));
            let ord = if f.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        table
            .row_of_record(a)
            .cmp(&table.row_of_record(b))
            .then_with(|| table.record_state(a).cmp(&table.record_state(b)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::TableBuilder;
    use crate::types::DataType;

    fn orders() -> Table {
        let mut t = TableBuilder::new("orders")
            .column("id", DataType::Int)
            .column("region", DataType::Text)
            .column("amount", DataType::Int)
            .build();
        for (id, region, amount) in [
            (1, "EU", 50),
            (2, "EU", 200),
            (3, "US", 300),
            (4, "EU", 120),
            (5, "US", 80),
            (6, "EU", 200),
        ] {
            t.add_row(vec![
                Value::Int(id),
                Value::Text(region.into()),
                Value::Int(amount),
            ])
            .unwrap();
        }
        t
    }

    fn amounts(t: &Table, rows: &[RowId]) -> Vec<i64> {
        rows.iter()
            .map(|&r| match t.row_value(r, 2, crate::rows::DataVersion::Current).unwrap() {
                Value::Int(v) => *v,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn equality_and_range_with_sort() {
        let t = orders();
        let filter = ExprPredicate::new(
            Expr::col(1)
                .eq(Expr::lit("EU"))
                .and(Expr::col(2).gt(Expr::lit(100))),
        );
        let rows = select(
            &t,
            Some(&filter),
            &[IndexField::desc(2)],
            RowStateFilter::CURRENT_ROWS,
        )
        .unwrap();
        assert_eq!(amounts(&t, &rows), vec![200, 200, 120]);
    }

    #[test]
    fn no_filter_no_sort_returns_all_in_row_order() {
        let t = orders();
        let rows = select(&t, None, &[], RowStateFilter::CURRENT_ROWS).unwrap();
        assert_eq!(rows, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn decompose_finds_equality_and_bounds() {
        let e = Expr::col(1)
            .eq(Expr::lit("EU"))
            .and(Expr::col(2).gt(Expr::lit(100)))
            .and(Expr::col(2).le(Expr::lit(500)));
        let cands = decompose(&e);
        assert_eq!(cands.len(), 2);
        let region = cands.iter().find(|c| c.column == 1).unwrap();
        assert_eq!(region.equals, Some(Value::Text("EU".into())));
        let amount = cands.iter().find(|c| c.column == 2).unwrap();
        assert!(amount.is_range());
        assert_eq!(amount.lower, Some((Value::Int(100), false)));
        assert_eq!(amount.upper, Some((Value::Int(500), true)));
    }

    #[test]
    fn flipped_literal_side_is_normalized() {
        // 100 < amount  ≡  amount > 100
        let e = Expr::lit(100).lt(Expr::col(2));
        let cands = decompose(&e);
        assert_eq!(cands[0].lower, Some((Value::Int(100), false)));
    }

    #[test]
    fn tighter_bound_wins() {
        let e = Expr::col(2)
            .gt(Expr::lit(50))
            .and(Expr::col(2).gt(Expr::lit(100)));
        let cands = decompose(&e);
        assert_eq!(cands[0].lower, Some((Value::Int(100), false)));
    }

    #[test]
    fn or_contributes_no_candidates_but_still_filters() {
        let t = orders();
        let filter = ExprPredicate::new(
            Expr::col(2)
                .gt(Expr::lit(250))
                .or(Expr::col(2).lt(Expr::lit(60))),
        );
        let mut rows = select(&t, Some(&filter), &[], RowStateFilter::CURRENT_ROWS).unwrap();
        rows.sort_unstable();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn is_null_probe_finds_nulls() {
        let mut t = TableBuilder::new("t")
            .column("v", DataType::Int)
            .build();
        t.add_row(vec![Value::Int(1)]).unwrap();
        t.add_row(vec![Value::Null]).unwrap();
        t.add_row(vec![Value::Int(3)]).unwrap();
        let filter = ExprPredicate::new(Expr::col(0).is_null());
        let rows = select(&t, Some(&filter), &[], RowStateFilter::CURRENT_ROWS).unwrap();
        assert_eq!(rows, vec![1]);
    }

    #[test]
    fn descending_range_probe() {
        let t = orders();
        let filter = ExprPredicate::new(Expr::col(2).ge(Expr::lit(120)));
        // Build the index ourselves, descending, so the probe has to swap
        // its bounds into index order.
        let ix = t
            .get_or_create_index(
                vec![IndexField::desc(2)],
                RowStateFilter::CURRENT_ROWS,
                None,
                None,
            )
            .unwrap();
        let rows = select(
            &t,
            Some(&filter),
            &[IndexField::desc(2)],
            RowStateFilter::CURRENT_ROWS,
        )
        .unwrap();
        assert_eq!(amounts(&t, &rows), vec![300, 200, 200, 120]);
        ix.remove_ref(&t);
    }

    #[test]
    fn select_leaves_no_index_behind() {
        let t = orders();
        let filter = ExprPredicate::new(Expr::col(1).eq(Expr::lit("EU")));
        select(&t, Some(&filter), &[], RowStateFilter::CURRENT_ROWS).unwrap();
        assert!(t.live_indexes().is_empty());
    }
}
