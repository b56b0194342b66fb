//! # Live View Maintenance Tests
//!
//! Checks that an index stays correct and emits the right listener events
//! across the whole row lifecycle: adds, updates, deletes, edit brackets,
//! accept/reject, and bulk suspension.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use reltab::{
    DataType, DataVersion, Expr, ExprPredicate, Index, IndexField, IndexListener, ListChange,
    RecordId, RowComparer, RowId, RowStateFilter, Table, TableBuilder, Value,
};

fn ledger() -> Table {
    TableBuilder::new("ledger")
        .column("id", DataType::Int)
        .column("region", DataType::Text)
        .column("amount", DataType::Int)
        .build()
}

fn add(t: &mut Table, id: i64, region: &str, amount: i64) -> RowId {
    t.add_row(vec![
        Value::Int(id),
        Value::Text(region.into()),
        Value::Int(amount),
    ])
    .unwrap()
}

fn update(t: &mut Table, row: RowId, id: i64, region: &str, amount: i64) {
    t.update_row(
        row,
        vec![Value::Int(id), Value::Text(region.into()), Value::Int(amount)],
    )
    .unwrap();
}

fn view_rows(t: &Table, ix: &Index) -> Vec<RowId> {
    ix.records().iter().map(|&r| t.row_of_record(r)).collect()
}

fn view_amounts(t: &Table, ix: &Index) -> Vec<i64> {
    ix.records()
        .iter()
        .map(|&r| match t.record_value(r, 2) {
            Value::Int(v) => *v,
            other => panic!("unexpected amount {other:?}"),
        })
        .collect()
}

#[derive(Default)]
struct Capture(Mutex<Vec<ListChange>>);

impl Capture {
    fn take(&self) -> Vec<ListChange> {
        std::mem::take(&mut self.0.lock())
    }
}

impl IndexListener for Capture {
    fn list_changed(&self, change: ListChange) {
        self.0.lock().push(change);
    }
}

fn listen(ix: &Index) -> Arc<Capture> {
    let cap = Arc::new(Capture::default());
    let listener: Arc<dyn IndexListener> = cap.clone();
    ix.add_listener(&listener);
    cap
}

fn amount_index(t: &Table) -> Arc<Index> {
    t.get_or_create_index(
        vec![IndexField::asc(2)],
        RowStateFilter::CURRENT_ROWS,
        None,
        None,
    )
    .unwrap()
}

/// Adds land sorted, deletes leave, and both emit positional events.
#[test]
fn adds_and_deletes_keep_the_view_sorted() {
    let mut t = ledger();
    let ix = amount_index(&t);
    let cap = listen(&ix);

    let r1 = add(&mut t, 1, "EU", 300);
    let r2 = add(&mut t, 2, "EU", 100);
    let r3 = add(&mut t, 3, "US", 200);
    assert_eq!(view_rows(&t, &ix), vec![r2, r3, r1]);
    assert_eq!(
        cap.take(),
        vec![
            ListChange::ItemAdded(0),
            ListChange::ItemAdded(0),
            ListChange::ItemAdded(1),
        ]
    );

    t.delete_row(r3).unwrap();
    assert_eq!(view_rows(&t, &ix), vec![r2, r1]);
    assert_eq!(cap.take(), vec![ListChange::ItemDeleted(1)]);

    ix.remove_ref(&t);
}

/// An update that keeps the sort key swaps the record in place: one
/// `ItemChanged` at a stable ordinal, no churn.
#[test]
fn update_off_sort_key_changes_in_place() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 100);
    let r2 = add(&mut t, 2, "EU", 200);
    let r3 = add(&mut t, 3, "EU", 300);
    let ix = amount_index(&t);
    let cap = listen(&ix);

    update(&mut t, r2, 2, "APAC", 200);
    assert_eq!(view_rows(&t, &ix), vec![r1, r2, r3]);
    assert_eq!(cap.take(), vec![ListChange::ItemChanged(1)]);
    assert_eq!(view_amounts(&t, &ix), vec![100, 200, 300]);

    ix.remove_ref(&t);
}

/// An update that moves the sort key re-seats the record: a single
/// `ItemMoved` carrying both ordinals, not a delete/add pair.
#[test]
fn update_on_sort_key_relocates() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 100);
    let r2 = add(&mut t, 2, "EU", 200);
    let r3 = add(&mut t, 3, "EU", 300);
    let ix = amount_index(&t);
    let cap = listen(&ix);

    update(&mut t, r2, 2, "EU", 999);
    assert_eq!(view_rows(&t, &ix), vec![r1, r3, r2]);
    assert_eq!(cap.take(), vec![ListChange::ItemMoved { new: 2, old: 1 }]);

    ix.remove_ref(&t);
}

/// Records with equal sort keys order by row id, and the group survives
/// partial deletion.
#[test]
fn duplicate_sort_keys_order_by_row() {
    let mut t = ledger();
    let rows: Vec<RowId> = (0..6).map(|i| add(&mut t, i, "EU", 500)).collect();
    let r_low = add(&mut t, 99, "EU", 1);
    let ix = amount_index(&t);

    let mut expected = vec![r_low];
    expected.extend(&rows);
    assert_eq!(view_rows(&t, &ix), expected);

    t.delete_row(rows[2]).unwrap();
    t.delete_row(rows[4]).unwrap();
    let mut expected = vec![r_low, rows[0], rows[1], rows[3], rows[5]];
    assert_eq!(view_rows(&t, &ix), expected);

    // Collapse the group down to a single member.
    for &r in &[rows[0], rows[1], rows[3]] {
        t.delete_row(r).unwrap();
    }
    expected = vec![r_low, rows[5]];
    assert_eq!(view_rows(&t, &ix), expected);

    ix.remove_ref(&t);
}

/// The original-rows view holds pre-change records until accept, then
/// converges with the current view.
#[test]
fn original_view_tracks_accept_changes() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 100);
    let r2 = add(&mut t, 2, "EU", 200);
    t.accept_changes(r1).unwrap();
    t.accept_changes(r2).unwrap();

    let original = t
        .get_or_create_index(
            vec![IndexField::asc(2)],
            RowStateFilter::ORIGINAL_ROWS,
            None,
            None,
        )
        .unwrap();
    let current = amount_index(&t);

    update(&mut t, r1, 1, "EU", 900);
    assert_eq!(view_amounts(&t, &original), vec![100, 200]);
    assert_eq!(view_amounts(&t, &current), vec![200, 900]);

    t.accept_changes(r1).unwrap();
    assert_eq!(view_amounts(&t, &original), vec![200, 900]);
    assert_eq!(view_amounts(&t, &current), vec![200, 900]);

    original.remove_ref(&t);
    current.remove_ref(&t);
}

/// Rejecting a change restores both views to the original records.
#[test]
fn reject_changes_restores_the_current_view() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 100);
    t.accept_changes(r1).unwrap();
    let ix = amount_index(&t);

    update(&mut t, r1, 1, "EU", 900);
    assert_eq!(view_amounts(&t, &ix), vec![900]);
    t.reject_changes(r1).unwrap();
    assert_eq!(view_amounts(&t, &ix), vec![100]);

    ix.remove_ref(&t);
}

/// An edit bracket touches the view only at commit; a cancelled bracket
/// never shows.
#[test]
fn edit_bracket_commits_once() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 100);
    let ix = amount_index(&t);
    let cap = listen(&ix);

    // Edit a non-sort column: the commit swaps records in place.
    t.begin_edit(r1).unwrap();
    t.set_edit_value(r1, 0, Value::Int(5)).unwrap();
    t.set_edit_value(r1, 0, Value::Int(7)).unwrap();
    assert_eq!(
        t.row_value(r1, 0, DataVersion::Default).unwrap(),
        &Value::Int(7),
        "default reads see the proposed value inside the bracket"
    );
    assert_eq!(
        t.row_value(r1, 0, DataVersion::Current).unwrap(),
        &Value::Int(1)
    );
    assert_eq!(cap.take(), vec![], "proposed values are invisible to views");

    t.end_edit(r1).unwrap();
    assert_eq!(t.row_value(r1, 0, DataVersion::Current).unwrap(), &Value::Int(7));
    assert_eq!(cap.take(), vec![ListChange::ItemChanged(0)]);

    t.begin_edit(r1).unwrap();
    t.set_edit_value(r1, 2, Value::Int(1)).unwrap();
    t.cancel_edit(r1).unwrap();
    assert_eq!(view_amounts(&t, &ix), vec![100]);
    assert_eq!(cap.take(), vec![]);

    ix.remove_ref(&t);
}

/// Suspension swallows per-record events and resume collapses them into a
/// single reset.
#[test]
fn suspend_resume_coalesces_to_reset() {
    let mut t = ledger();
    let ix = amount_index(&t);
    let cap = listen(&ix);

    t.suspend_index_events();
    for i in 0..10 {
        add(&mut t, i, "EU", i * 10);
    }
    assert_eq!(cap.take(), vec![], "no events while suspended");
    t.resume_index_events();
    assert_eq!(cap.take(), vec![ListChange::Reset]);
    assert_eq!(ix.len(), 10, "maintenance still happened while suspended");

    // A clean suspend/resume cycle with no changes stays silent.
    t.suspend_index_events();
    t.resume_index_events();
    assert_eq!(cap.take(), vec![]);

    ix.remove_ref(&t);
}

/// A filtered index admits records only while they pass the predicate.
#[test]
fn filtered_index_follows_the_predicate() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 50);
    let filter = Arc::new(ExprPredicate::new(Expr::col(2).gt(Expr::lit(100))));
    let ix = t
        .get_or_create_index(
            vec![IndexField::asc(2)],
            RowStateFilter::CURRENT_ROWS,
            Some(filter),
            None,
        )
        .unwrap();
    assert!(
        !ix.is_sharable(),
        "filtered indexes are private to their creator"
    );
    assert_eq!(
        t.live_indexes().len(),
        1,
        "a private index still registers for mutation fan-out"
    );
    let cap = listen(&ix);
    assert_eq!(ix.len(), 0);

    update(&mut t, r1, 1, "EU", 150);
    assert_eq!(view_amounts(&t, &ix), vec![150]);
    assert_eq!(cap.take(), vec![ListChange::ItemAdded(0)]);

    update(&mut t, r1, 1, "EU", 80);
    assert_eq!(ix.len(), 0);
    assert_eq!(cap.take(), vec![ListChange::ItemDeleted(0)]);

    ix.remove_ref(&t);
    assert!(t.live_indexes().is_empty());
}

/// A second consumer asking for the same shape as a private index gets its
/// own instance; the registry only shares unfiltered, uncompared indexes.
#[test]
fn private_indexes_are_never_handed_out() {
    let t = ledger();
    let filter = Arc::new(ExprPredicate::new(Expr::col(2).gt(Expr::lit(100))));
    let private = t
        .get_or_create_index(
            vec![IndexField::asc(2)],
            RowStateFilter::CURRENT_ROWS,
            Some(filter),
            None,
        )
        .unwrap();
    let shared = amount_index(&t);
    assert!(
        !Arc::ptr_eq(&private, &shared),
        "a plain request must not be served by the filtered index"
    );
    assert_eq!(t.live_indexes().len(), 2);
    private.remove_ref(&t);
    shared.remove_ref(&t);
    assert!(t.live_indexes().is_empty());
}

/// A no-sort-field index keeps insertion order: an update swaps records at
/// a stable position instead of re-seating the row.
#[test]
fn positional_index_keeps_row_positions() {
    let mut t = ledger();
    let r1 = add(&mut t, 1, "EU", 100);
    let r2 = add(&mut t, 2, "EU", 200);
    let r3 = add(&mut t, 3, "EU", 300);
    let ix = t
        .get_or_create_index(Vec::new(), RowStateFilter::CURRENT_ROWS, None, None)
        .unwrap();
    let cap = listen(&ix);
    assert_eq!(view_rows(&t, &ix), vec![r1, r2, r3]);

    update(&mut t, r2, 2, "EU", 999);
    assert_eq!(
        view_rows(&t, &ix),
        vec![r1, r2, r3],
        "an updated row must hold its position in an unsorted view"
    );
    assert_eq!(cap.take(), vec![ListChange::ItemChanged(1)]);
    assert_eq!(view_amounts(&t, &ix), vec![100, 999, 300]);

    t.delete_row(r1).unwrap();
    assert_eq!(view_rows(&t, &ix), vec![r2, r3]);
    assert_eq!(cap.take(), vec![ListChange::ItemDeleted(0)]);

    ix.remove_ref(&t);
}

struct ByAmountDesc;

impl RowComparer for ByAmountDesc {
    fn compare(&self, table: &Table, a: RecordId, b: RecordId) -> Ordering {
        table.record_value(b, 2).total_cmp(table.record_value(a, 2))
    }
}

/// A custom comparer drives the order; key search is refused on such an
/// index.
#[test]
fn custom_comparer_orders_the_view() {
    let mut t = ledger();
    add(&mut t, 1, "EU", 100);
    add(&mut t, 2, "EU", 300);
    add(&mut t, 3, "EU", 200);
    let ix = t
        .get_or_create_index(
            Vec::new(),
            RowStateFilter::CURRENT_ROWS,
            None,
            Some(Arc::new(ByAmountDesc)),
        )
        .unwrap();
    assert_eq!(view_amounts(&t, &ix), vec![300, 200, 100]);
    assert!(
        ix.find_records(&t, &[Value::Int(200)]).is_err(),
        "comparer-ordered indexes cannot be key-searched"
    );
    ix.remove_ref(&t);
}

/// Composite key search returns the whole duplicate group as one span.
#[test]
fn find_records_returns_the_duplicate_span() {
    let mut t = ledger();
    add(&mut t, 1, "EU", 100);
    let r2 = add(&mut t, 2, "EU", 200);
    let r3 = add(&mut t, 3, "EU", 200);
    add(&mut t, 4, "US", 200);
    let ix = t
        .get_or_create_index(
            vec![IndexField::asc(1), IndexField::asc(2)],
            RowStateFilter::CURRENT_ROWS,
            None,
            None,
        )
        .unwrap();

    let range = ix
        .find_records(&t, &[Value::Text("EU".into()), Value::Int(200)])
        .unwrap();
    assert_eq!(range.count(), 2);
    let rows: Vec<RowId> = ix
        .get_records(range)
        .unwrap()
        .iter()
        .map(|&r| t.row_of_record(r))
        .collect();
    assert_eq!(rows, vec![r2, r3]);

    assert_eq!(
        ix.find_records(&t, &[Value::Text("MEA".into()), Value::Int(1)])
            .unwrap()
            .count(),
        0
    );

    // A prefix key widens the span to everything sharing the prefix.
    let eu = ix.find_records(&t, &[Value::Text("EU".into())]).unwrap();
    assert_eq!(eu.count(), 3, "prefix lookup spans every EU record");
    assert!(
        ix.find_records(&t, &[])
            .is_err(),
        "an empty key has nothing to search"
    );
    assert!(
        ix.find_records(
            &t,
            &[Value::Text("EU".into()), Value::Int(200), Value::Int(9)]
        )
        .is_err(),
        "a key longer than the sort fields is rejected"
    );

    ix.remove_ref(&t);
}

/// The registry hands the same sharable index to identical requests and
/// tears it down with the last reference.
#[test]
fn registry_shares_and_reclaims() {
    let mut t = ledger();
    add(&mut t, 1, "EU", 100);
    let a = amount_index(&t);
    let b = amount_index(&t);
    assert!(Arc::ptr_eq(&a, &b), "identical shapes must share one index");
    assert_eq!(t.live_indexes().len(), 1);
    assert_eq!(a.ref_count(), 2);

    a.remove_ref(&t);
    assert_eq!(t.live_indexes().len(), 1, "one holder keeps it alive");
    b.remove_ref(&t);
    assert!(t.live_indexes().is_empty());

    // A fresh request builds a fresh index.
    let c = amount_index(&t);
    assert_eq!(c.len(), 1);
    c.remove_ref(&t);
}

/// Taking and dropping the last reference from concurrent consumers never
/// exposes a cleared tree: teardown re-checks the count under the registry
/// lock, so a revived index keeps its contents.
#[test]
fn concurrent_reacquire_never_sees_a_cleared_index() {
    let mut t = ledger();
    for i in 0..8 {
        add(&mut t, i, "EU", i * 10);
    }
    let t = &t;
    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(move || {
                for _ in 0..500 {
                    let ix = amount_index(t);
                    assert_eq!(
                        ix.len(),
                        8,
                        "index emptied while a reference was held"
                    );
                    ix.remove_ref(t);
                }
            });
        }
    });
    assert!(t.live_indexes().is_empty());
}

/// Dropped listeners are pruned; survivors keep receiving events.
#[test]
fn dropped_listeners_are_pruned() {
    let mut t = ledger();
    let ix = amount_index(&t);
    let kept = listen(&ix);
    {
        let dropped = listen(&ix);
        add(&mut t, 1, "EU", 100);
        assert_eq!(dropped.take().len(), 1);
    }
    add(&mut t, 2, "EU", 200);
    assert_eq!(kept.take().len(), 2, "surviving listener sees every event");
    ix.remove_ref(&t);
}

/// A full reset rebuilds every live index and tells listeners to resync.
#[test]
fn reset_indexes_rebuilds_and_notifies() {
    let mut t = ledger();
    add(&mut t, 1, "EU", 100);
    add(&mut t, 2, "EU", 50);
    let ix = amount_index(&t);
    let cap = listen(&ix);

    t.reset_indexes().unwrap();
    assert_eq!(cap.take(), vec![ListChange::Reset]);
    assert_eq!(view_amounts(&t, &ix), vec![50, 100]);

    ix.remove_ref(&t);
}

/// Row versions read back correctly through every stage of an update.
#[test]
fn version_reads_span_the_lifecycle() {
    let mut t = ledger();
    let r = add(&mut t, 1, "EU", 100);
    assert!(t.row_value(r, 2, DataVersion::Original).is_err());
    t.accept_changes(r).unwrap();
    assert_eq!(
        t.row_value(r, 2, DataVersion::Original).unwrap(),
        &Value::Int(100)
    );

    update(&mut t, r, 1, "EU", 200);
    assert_eq!(
        t.row_value(r, 2, DataVersion::Original).unwrap(),
        &Value::Int(100)
    );
    assert_eq!(
        t.row_value(r, 2, DataVersion::Current).unwrap(),
        &Value::Int(200)
    );
}
