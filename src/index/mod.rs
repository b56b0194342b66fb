//! # Live Indexes
//!
//! An [`Index`] is a maintained view over a table: the subset of record
//! snapshots admitted by a row-state mask and an optional filter predicate,
//! held in sort order inside an order-statistics [`tree::RbTree`]. The table
//! fans every record state transition out to its live indexes, so a view
//! stays correct without rescanning.
//!
//! ```text
//! Table mutation
//!   └─ record_state_changed / records_replaced   (per live index)
//!        ├─ admission:  mask.covers(state) && filter(row, version)
//!        ├─ tree maintenance: insert / delete / in-place key swap
//!        └─ listener events: Added / Deleted / Changed / Moved / Reset
//! ```
//!
//! ## Sharing
//!
//! Indexes are reference counted and shared. An index with no filter and no
//! custom comparer is *sharable*: the table's registry hands the same
//! instance to every consumer asking for the same `(fields, mask)` shape.
//! A private index (one with a filter or a custom comparer) registers too —
//! registration is what routes mutation fan-out — but is never handed to
//! another consumer. The first reference builds the tree from a full row
//! scan; the last reference dropped tears it down and unregisters it.
//!
//! ## Ordering
//!
//! Records sort by their field values (descending per field where asked),
//! or by a caller-supplied [`RowComparer`]. Records comparing equal share a
//! duplicate group inside the tree, tie-broken by `(row id, record id)` —
//! an order that never changes while a record is resident, which is what
//! lets a state transition leave the tree untouched. An index with no sort
//! fields and no comparer degenerates to insertion order (positional mode).

pub mod page;
pub mod tree;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::expr::RowPredicate;
use crate::rows::{DataVersion, RecordId, RecordState, RowStateFilter, Table};
use crate::types::Value;

use tree::{RbTree, TreeMode, TreeOrdering};

/// One sort key component: a column ordinal and a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexField {
    pub column: usize,
    pub descending: bool,
}

impl IndexField {
    pub fn asc(column: usize) -> IndexField {
        IndexField { column, descending: false }
    }

    pub fn desc(column: usize) -> IndexField {
        IndexField { column, descending: true }
    }
}

/// Caller-supplied record ordering; overrides field-based comparison.
///
/// Implementations must be consistent with equality on record values: two
/// records must keep their relative order for as long as both are resident.
pub trait RowComparer: Send + Sync {
    fn compare(&self, table: &Table, a: RecordId, b: RecordId) -> Ordering;
}

/// A contiguous run of index ordinals, as returned by key search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRange {
    Empty,
    Span { min: usize, max: usize },
}

impl RecordRange {
    pub fn span(min: usize, max: usize) -> RecordRange {
        assert!(min <= max, "inverted record range {min}..{max}");
        RecordRange::Span { min, max }
    }

    pub fn count(&self) -> usize {
        match *self {
            RecordRange::Empty => 0,
            RecordRange::Span { min, max } => max - min + 1,
        }
    }
}

/// What a maintenance step did to the view, in view-ordinal terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    ItemAdded(usize),
    ItemDeleted(usize),
    ItemChanged(usize),
    ItemMoved { new: usize, old: usize },
    Reset,
}

/// Receiver for view change events. Held weakly; dropped listeners are
/// pruned lazily at the next notification.
pub trait IndexListener: Send + Sync {
    fn list_changed(&self, change: ListChange);
}

/// Field-or-comparer ordering bridged onto the tree. Borrowed per operation
/// so the tree itself stores nothing but record ids.
struct RecordOrdering<'a> {
    table: &'a Table,
    fields: &'a [IndexField],
    comparer: Option<&'a dyn RowComparer>,
}

impl RecordOrdering<'_> {
    fn compare_fields(&self, a: RecordId, b: RecordId) -> Ordering {
        for f in self.fields {
            let va = self.table.record_value(a, f.column);
            let vb = self.table.record_value(b, f.column);
            let ord = va.total_cmp(vb);
            let ord = if f.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl TreeOrdering<RecordId> for RecordOrdering<'_> {
    fn compare_node(&self, a: &RecordId, b: &RecordId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        match self.comparer {
            Some(c) => c.compare(self.table, *a, *b),
            None => self.compare_fields(*a, *b),
        }
    }

    fn compare_satellite(&self, a: &RecordId, b: &RecordId) -> Ordering {
        // (row id, record id): total, and stable for a resident record.
        self.table
            .row_of_record(*a)
            .cmp(&self.table.row_of_record(*b))
            .then(a.cmp(b))
    }
}

/// A maintained, shareable, reference-counted view over one table.
pub struct Index {
    fields: Vec<IndexField>,
    mask: RowStateFilter,
    filter: Option<Arc<dyn RowPredicate>>,
    comparer: Option<Arc<dyn RowComparer>>,
    tree: Mutex<RbTree<RecordId>>,
    refs: AtomicUsize,
    listeners: Mutex<Vec<Weak<dyn IndexListener>>>,
    suspended: AtomicBool,
    dirty_while_suspended: AtomicBool,
}

impl Index {
    /// An empty, unbuilt index. The first [`Index::add_ref`] populates it.
    pub fn new(
        fields: Vec<IndexField>,
        mask: RowStateFilter,
        filter: Option<Arc<dyn RowPredicate>>,
        comparer: Option<Arc<dyn RowComparer>>,
    ) -> Index {
        let mode = if fields.is_empty() && comparer.is_none() {
            TreeMode::Positional
        } else {
            TreeMode::Keyed
        };
        Index {
            fields,
            mask,
            filter,
            comparer,
            tree: Mutex::new(RbTree::new(mode)),
            refs: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
            dirty_while_suspended: AtomicBool::new(false),
        }
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    pub fn mask(&self) -> RowStateFilter {
        self.mask
    }

    /// Sharable indexes carry no closure state and may serve any consumer
    /// asking for the same shape.
    pub fn is_sharable(&self) -> bool {
        self.filter.is_none() && self.comparer.is_none()
    }

    /// True when this index can serve a consumer asking for `fields`/`mask`.
    pub fn matches(&self, fields: &[IndexField], mask: RowStateFilter) -> bool {
        self.is_sharable() && self.fields == fields && self.mask == mask
    }

    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(AtomicOrdering::SeqCst)
    }

    // --- lifecycle --------------------------------------------------------

    /// Takes a reference; the 0→1 transition builds the tree from a full
    /// row scan.
    pub fn add_ref(&self, table: &Table) -> Result<usize> {
        let prev = self.refs.fetch_add(1, AtomicOrdering::SeqCst);
        if prev == 0 {
            self.rebuild(table)?;
        }
        Ok(prev + 1)
    }

    /// Drops a reference; the 1→0 transition tears the tree down and
    /// unregisters the index from the table. The table finishes the
    /// teardown under its registry lock and re-checks the count there, so
    /// a racing `get_or_create_index` that revives this index wins.
    pub fn remove_ref(&self, table: &Table) -> usize {
        let prev = self.refs.fetch_sub(1, AtomicOrdering::SeqCst);
        assert!(prev > 0, "index reference count underflow");
        let now = prev - 1;
        if now == 0 {
            table.retire_index(self);
        }
        now
    }

    /// Empties the tree once the registry has dropped the index. Called
    /// with the registry write lock held, after the zero count has been
    /// re-checked under it.
    pub(crate) fn teardown(&self) {
        self.tree.lock().clear();
        debug!("tore down unreferenced index");
    }

    /// Rebuilds from scratch and tells listeners to resynchronize.
    pub fn reset(&self, table: &Table) -> Result<()> {
        self.rebuild(table)?;
        self.notify(ListChange::Reset);
        Ok(())
    }

    fn rebuild(&self, table: &Table) -> Result<()> {
        let mut tree = self.tree.lock();
        tree.clear();
        for row in table.row_ids() {
            let old = table.record_for_version(row, DataVersion::Original);
            let new = table.record_for_version(row, DataVersion::Current);
            let mut insert = |rec: RecordId| -> Result<()> {
                let Some(state) = table.record_state(rec) else {
                    return Ok(());
                };
                if self.mask.covers(state) && self.filter_admits(table, rec)? {
                    self.insert_into(&mut tree, table, rec);
                }
                Ok(())
            };
            if let Some(o) = old {
                insert(o)?;
            }
            if let Some(n) = new {
                if old != Some(n) {
                    insert(n)?;
                }
            }
        }
        debug!(
            table = %table.name(),
            records = tree.len(),
            fields = self.fields.len(),
            "built index"
        );
        Ok(())
    }

    // --- maintenance hooks ------------------------------------------------

    /// Maintains the view across one record's state transition. `None`
    /// means the record is not resident in any slot on that side.
    pub fn record_state_changed(
        &self,
        table: &Table,
        record: RecordId,
        from: Option<RecordState>,
        to: Option<RecordState>,
    ) -> Result<()> {
        let was_in = from.is_some_and(|s| self.mask.covers(s));
        let now_in = to.is_some_and(|s| self.mask.covers(s)) && self.filter_admits(table, record)?;
        match (was_in, now_in) {
            (false, false) => {}
            (false, true) => self.insert_record(table, record),
            (true, false) => {
                self.delete_record(table, record);
            }
            (true, true) => self.residency_kept(table, record),
        }
        Ok(())
    }

    /// A record that stays admitted across a transition. Its values have
    /// not changed, so under field ordering its position cannot move; a
    /// custom comparer may consult state, so re-seat it there.
    fn residency_kept(&self, table: &Table, record: RecordId) {
        if self.comparer.is_none() {
            match self.position_of(table, record) {
                Some(pos) => self.notify(ListChange::ItemChanged(pos)),
                // The filter admitted it only under the new version slot.
                None => self.insert_record(table, record),
            }
            return;
        }
        let old = self.remove_quiet(table, record);
        let new = self.insert_quiet(table, record);
        match old {
            Some(o) if o != new => self.notify(ListChange::ItemMoved { new, old: o }),
            Some(_) => self.notify(ListChange::ItemChanged(new)),
            None => self.notify(ListChange::ItemAdded(new)),
        }
    }

    /// Maintains the view when one record supersedes another in the same
    /// row. When the outgoing record leaves exactly as the incoming one
    /// enters with an identical sort key, the tree swaps the key in place
    /// and the view reports a single `ItemChanged` at a stable ordinal; a
    /// replace that shifts the sort key reports one `ItemMoved` instead of
    /// a delete/add pair.
    #[allow(clippy::too_many_arguments)]
    pub fn records_replaced(
        &self,
        table: &Table,
        old_record: RecordId,
        old_from: Option<RecordState>,
        old_to: Option<RecordState>,
        new_record: RecordId,
        new_from: Option<RecordState>,
        new_to: Option<RecordState>,
    ) -> Result<()> {
        let old_leaves = old_from.is_some_and(|s| self.mask.covers(s))
            && !old_to.is_some_and(|s| self.mask.covers(s));
        let new_enters = !new_from.is_some_and(|s| self.mask.covers(s))
            && new_to.is_some_and(|s| self.mask.covers(s))
            && self.filter_admits(table, new_record)?;
        if old_leaves && new_enters {
            if self.comparer.is_none() {
                if let Some(pos) = self.try_replace(table, old_record, new_record) {
                    self.notify(ListChange::ItemChanged(pos));
                    return Ok(());
                }
            }
            let old_pos = self.remove_quiet(table, old_record);
            let new_pos = self.insert_quiet(table, new_record);
            match old_pos {
                Some(o) if o != new_pos => {
                    self.notify(ListChange::ItemMoved { new: new_pos, old: o });
                }
                Some(_) => self.notify(ListChange::ItemChanged(new_pos)),
                // The outgoing record was never admitted.
                None => self.notify(ListChange::ItemAdded(new_pos)),
            }
            return Ok(());
        }
        self.record_state_changed(table, old_record, old_from, old_to)?;
        self.record_state_changed(table, new_record, new_from, new_to)?;
        Ok(())
    }

    /// In-place key swap; `None` when the swap is not safe or the outgoing
    /// record is not resident.
    fn try_replace(&self, table: &Table, old: RecordId, new: RecordId) -> Option<usize> {
        let mut tree = self.tree.lock();
        match tree.mode() {
            TreeMode::Positional => {
                let pos = tree.iter().position(|k| k == old)?;
                tree.replace_at(pos, new).ok()?;
                Some(pos)
            }
            TreeMode::Keyed => {
                let ord = self.ordering(table);
                if ord.compare_fields(old, new) != Ordering::Equal {
                    return None;
                }
                if !tree.replace_key(&old, new, &ord) {
                    return None;
                }
                let member = tree.find_member(&new, &ord)?;
                Some(tree.index_of_node(member))
            }
        }
    }

    fn insert_record(&self, table: &Table, record: RecordId) {
        let pos = self.insert_quiet(table, record);
        self.notify(ListChange::ItemAdded(pos));
    }

    /// Removes a record if resident. Tolerates absence: the filter may have
    /// rejected it at admission time.
    fn delete_record(&self, table: &Table, record: RecordId) {
        if let Some(pos) = self.remove_quiet(table, record) {
            self.notify(ListChange::ItemDeleted(pos));
        }
    }

    fn insert_quiet(&self, table: &Table, record: RecordId) -> usize {
        let mut tree = self.tree.lock();
        self.insert_into(&mut tree, table, record)
    }

    fn insert_into(&self, tree: &mut RbTree<RecordId>, table: &Table, record: RecordId) -> usize {
        match tree.mode() {
            TreeMode::Keyed => {
                let ord = self.ordering(table);
                let node = tree.insert(record, &ord);
                tree.index_of_node(node)
            }
            TreeMode::Positional => {
                let pos = tree.len();
                tree.insert_at(pos, record, true);
                pos
            }
        }
    }

    fn remove_quiet(&self, table: &Table, record: RecordId) -> Option<usize> {
        let mut tree = self.tree.lock();
        match tree.mode() {
            TreeMode::Keyed => {
                let ord = self.ordering(table);
                let node = tree.find_member(&record, &ord)?;
                let pos = tree.index_of_node(node);
                tree.delete_key(&record, &ord);
                Some(pos)
            }
            TreeMode::Positional => {
                let pos = tree.iter().position(|k| k == record)?;
                tree.delete_at(pos).expect("ordinal from a fresh scan");
                Some(pos)
            }
        }
    }

    fn position_of(&self, table: &Table, record: RecordId) -> Option<usize> {
        let tree = self.tree.lock();
        match tree.mode() {
            TreeMode::Keyed => {
                let ord = self.ordering(table);
                let node = tree.find_member(&record, &ord)?;
                Some(tree.index_of_node(node))
            }
            TreeMode::Positional => tree.iter().position(|k| k == record),
        }
    }

    fn ordering<'a>(&'a self, table: &'a Table) -> RecordOrdering<'a> {
        RecordOrdering {
            table,
            fields: &self.fields,
            comparer: self.comparer.as_deref(),
        }
    }

    fn filter_admits(&self, table: &Table, record: RecordId) -> Result<bool> {
        match &self.filter {
            None => Ok(true),
            Some(f) => {
                let row = table.row_of_record(record);
                let version = table.version_of_record(record);
                f.invoke(table, row, version)
            }
        }
    }

    // --- lookup -----------------------------------------------------------

    /// Binary-searches the sort key. `key` supplies one value per leading
    /// sort field; a prefix of the fields is enough, and widens the span to
    /// every record sharing that prefix.
    pub fn find_records(&self, table: &Table, key: &[Value]) -> Result<RecordRange> {
        ensure!(
            self.comparer.is_none(),
            "cannot key-search an index ordered by a custom comparer"
        );
        ensure!(!self.fields.is_empty(), "index has no sort fields");
        ensure!(!key.is_empty(), "key search needs at least one value");
        ensure!(
            key.len() <= self.fields.len(),
            "composite key has {} values but the index sorts on {} fields",
            key.len(),
            self.fields.len()
        );
        let tree = self.tree.lock();
        let len = tree.len();
        // Where a record stands against the key, in index order. Prefix
        // comparison is monotone over the ordinals, so both span edges
        // binary-search cleanly.
        let probe = |rec: RecordId| -> Ordering {
            for (f, sought) in self.fields.iter().zip(key) {
                let stored = table.record_value(rec, f.column);
                let ord = stored.total_cmp(sought);
                let ord = if f.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        };
        // First ordinal not before the key.
        let mut lo = 0usize;
        let mut hi = len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if probe(tree.key_at(mid)?) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let first = lo;
        // First ordinal past it.
        let mut hi = len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if probe(tree.key_at(mid)?) == Ordering::Greater {
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

    /// Record at a view ordinal.
    pub fn record_at(&self, pos: usize) -> Result<RecordId> {
        self.tree.lock().key_at(pos)
    }

    /// Records across an ordinal span, in view order.
    pub fn get_records(&self, range: RecordRange) -> Result<Vec<RecordId>> {
        let tree = self.tree.lock();
        match range {
            RecordRange::Empty => Ok(Vec::new()),
            RecordRange::Span { min, max } => {
                ensure!(max < tree.len(), "record range {min}..={max} out of bounds");
                Ok(tree.iter_from(min)?.take(max - min + 1).collect())
            }
        }
    }

    /// Rows across an ordinal span, resolved from their records.
    pub fn get_rows(&self, table: &Table, range: RecordRange) -> Result<Vec<crate::rows::RowId>> {
        Ok(self
            .get_records(range)?
            .into_iter()
            .map(|rec| table.row_of_record(rec))
            .collect())
    }

    /// Every resident record, in view order.
    pub fn records(&self) -> Vec<RecordId> {
        self.tree.lock().iter().collect()
    }

    // --- listeners --------------------------------------------------------

    pub fn add_listener(&self, listener: &Arc<dyn IndexListener>) {
        self.listeners.lock().push(Arc::downgrade(listener));
    }

    /// Stops per-record events for a bulk operation.
    pub fn suspend_events(&self) {
        self.suspended.store(true, AtomicOrdering::SeqCst);
    }

    /// Resumes events; anything that happened while suspended collapses
    /// into a single `Reset`.
    pub fn resume_events(&self) {
        self.suspended.store(false, AtomicOrdering::SeqCst);
        if self.dirty_while_suspended.swap(false, AtomicOrdering::SeqCst) {
            self.notify(ListChange::Reset);
        }
    }

    fn notify(&self, change: ListChange) {
        if self.suspended.load(AtomicOrdering::SeqCst) {
            self.dirty_while_suspended.store(true, AtomicOrdering::SeqCst);
            return;
        }
        // Upgrade outside the callback loop so a listener may re-enter the
        // index (or add listeners) without deadlocking.
        let live: Vec<Arc<dyn IndexListener>> = {
            let mut guard = self.listeners.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.list_changed(change);
        }
    }
}
