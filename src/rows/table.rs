//! # Table: columns, versioned rows, and the shared index registry
//!
//! `Table` owns the column schema, the record store (a slab of immutable
//! value snapshots), the row slot table, and the registry of live indexes.
//! Every mutation retargets row slots to fresh records and fans the
//! resulting record state transitions out to each live index, so indexes
//! stay incrementally consistent without rescans.
//!
//! ## Mutation → index fan-out
//!
//! | operation        | transitions fanned out                              |
//! |------------------|-----------------------------------------------------|
//! | `add_row`        | new: ∅ → Added                                      |
//! | `update_row`     | replace: current-record → fresh record              |
//! | `delete_row`     | current leaves; original → Deleted                  |
//! | `end_edit`       | replace: current-record → proposed record           |
//! | `accept_changes` | original leaves; current → Unchanged                |
//! | `reject_changes` | current leaves; original → Unchanged                |
//!
//! Two-record transitions go through the replace overload so an index can
//! take the in-place key-update fast path when the sort key is provably
//! unchanged.
//!
//! ## Registry locking
//!
//! The index registry is guarded by a `parking_lot::RwLock`: lookups run
//! under an upgradable read lock and only registering or unregistering an
//! index upgrades to the write lock. Tree mutation itself is unsynchronized;
//! the table assumes a single logical mutator (see the concurrency notes in
//! the crate docs). Fan-out snapshots the registry
//! before calling hooks, so a listener re-entering the table cannot deadlock
//! on the registry lock.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::debug;

use crate::index::{Index, IndexField, RowComparer};
use crate::expr::RowPredicate;
use crate::rows::{DataVersion, RecordId, RecordState, RowId, RowState, RowStateFilter};
use crate::types::{DataType, Value};

/// One column of the table schema.
#[derive(Debug, Clone)]
pub struct Column {
    name: String,
    data_type: DataType,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

/// Builder for [`Table`].
pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
}

impl TableBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            data_type,
        });
        self
    }

    pub fn build(self) -> Table {
        let col_map = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Table {
            name: self.name,
            columns: self.columns,
            col_map,
            records: RecordStore::default(),
            rows: Vec::new(),
            free_rows: Vec::new(),
            indexes: RwLock::new(Vec::new()),
        }
    }
}

struct RecordEntry {
    values: Vec<Value>,
    row: RowId,
}

#[derive(Default)]
struct RecordStore {
    entries: Vec<Option<RecordEntry>>,
    free: Vec<RecordId>,
}

impl RecordStore {
    fn alloc(&mut self, values: Vec<Value>, row: RowId) -> RecordId {
        let entry = RecordEntry { values, row };
        if let Some(id) = self.free.pop() {
            self.entries[id as usize] = Some(entry);
            id
        } else {
            self.entries.push(Some(entry));
            (self.entries.len() - 1) as RecordId
        }
    }

    fn free(&mut self, id: RecordId) {
        let slot = self
            .entries
            .get_mut(id as usize)
            .expect("record id out of bounds");
        assert!(slot.take().is_some(), "double free of record {id}");
        self.free.push(id);
    }

    fn entry(&self, id: RecordId) -> &RecordEntry {
        self.entries
            .get(id as usize)
            .and_then(|e| e.as_ref())
            .expect("stale record id")
    }

    fn entry_mut(&mut self, id: RecordId) -> &mut RecordEntry {
        self.entries
            .get_mut(id as usize)
            .and_then(|e| e.as_mut())
            .expect("stale record id")
    }
}

#[derive(Clone, Copy, Default)]
struct RowSlots {
    old: Option<RecordId>,
    new: Option<RecordId>,
    temp: Option<RecordId>,
}

/// In-memory table of versioned rows with live secondary indexes.
pub struct Table {
    name: String,
    columns: Vec<Column>,
    col_map: HashMap<String, usize>,
    records: RecordStore,
    rows: Vec<Option<RowSlots>>,
    free_rows: Vec<RowId>,
    indexes: RwLock<Vec<Arc<Index>>>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column ordinal by name, or None.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_map.get(name).copied()
    }

    /// Ids of all attached rows, in allocation order.
    pub fn row_ids(&self) -> Vec<RowId> {
        (0..self.rows.len() as RowId)
            .filter(|&r| self.rows[r as usize].is_some())
            .collect()
    }

    pub fn row_state(&self, row: RowId) -> RowState {
        let Some(Some(slots)) = self.rows.get(row as usize) else {
            return RowState::Detached;
        };
        match (slots.old, slots.new) {
            (Some(o), Some(n)) if o == n => RowState::Unchanged,
            (Some(_), Some(_)) => RowState::Modified,
            (None, Some(_)) => RowState::Added,
            (Some(_), None) => RowState::Deleted,
            (None, None) => RowState::Detached,
        }
    }

    /// Resolves a row and version to its record, if that version exists.
    pub fn record_for_version(&self, row: RowId, version: DataVersion) -> Option<RecordId> {
        let slots = (*self.rows.get(row as usize)?)?;
        match version {
            DataVersion::Original => slots.old,
            DataVersion::Current => slots.new,
            DataVersion::Proposed => slots.temp,
            DataVersion::Default => slots.temp.or(slots.new),
        }
    }

    /// One cell of a row under the given version.
    pub fn row_value(&self, row: RowId, column: usize, version: DataVersion) -> Result<&Value> {
        ensure!(column < self.columns.len(), "column ordinal {column} out of range");
        let Some(rec) = self.record_for_version(row, version) else {
            bail!("row {row} has no {version:?} version");
        };
        Ok(&self.records.entry(rec).values[column])
    }

    /// One cell of a record snapshot; used by index comparators.
    pub fn record_value(&self, record: RecordId, column: usize) -> &Value {
        &self.records.entry(record).values[column]
    }

    pub fn record_values(&self, record: RecordId) -> &[Value] {
        &self.records.entry(record).values
    }

    /// The row owning a record snapshot.
    pub fn row_of_record(&self, record: RecordId) -> RowId {
        self.records.entry(record).row
    }

    /// The state a record currently occupies, or None for proposed and
    /// detached records.
    pub fn record_state(&self, record: RecordId) -> Option<RecordState> {
        let row = self.records.entry(record).row;
        let slots = (*self.rows.get(row as usize)?)?;
        match (slots.old, slots.new) {
            (Some(o), Some(n)) if o == record && n == record => Some(RecordState::Unchanged),
            (Some(o), Some(_)) if o == record => Some(RecordState::ModifiedOriginal),
            (Some(_), Some(n)) if n == record => Some(RecordState::ModifiedCurrent),
            (Some(o), None) if o == record => Some(RecordState::Deleted),
            (None, Some(n)) if n == record => Some(RecordState::Added),
            _ => None,
        }
    }

    /// The version slot a record occupies within its row.
    pub fn version_of_record(&self, record: RecordId) -> DataVersion {
        let row = self.records.entry(record).row;
        let slots = self.rows[row as usize].unwrap_or_default();
        if slots.temp == Some(record) {
            DataVersion::Proposed
        } else if slots.new == Some(record) {
            DataVersion::Current
        } else {
            DataVersion::Original
        }
    }

    fn check_values(&self, values: &[Value]) -> Result<()> {
        ensure!(
            values.len() == self.columns.len(),
            "expected {} values, got {}",
            self.columns.len(),
            values.len()
        );
        for (col, value) in self.columns.iter().zip(values) {
            ensure!(
                col.data_type.check(value),
                "value {value:?} does not fit column '{}' of type {:?}",
                col.name,
                col.data_type
            );
        }
        Ok(())
    }

    fn alloc_row(&mut self) -> RowId {
        if let Some(row) = self.free_rows.pop() {
            row
        } else {
            self.rows.push(None);
            (self.rows.len() - 1) as RowId
        }
    }

    fn slots(&self, row: RowId) -> Result<RowSlots> {
        match self.rows.get(row as usize) {
            Some(Some(slots)) => Ok(*slots),
            _ => bail!("row {row} is detached"),
        }
    }

    fn set_slots(&mut self, row: RowId, slots: RowSlots) {
        self.rows[row as usize] = Some(slots);
    }

    fn detach_row(&mut self, row: RowId) {
        self.rows[row as usize] = None;
        self.free_rows.push(row);
    }

    // --- mutation API -----------------------------------------------------

    /// Appends a new row in the Added state.
    pub fn add_row(&mut self, values: Vec<Value>) -> Result<RowId> {
        self.check_values(&values)?;
        let row = self.alloc_row();
        let rec = self.records.alloc(values, row);
        self.set_slots(
            row,
            RowSlots {
                old: None,
                new: Some(rec),
                temp: None,
            },
        );
        self.notify_state_change(rec, None, Some(RecordState::Added))?;
        Ok(row)
    }

    /// Replaces the current version of a row with fresh values.
    pub fn update_row(&mut self, row: RowId, values: Vec<Value>) -> Result<()> {
        self.check_values(&values)?;
        let slots = self.slots(row)?;
        ensure!(slots.new.is_some(), "cannot update deleted row {row}");
        let fresh = self.records.alloc(values, row);
        self.commit_current(row, slots, fresh)
    }

    /// Installs `fresh` as the current record of `row`, fanning out the
    /// replace transition implied by the previous slot configuration.
    fn commit_current(&mut self, row: RowId, slots: RowSlots, fresh: RecordId) -> Result<()> {
        match (slots.old, slots.new) {
            (None, Some(prev)) => {
                self.set_slots(row, RowSlots { new: Some(fresh), ..slots });
                self.notify_replace(
                    prev,
                    Some(RecordState::Added),
                    None,
                    fresh,
                    None,
                    Some(RecordState::Added),
                )?;
                self.records.free(prev);
            }
            (Some(o), Some(prev)) if o == prev => {
                self.set_slots(row, RowSlots { new: Some(fresh), ..slots });
                // The original record stays; only its state shifts.
                self.notify_replace(
                    prev,
                    Some(RecordState::Unchanged),
                    Some(RecordState::ModifiedOriginal),
                    fresh,
                    None,
                    Some(RecordState::ModifiedCurrent),
                )?;
            }
            (Some(_), Some(prev)) => {
                self.set_slots(row, RowSlots { new: Some(fresh), ..slots });
                self.notify_replace(
                    prev,
                    Some(RecordState::ModifiedCurrent),
                    None,
                    fresh,
                    None,
                    Some(RecordState::ModifiedCurrent),
                )?;
                self.records.free(prev);
            }
            _ => bail!("cannot update deleted row {row}"),
        }
        Ok(())
    }

    /// Marks a row deleted. An Added row detaches entirely.
    pub fn delete_row(&mut self, row: RowId) -> Result<()> {
        let mut slots = self.slots(row)?;
        ensure!(slots.new.is_some(), "row {row} is already deleted");
        if let Some(temp) = slots.temp.take() {
            self.records.free(temp);
        }
        match (slots.old, slots.new) {
            (None, Some(r)) => {
                self.detach_row(row);
                self.notify_state_change(r, Some(RecordState::Added), None)?;
                self.records.free(r);
            }
            (Some(o), Some(n)) if o == n => {
                self.set_slots(row, RowSlots { new: None, ..slots });
                self.notify_state_change(
                    o,
                    Some(RecordState::Unchanged),
                    Some(RecordState::Deleted),
                )?;
            }
            (Some(o), Some(n)) => {
                self.set_slots(row, RowSlots { new: None, ..slots });
                self.notify_state_change(n, Some(RecordState::ModifiedCurrent), None)?;
                self.notify_state_change(
                    o,
                    Some(RecordState::ModifiedOriginal),
                    Some(RecordState::Deleted),
                )?;
                self.records.free(n);
            }
            _ => unreachable!("checked above"),
        }
        Ok(())
    }

    // --- edit bracket -----------------------------------------------------

    /// Opens an edit bracket: subsequent [`Table::set_edit_value`] calls
    /// write a Proposed record that becomes current on [`Table::end_edit`].
    pub fn begin_edit(&mut self, row: RowId) -> Result<()> {
        let slots = self.slots(row)?;
        ensure!(slots.temp.is_none(), "row {row} already has an edit in progress");
        let Some(current) = slots.new else {
            bail!("cannot edit deleted row {row}");
        };
        let values = self.records.entry(current).values.clone();
        let temp = self.records.alloc(values, row);
        self.set_slots(row, RowSlots { temp: Some(temp), ..slots });
        Ok(())
    }

    /// Writes one cell of the proposed version.
    pub fn set_edit_value(&mut self, row: RowId, column: usize, value: Value) -> Result<()> {
        let slots = self.slots(row)?;
        let Some(temp) = slots.temp else {
            bail!("row {row} has no edit in progress");
        };
        ensure!(column < self.columns.len(), "column ordinal {column} out of range");
        ensure!(
            self.columns[column].data_type.check(&value),
            "value {value:?} does not fit column '{}'",
            self.columns[column].name
        );
        self.records.entry_mut(temp).values[column] = value;
        Ok(())
    }

    /// Commits the proposed record as the row's current version.
    pub fn end_edit(&mut self, row: RowId) -> Result<()> {
        let mut slots = self.slots(row)?;
        let Some(temp) = slots.temp.take() else {
            bail!("row {row} has no edit in progress");
        };
        self.set_slots(row, slots);
        self.commit_current(row, slots, temp)
    }

    /// Discards the proposed record.
    pub fn cancel_edit(&mut self, row: RowId) -> Result<()> {
        let mut slots = self.slots(row)?;
        if let Some(temp) = slots.temp.take() {
            self.set_slots(row, slots);
            self.records.free(temp);
        }
        Ok(())
    }

    // --- change acceptance ------------------------------------------------

    /// Promotes the row's pending change to its permanent state.
    pub fn accept_changes(&mut self, row: RowId) -> Result<()> {
        let slots = self.slots(row)?;
        match (slots.old, slots.new) {
            (Some(o), Some(n)) if o == n => {}
            (None, Some(r)) => {
                self.set_slots(row, RowSlots { old: Some(r), ..slots });
                self.notify_state_change(
                    r,
                    Some(RecordState::Added),
                    Some(RecordState::Unchanged),
                )?;
            }
            (Some(o), Some(n)) => {
                self.set_slots(row, RowSlots { old: Some(n), ..slots });
                self.notify_replace(
                    o,
                    Some(RecordState::ModifiedOriginal),
                    None,
                    n,
                    Some(RecordState::ModifiedCurrent),
                    Some(RecordState::Unchanged),
                )?;
                self.records.free(o);
            }
            (Some(o), None) => {
                self.detach_row(row);
                self.notify_state_change(o, Some(RecordState::Deleted), None)?;
                self.records.free(o);
            }
            (None, None) => bail!("row {row} is detached"),
        }
        Ok(())
    }

    /// Rolls the row back to its original version.
    pub fn reject_changes(&mut self, row: RowId) -> Result<()> {
        self.cancel_edit(row)?;
        let slots = self.slots(row)?;
        match (slots.old, slots.new) {
            (Some(o), Some(n)) if o == n => {}
            (None, Some(r)) => {
                self.detach_row(row);
                self.notify_state_change(r, Some(RecordState::Added), None)?;
                self.records.free(r);
            }
            (Some(o), Some(n)) => {
                self.set_slots(row, RowSlots { new: Some(o), ..slots });
                self.notify_replace(
                    n,
                    Some(RecordState::ModifiedCurrent),
                    None,
                    o,
                    Some(RecordState::ModifiedOriginal),
                    Some(RecordState::Unchanged),
                )?;
                self.records.free(n);
            }
            (Some(o), None) => {
                self.set_slots(row, RowSlots { new: Some(o), ..slots });
                self.notify_state_change(
                    o,
                    Some(RecordState::Deleted),
                    Some(RecordState::Unchanged),
                )?;
            }
            (None, None) => bail!("row {row} is detached"),
        }
        Ok(())
    }

    // --- index registry ---------------------------------------------------

    /// Snapshot of the live index set; taken before fan-out so hooks can
    /// re-enter the table without holding the registry lock.
    pub fn live_indexes(&self) -> Vec<Arc<Index>> {
        self.indexes.read().clone()
    }

    /// Finds a sharable index with an identical configuration, or builds and
    /// registers one. Every live index registers — a private (filtered or
    /// comparer-ordered) one too, since registration is what routes mutation
    /// fan-out to it; only sharable indexes are handed to other consumers.
    /// The returned index carries one reference for the caller; drop it with
    /// [`Index::remove_ref`].
    pub fn get_or_create_index(
        &self,
        fields: Vec<IndexField>,
        mask: RowStateFilter,
        filter: Option<Arc<dyn RowPredicate>>,
        comparer: Option<Arc<dyn RowComparer>>,
    ) -> Result<Arc<Index>> {
        mask.validate()?;
        let guard = self.indexes.upgradable_read();
        if filter.is_none() && comparer.is_none() {
            if let Some(existing) = guard.iter().find(|ix| ix.matches(&fields, mask)) {
                let existing = Arc::clone(existing);
                // Take the reference while still holding the registry lock:
                // a concurrent teardown re-checks the count under the write
                // lock and must see this revival.
                existing.add_ref(self)?;
                return Ok(existing);
            }
        }
        let index = Arc::new(Index::new(fields, mask, filter, comparer));
        {
            let mut write = RwLockUpgradableReadGuard::upgrade(guard);
            write.push(Arc::clone(&index));
            debug!(table = %self.name, sharable = index.is_sharable(), "registered index");
        }
        if let Err(e) = index.add_ref(self) {
            self.indexes.write().retain(|ix| !Arc::ptr_eq(ix, &index));
            return Err(e);
        }
        Ok(index)
    }

    /// Completes the teardown of an index whose reference count hit zero.
    /// The count is re-checked under the registry write lock: a concurrent
    /// `get_or_create_index` may have revived the index between the caller's
    /// decrement and this lock, and a revived index keeps both its
    /// registration and its tree.
    pub(crate) fn retire_index(&self, index: &Index) {
        let mut write = self.indexes.write();
        if index.ref_count() > 0 {
            return;
        }
        write.retain(|ix| !std::ptr::eq(ix.as_ref(), index));
        index.teardown();
        debug!(table = %self.name, "unregistered index");
    }

    /// Forces a full rebuild of every live index.
    pub fn reset_indexes(&self) -> Result<()> {
        for ix in self.live_indexes() {
            ix.reset(self)?;
        }
        Ok(())
    }

    /// Suspends listener notification on every live index for a bulk load.
    pub fn suspend_index_events(&self) {
        for ix in self.live_indexes() {
            ix.suspend_events();
        }
    }

    /// Resumes notification; indexes that changed while suspended emit a
    /// single Reset instead of per-record events.
    pub fn resume_index_events(&self) {
        for ix in self.live_indexes() {
            ix.resume_events();
        }
    }

    fn notify_state_change(
        &self,
        record: RecordId,
        from: Option<RecordState>,
        to: Option<RecordState>,
    ) -> Result<()> {
        for ix in self.live_indexes() {
            ix.record_state_changed(self, record, from, to)?;
        }
        Ok(())
    }

    fn notify_replace(
        &self,
        old_record: RecordId,
        old_from: Option<RecordState>,
        old_to: Option<RecordState>,
        new_record: RecordId,
        new_from: Option<RecordState>,
        new_to: Option<RecordState>,
    ) -> Result<()> {
        for ix in self.live_indexes() {
            ix.records_replaced(
                self, old_record, old_from, old_to, new_record, new_from, new_to,
            )?;
        }
        Ok(())
    }
}
