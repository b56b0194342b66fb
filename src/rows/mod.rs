//! # Records, Versions, and Row State
//!
//! This module defines the versioned row model the index core operates on.
//!
//! ## Record Model
//!
//! A **record** is one immutable snapshot of a row's values, addressed by a
//! dense `u32` [`RecordId`]. A **row** owns up to three record slots:
//!
//! ```text
//! Row
//!  ├── old   — the Original version (state before the pending change)
//!  ├── new   — the Current version (state after the pending change)
//!  └── temp  — the Proposed version (live only inside an edit bracket)
//! ```
//!
//! Records never mutate in place; every row change allocates a fresh record
//! and retargets the slots. Indexes therefore treat a record id as an
//! ordinary comparable key whose sort value is fixed for its lifetime.
//!
//! ## Record State
//!
//! The slot configuration of its owning row gives each record a state:
//!
//! | old slot | new slot | state of record r |
//! |----------|----------|-------------------|
//! | r        | r        | Unchanged         |
//! | —        | r        | Added             |
//! | r        | — (none) | Deleted           |
//! | other    | r        | ModifiedCurrent   |
//! | r        | other    | ModifiedOriginal  |
//!
//! Proposed records carry no state and are never indexed; they enter an
//! index only when an edit commit promotes them to the current slot.
//!
//! ## Row State Filters
//!
//! [`RowStateFilter`] is a bit mask over the five record states. An index
//! configured with a mask admits exactly the records whose state crosses the
//! mask. `CURRENT_ROWS` and `ORIGINAL_ROWS` are the two composite masks a
//! view layer typically asks for.

mod table;

pub use table::{Column, Table, TableBuilder};

use eyre::{ensure, Result};

/// Dense handle for one versioned row snapshot.
pub type RecordId = u32;

/// Dense handle for one row.
pub type RowId = u32;

/// Which version of a row a read should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVersion {
    Original,
    Current,
    Proposed,
    /// Proposed if an edit is in progress, otherwise Current.
    Default,
}

/// Whole-row classification derived from the slot configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Detached,
    Unchanged,
    Added,
    Deleted,
    Modified,
}

/// Per-record classification; the unit the row-state mask tests.
///
/// The discriminant order is the record-state ordinal used as the final
/// sort tie-break: original-side states order after their current-side
/// counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordState {
    Unchanged,
    Added,
    ModifiedCurrent,
    Deleted,
    ModifiedOriginal,
}

impl RecordState {
    /// The mask bit this state occupies.
    #[inline]
    pub fn bit(self) -> u32 {
        match self {
            RecordState::Unchanged => 0x02,
            RecordState::Added => 0x04,
            RecordState::Deleted => 0x08,
            RecordState::ModifiedCurrent => 0x10,
            RecordState::ModifiedOriginal => 0x20,
        }
    }
}

/// Bit mask selecting which record states an index admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowStateFilter(u32);

impl RowStateFilter {
    pub const NONE: RowStateFilter = RowStateFilter(0);
    pub const UNCHANGED: RowStateFilter = RowStateFilter(0x02);
    pub const ADDED: RowStateFilter = RowStateFilter(0x04);
    pub const DELETED: RowStateFilter = RowStateFilter(0x08);
    pub const MODIFIED_CURRENT: RowStateFilter = RowStateFilter(0x10);
    pub const MODIFIED_ORIGINAL: RowStateFilter = RowStateFilter(0x20);
    pub const CURRENT_ROWS: RowStateFilter = RowStateFilter(0x02 | 0x04 | 0x10);
    pub const ORIGINAL_ROWS: RowStateFilter = RowStateFilter(0x02 | 0x08 | 0x20);
    pub const ALL: RowStateFilter = RowStateFilter(0x3e);

    /// True when `state` crosses this mask.
    #[inline]
    pub fn covers(self, state: RecordState) -> bool {
        self.0 & state.bit() != 0
    }

    /// Rejects empty masks and masks with unknown bits.
    pub fn validate(self) -> Result<()> {
        ensure!(self.0 != 0, "row-state filter selects no states");
        ensure!(
            self.0 & !Self::ALL.0 == 0,
            "row-state filter has unsupported bits: {:#x}",
            self.0
        );
        Ok(())
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for RowStateFilter {
    type Output = RowStateFilter;

    fn bitor(self, rhs: RowStateFilter) -> RowStateFilter {
        RowStateFilter(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_masks_cover_expected_states() {
        let m = RowStateFilter::CURRENT_ROWS;
        assert!(m.covers(RecordState::Unchanged));
        assert!(m.covers(RecordState::Added));
        assert!(m.covers(RecordState::ModifiedCurrent));
        assert!(!m.covers(RecordState::Deleted));
        assert!(!m.covers(RecordState::ModifiedOriginal));

        let m = RowStateFilter::ORIGINAL_ROWS;
        assert!(m.covers(RecordState::Unchanged));
        assert!(m.covers(RecordState::Deleted));
        assert!(m.covers(RecordState::ModifiedOriginal));
        assert!(!m.covers(RecordState::Added));
    }

    #[test]
    fn mask_validation() {
        assert!(RowStateFilter::NONE.validate().is_err());
        assert!(RowStateFilter(0x40).validate().is_err());
        assert!(RowStateFilter::ALL.validate().is_ok());
        assert!((RowStateFilter::ADDED | RowStateFilter::DELETED).validate().is_ok());
    }
}
