//! # Node Arena
//!
//! Fixed-capacity pages of tree-node slots behind stable packed handles.
//! A [`NodeId`] packs `(page << 16) | slot`, so a node never moves for its
//! lifetime and the tree can store plain integers instead of pointers.
//! `NodeId(0)` is the null sentinel; page 0, slot 0 is permanently reserved
//! so no live node can ever collide with it.
//!
//! ## Page Growth
//!
//! Page capacity follows a tier schedule keyed to the page ordinal — early
//! pages are small so tiny trees stay cheap, later pages grow toward the
//! 16-bit slot limit:
//!
//! ```text
//! pages  0..16   → 32 slots
//! pages 16..64   → 256 slots
//! pages 64..256  → 1024 slots
//! pages 256..1K  → 4096 slots
//! pages 1K..8K   → 8192 slots
//! pages 8K..     → 65536 slots
//! ```
//!
//! ## Allocation
//!
//! Each page keeps a `u64` occupancy bitmap; allocation scans for the first
//! clear bit. A next-free-page cursor remembers where the last allocation
//! succeeded so repeated inserts don't rescan full pages. A page is dropped
//! as soon as its last slot is freed.
//!
//! Stale handles are programming errors: `get`/`free` panic rather than
//! return garbage, matching the crate's fatal treatment of structural
//! corruption.

/// Packed `(page, slot)` handle for one arena slot. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// The null sentinel.
    pub const NIL: NodeId = NodeId(0);

    #[inline]
    fn new(page: usize, slot: usize) -> NodeId {
        debug_assert!(page <= u16::MAX as usize && slot <= u16::MAX as usize);
        NodeId(((page as u32) << 16) | slot as u32)
    }

    #[inline]
    fn page(self) -> usize {
        (self.0 >> 16) as usize
    }

    #[inline]
    fn slot(self) -> usize {
        (self.0 & 0xffff) as usize
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == NodeId::NIL
    }
}

/// Capacity of the page at a given ordinal.
fn tier_capacity(page_ordinal: usize) -> usize {
    match page_ordinal {
        0..=15 => 32,
        16..=63 => 256,
        64..=255 => 1024,
        256..=1023 => 4096,
        1024..=8191 => 8192,
        _ => 65536,
    }
}

struct NodePage<T> {
    slots: Box<[T]>,
    bitmap: Box<[u64]>,
    used: u32,
}

impl<T: Default + Clone> NodePage<T> {
    fn new(capacity: usize, reserve_slot0: bool) -> Self {
        let words = capacity.div_ceil(64);
        let mut bitmap = vec![0u64; words].into_boxed_slice();
        // Mark bits beyond capacity as occupied so the scan never hands
        // them out.
        let tail = capacity % 64;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }
        let mut used = 0;
        if reserve_slot0 {
            bitmap[0] |= 1;
            used = 1;
        }
        Self {
            slots: vec![T::default(); capacity].into_boxed_slice(),
            bitmap,
            used,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.used as usize == self.capacity()
    }

    /// First clear bit in the occupancy bitmap.
    fn alloc_slot(&mut self) -> usize {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != !0u64 {
                let bit = (!*word).trailing_zeros() as usize;
                *word |= 1u64 << bit;
                self.used += 1;
                return word_idx * 64 + bit;
            }
        }
        unreachable!("alloc_slot called on a full page");
    }

    fn free_slot(&mut self, slot: usize) {
        let word = &mut self.bitmap[slot / 64];
        let bit = 1u64 << (slot % 64);
        assert!(*word & bit != 0, "double free of arena slot {slot}");
        *word &= !bit;
        self.used -= 1;
        self.slots[slot] = T::default();
    }

    fn is_allocated(&self, slot: usize) -> bool {
        slot < self.capacity() && self.bitmap[slot / 64] & (1u64 << (slot % 64)) != 0
    }
}

/// Growable table of node pages.
pub struct NodePages<T> {
    pages: Vec<Option<NodePage<T>>>,
    /// Page ordinal where the last allocation succeeded.
    next_free_page: usize,
    live: usize,
}

impl<T: Default + Clone> NodePages<T> {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            next_free_page: 0,
            live: 0,
        }
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Hands out a fresh slot holding `value`.
    pub fn alloc(&mut self, value: T) -> NodeId {
        let page_idx = self.find_free_page();
        self.next_free_page = page_idx;
        let page = self.pages[page_idx]
            .as_mut()
            .expect("free page cursor points at a dropped page");
        let slot = page.alloc_slot();
        page.slots[slot] = value;
        self.live += 1;
        NodeId::new(page_idx, slot)
    }

    fn find_free_page(&mut self) -> usize {
        // Cursor first, then a full sweep that also reuses dropped page
        // ordinals before growing the table.
        if let Some(Some(page)) = self.pages.get(self.next_free_page) {
            if !page.is_full() {
                return self.next_free_page;
            }
        }
        let mut hole = None;
        for (idx, page) in self.pages.iter().enumerate() {
            match page {
                Some(p) if !p.is_full() => return idx,
                None if hole.is_none() => hole = Some(idx),
                _ => {}
            }
        }
        let idx = hole.unwrap_or_else(|| {
            self.pages.push(None);
            self.pages.len() - 1
        });
        assert!(idx <= u16::MAX as usize, "node arena exhausted: 65536 pages in use");
        self.pages[idx] = Some(NodePage::new(tier_capacity(idx), idx == 0));
        idx
    }

    /// Releases a slot; drops the whole page when it empties.
    pub fn free(&mut self, id: NodeId) {
        assert!(!id.is_nil(), "free of the null sentinel");
        let page = self.pages[id.page()]
            .as_mut()
            .expect("free of a slot on a dropped page");
        page.free_slot(id.slot());
        self.live -= 1;
        // Page 0 keeps the reserved sentinel slot alive and is never dropped.
        if id.page() != 0 && page.used == 0 {
            self.pages[id.page()] = None;
            self.next_free_page = 0;
        }
    }

    pub fn get(&self, id: NodeId) -> &T {
        let page = self.pages[id.page()]
            .as_ref()
            .expect("stale node handle: page dropped");
        assert!(page.is_allocated(id.slot()), "stale node handle {id:?}");
        &page.slots[id.slot()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut T {
        let page = self.pages[id.page()]
            .as_mut()
            .expect("stale node handle: page dropped");
        assert!(page.is_allocated(id.slot()), "stale node handle {id:?}");
        &mut page.slots[id.slot()]
    }

    /// Drops every page.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.next_free_page = 0;
        self.live = 0;
    }
}

impl<T: Default + Clone> Default for NodePages<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_slot_is_never_handed_out() {
        let mut arena = NodePages::<u32>::new();
        let first = arena.alloc(7);
        assert!(!first.is_nil());
        assert_ne!(first, NodeId::NIL);
        assert_eq!(*arena.get(first), 7);
    }

    #[test]
    fn handles_are_stable_across_other_frees() {
        let mut arena = NodePages::<u32>::new();
        let ids: Vec<_> = (0..100u32).map(|i| arena.alloc(i)).collect();
        for id in &ids[10..50] {
            arena.free(*id);
        }
        for (i, id) in ids.iter().enumerate() {
            if !(10..50).contains(&i) {
                assert_eq!(*arena.get(*id), i as u32);
            }
        }
        assert_eq!(arena.len(), 60);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut arena = NodePages::<u32>::new();
        let a = arena.alloc(1);
        let b = arena.alloc(2);
        arena.free(a);
        let c = arena.alloc(3);
        assert_eq!(c, a, "first-free-bit scan should reuse the lowest slot");
        assert_eq!(*arena.get(b), 2);
        assert_eq!(*arena.get(c), 3);
    }

    #[test]
    fn pages_grow_through_tiers() {
        assert_eq!(tier_capacity(0), 32);
        assert_eq!(tier_capacity(15), 32);
        assert_eq!(tier_capacity(16), 256);
        assert_eq!(tier_capacity(64), 1024);
        assert_eq!(tier_capacity(256), 4096);
        assert_eq!(tier_capacity(1024), 8192);
        assert_eq!(tier_capacity(9000), 65536);
    }

    #[test]
    fn emptied_pages_are_dropped_and_reused() {
        let mut arena = NodePages::<u32>::new();
        // Fill past page 0 (31 usable slots there).
        let ids: Vec<_> = (0..40u32).map(|i| arena.alloc(i)).collect();
        // Free everything on page 1.
        for id in ids.iter().filter(|id| id.page() == 1) {
            arena.free(*id);
        }
        // A fresh allocation may land on a reallocated page 1 or in holes
        // on page 0; either way the arena stays coherent.
        let id = arena.alloc(99);
        assert_eq!(*arena.get(id), 99);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut arena = NodePages::<u32>::new();
        let a = arena.alloc(1);
        arena.free(a);
        let b = arena.alloc(2);
        assert_eq!(a, b);
        arena.free(b);
        arena.free(a);
    }

    #[test]
    fn many_allocations_cross_page_boundary() {
        let mut arena = NodePages::<u32>::new();
        let ids: Vec<_> = (0..1000u32).map(|i| arena.alloc(i)).collect();
        assert!(ids.iter().any(|id| id.page() > 0));
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(*arena.get(*id), i as u32);
        }
    }
}
