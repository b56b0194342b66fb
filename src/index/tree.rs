//! # Order-Statistics Red-Black Tree
//!
//! The storage structure behind every index: a red-black tree over arena
//! slots, keyed by caller-supplied comparators, with subtree sizes
//! maintained for O(log n) rank/select and nested "satellite" subtrees for
//! duplicate keys.
//!
//! ## Two-Level Structure
//!
//! The main tree orders keys by `TreeOrdering::compare_node`. When an insert
//! collides with an existing key, the colliding node is promoted into a
//! duplicate-group header: a second-level satellite tree is rooted at its
//! `next` handle and absorbs both records, ordered by
//! `TreeOrdering::compare_satellite`. A header's weight in the main tree is
//! its satellite's size, so
//!
//! ```text
//! subtree_size(n) = subtree_size(left) + subtree_size(right) + weight(n)
//! weight(n)       = satellite_size(n)  if n has a satellite, else 1
//! ```
//!
//! and rank/select address individual records straight through headers. A
//! satellite shrinking to one member collapses back into its header. The
//! header's stored key always names a live member of the group, so
//! main-tree comparisons never touch a freed record.
//!
//! ## Anchors
//!
//! Three kinds of parent link meet at `replace_child`: a normal child link,
//! the main `root`, and a header's `next` pointer anchoring a satellite
//! root. Rotations and transplants go through `replace_child`, which is
//! what re-homes the satellite anchor when a rotation changes which
//! physical node roots a duplicate group. A satellite root's `parent` field
//! points at its header; `is_local_root` distinguishes the two tree levels
//! during fixup so a satellite rebalance never walks into the main tree.
//!
//! ## Access Modes
//!
//! [`TreeMode`] is fixed at construction: `Keyed` trees insert by
//! comparator; `Positional` trees insert by rank only (the mode an index
//! without sort fields uses) and never grow satellites.
//!
//! ## Failure Model
//!
//! Ordinal-out-of-range and stale-version resumption are caller errors
//! (`eyre`). Corrupted links, double frees, and duplicate record insertion
//! are invariant violations and panic.

use std::cmp::Ordering;

use eyre::{ensure, Result};

use crate::index::page::{NodeId, NodePages};

/// Caller-supplied ordering hooks.
pub trait TreeOrdering<K> {
    /// Main-tree ordering.
    fn compare_node(&self, a: &K, b: &K) -> Ordering;
    /// Tie-break ordering among records sharing a main key. Must be total
    /// and must distinguish any two distinct records.
    fn compare_satellite(&self, a: &K, b: &K) -> Ordering;
}

/// Access mode, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    /// Ordinary ordered insertion via `compare_node`.
    Keyed,
    /// Pure positional insertion by rank; no comparators, no satellites.
    Positional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Color {
    Red,
    #[default]
    Black,
}

#[derive(Clone)]
pub(crate) struct Node<K> {
    key: K,
    left: NodeId,
    right: NodeId,
    parent: NodeId,
    /// Satellite tree root when this node heads a duplicate group.
    next: NodeId,
    subtree_size: u32,
    color: Color,
}

impl<K: Default> Default for Node<K> {
    fn default() -> Self {
        Node {
            key: K::default(),
            left: NodeId::NIL,
            right: NodeId::NIL,
            parent: NodeId::NIL,
            next: NodeId::NIL,
            subtree_size: 0,
            color: Color::Black,
        }
    }
}

/// Growable order-statistics red-black tree over an arena of node slots.
pub struct RbTree<K> {
    nodes: NodePages<Node<K>>,
    root: NodeId,
    mode: TreeMode,
    /// Bumped on every structural change; fails fast any enumerator resumed
    /// across it.
    version: u64,
}

impl<K: Copy + Default + PartialEq> RbTree<K> {
    pub fn new(mode: TreeMode) -> Self {
        Self {
            nodes: NodePages::new(),
            root: NodeId::NIL,
            mode,
            version: 0,
        }
    }

    /// Number of records (satellite members counted individually).
    pub fn len(&self) -> usize {
        self.size(self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_nil()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn mode(&self) -> TreeMode {
        self.mode
    }

    /// Drops every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NodeId::NIL;
        self.version += 1;
    }

    // --- low-level accessors ---------------------------------------------

    #[inline]
    fn node(&self, id: NodeId) -> &Node<K> {
        self.nodes.get(id)
    }

    #[inline]
    fn left(&self, id: NodeId) -> NodeId {
        self.node(id).left
    }

    #[inline]
    fn right(&self, id: NodeId) -> NodeId {
        self.node(id).right
    }

    #[inline]
    fn parent(&self, id: NodeId) -> NodeId {
        self.node(id).parent
    }

    #[inline]
    fn color(&self, id: NodeId) -> Color {
        if id.is_nil() {
            Color::Black
        } else {
            self.node(id).color
        }
    }

    #[inline]
    fn set_color(&mut self, id: NodeId, color: Color) {
        debug_assert!(!id.is_nil());
        self.nodes.get_mut(id).color = color;
    }

    #[inline]
    fn size(&self, id: NodeId) -> usize {
        if id.is_nil() {
            0
        } else {
            self.node(id).subtree_size as usize
        }
    }

    /// Contribution of a node itself: its satellite size, or 1.
    #[inline]
    fn weight(&self, id: NodeId) -> usize {
        let next = self.node(id).next;
        if next.is_nil() {
            1
        } else {
            self.size(next)
        }
    }

    fn computed_size(&self, id: NodeId) -> u32 {
        (self.size(self.left(id)) + self.size(self.right(id)) + self.weight(id)) as u32
    }

    /// True when `id` roots its tree level: the main root, or a satellite
    /// root (whose parent field names its header).
    fn is_local_root(&self, id: NodeId) -> bool {
        let p = self.node(id).parent;
        p.is_nil() || self.node(p).next == id
    }

    /// Parent within the same tree level; NIL at a local root.
    fn parent_within(&self, id: NodeId) -> NodeId {
        if self.is_local_root(id) {
            NodeId::NIL
        } else {
            self.node(id).parent
        }
    }

    fn local_root_of(&self, mut id: NodeId) -> NodeId {
        while !self.is_local_root(id) {
            id = self.node(id).parent;
        }
        id
    }

    fn min_node(&self, mut id: NodeId) -> NodeId {
        while !self.left(id).is_nil() {
            id = self.left(id);
        }
        id
    }

    fn max_node(&self, mut id: NodeId) -> NodeId {
        while !self.right(id).is_nil() {
            id = self.right(id);
        }
        id
    }

    // --- structural plumbing ---------------------------------------------

    /// Redirects whichever link addressed `old` — a child pointer, the main
    /// root, or a header's satellite anchor — to `new`.
    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        if parent.is_nil() {
            self.root = new;
            return;
        }
        let p = self.nodes.get_mut(parent);
        if p.next == old {
            p.next = new;
        } else if p.left == old {
            p.left = new;
        } else if p.right == old {
            p.right = new;
        } else {
            panic!("corrupted tree: node is not linked from its parent");
        }
    }

    /// Recomputes subtree sizes from `id` up to the main root, crossing
    /// satellite boundaries through header weights.
    fn fix_sizes_up(&mut self, mut id: NodeId) {
        while !id.is_nil() {
            let s = self.computed_size(id);
            let n = self.nodes.get_mut(id);
            n.subtree_size = s;
            id = n.parent;
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self.right(x);
        debug_assert!(!y.is_nil(), "rotate_left without right child");
        let yl = self.left(y);
        self.nodes.get_mut(x).right = yl;
        if !yl.is_nil() {
            self.nodes.get_mut(yl).parent = x;
        }
        let xp = self.parent(x);
        self.nodes.get_mut(y).parent = xp;
        self.replace_child(xp, x, y);
        self.nodes.get_mut(y).left = x;
        self.nodes.get_mut(x).parent = y;
        let moved = self.node(x).subtree_size;
        self.nodes.get_mut(y).subtree_size = moved;
        let xs = self.computed_size(x);
        self.nodes.get_mut(x).subtree_size = xs;
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self.left(x);
        debug_assert!(!y.is_nil(), "rotate_right without left child");
        let yr = self.right(y);
        self.nodes.get_mut(x).left = yr;
        if !yr.is_nil() {
            self.nodes.get_mut(yr).parent = x;
        }
        let xp = self.parent(x);
        self.nodes.get_mut(y).parent = xp;
        self.replace_child(xp, x, y);
        self.nodes.get_mut(y).right = x;
        self.nodes.get_mut(x).parent = y;
        let moved = self.node(x).subtree_size;
        self.nodes.get_mut(y).subtree_size = moved;
        let xs = self.computed_size(x);
        self.nodes.get_mut(x).subtree_size = xs;
    }

    fn new_node(&mut self, key: K, color: Color) -> NodeId {
        self.nodes.alloc(Node {
            key,
            color,
            subtree_size: 1,
            ..Node::default()
        })
    }

    /// Links a fresh red node under `parent` and rebalances.
    fn attach(&mut self, parent: NodeId, as_left: bool, key: K) -> NodeId {
        let n = self.new_node(key, Color::Red);
        self.nodes.get_mut(n).parent = parent;
        if as_left {
            self.nodes.get_mut(parent).left = n;
        } else {
            self.nodes.get_mut(parent).right = n;
        }
        self.fix_sizes_up(parent);
        self.insert_fixup(n);
        n
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        loop {
            let p = self.parent_within(z);
            if p.is_nil() || self.color(p) == Color::Black {
                break;
            }
            // A red parent is never a local root, so the grandparent sits
            // in the same tree level.
            let gp = self.parent(p);
            let p_is_left = self.left(gp) == p;
            let uncle = if p_is_left { self.right(gp) } else { self.left(gp) };
            if self.color(uncle) == Color::Red {
                self.set_color(p, Color::Black);
                self.set_color(uncle, Color::Black);
                self.set_color(gp, Color::Red);
                z = gp;
                continue;
            }
            if p_is_left {
                if z == self.right(p) {
                    z = p;
                    self.rotate_left(z);
                }
                let p = self.parent(z);
                let gp = self.parent(p);
                self.set_color(p, Color::Black);
                self.set_color(gp, Color::Red);
                self.rotate_right(gp);
            } else {
                if z == self.left(p) {
                    z = p;
                    self.rotate_right(z);
                }
                let p = self.parent(z);
                let gp = self.parent(p);
                self.set_color(p, Color::Black);
                self.set_color(gp, Color::Red);
                self.rotate_left(gp);
            }
            break;
        }
        let r = self.local_root_of(z);
        self.set_color(r, Color::Black);
    }

    // --- keyed insertion --------------------------------------------------

    /// Inserts a key in comparator order, growing a satellite group on a
    /// main-key tie. Returns the handle of the node physically holding the
    /// key.
    pub fn insert(&mut self, key: K, ord: &dyn TreeOrdering<K>) -> NodeId {
        assert_eq!(self.mode, TreeMode::Keyed, "keyed insert on a positional tree");
        self.version += 1;
        if self.root.is_nil() {
            let n = self.new_node(key, Color::Black);
            self.root = n;
            return n;
        }
        let mut x = self.root;
        loop {
            match ord.compare_node(&key, &self.node(x).key) {
                Ordering::Equal => return self.insert_duplicate(x, key, ord),
                Ordering::Less => {
                    let l = self.left(x);
                    if l.is_nil() {
                        return self.attach(x, true, key);
                    }
                    x = l;
                }
                Ordering::Greater => {
                    let r = self.right(x);
                    if r.is_nil() {
                        return self.attach(x, false, key);
                    }
                    x = r;
                }
            }
        }
    }

    fn insert_duplicate(&mut self, header: NodeId, key: K, ord: &dyn TreeOrdering<K>) -> NodeId {
        if self.node(header).next.is_nil() {
            // Promote: the colliding node becomes a group header whose
            // satellite absorbs its key. Weight stays 1, so no size fixes.
            let hkey = self.node(header).key;
            let s = self.new_node(hkey, Color::Black);
            self.nodes.get_mut(s).parent = header;
            self.nodes.get_mut(header).next = s;
        }
        let mut x = self.node(header).next;
        loop {
            match ord.compare_satellite(&key, &self.node(x).key) {
                Ordering::Equal => panic!("record already present in tree"),
                Ordering::Less => {
                    let l = self.left(x);
                    if l.is_nil() {
                        return self.attach(x, true, key);
                    }
                    x = l;
                }
                Ordering::Greater => {
                    let r = self.right(x);
                    if r.is_nil() {
                        return self.attach(x, false, key);
                    }
                    x = r;
                }
            }
        }
    }

    // --- positional insertion ---------------------------------------------

    /// Inserts by rank: the new key lands at ordinal `pos`, or at the end
    /// when `append` is set or `pos` is past the end.
    pub fn insert_at(&mut self, pos: usize, key: K, append: bool) -> NodeId {
        assert_eq!(self.mode, TreeMode::Positional, "positional insert on a keyed tree");
        self.version += 1;
        if self.root.is_nil() {
            let n = self.new_node(key, Color::Black);
            self.root = n;
            return n;
        }
        if append || pos >= self.len() {
            let at = self.max_node(self.root);
            return self.attach(at, false, key);
        }
        let at = self
            .node_by_index(pos)
            .expect("position bounds checked above");
        if self.left(at).is_nil() {
            self.attach(at, true, key)
        } else {
            let pred = self.max_node(self.left(at));
            self.attach(pred, false, key)
        }
    }

    // --- deletion ---------------------------------------------------------

    /// Removes the record matching `key` exactly. Returns false when the
    /// key is not present.
    pub fn delete_key(&mut self, key: &K, ord: &dyn TreeOrdering<K>) -> bool {
        let Some(x) = self.search_main(key, ord) else {
            return false;
        };
        if self.node(x).next.is_nil() {
            // Comparator equality is not identity; a different record may
            // share the sort key.
            if self.node(x).key != *key {
                return false;
            }
            self.version += 1;
            self.rb_delete(x);
            return true;
        }
        let Some(s) = self.search_satellite(x, key, ord) else {
            return false;
        };
        self.version += 1;
        self.rb_delete(s);
        self.after_satellite_delete(x);
        true
    }

    /// Removes the record at ordinal `pos`.
    pub fn delete_at(&mut self, pos: usize) -> Result<()> {
        let n = self.node_by_index(pos)?;
        self.version += 1;
        let local_root = self.local_root_of(n);
        let header = self.node(local_root).parent;
        self.rb_delete(n);
        if !header.is_nil() {
            self.after_satellite_delete(header);
        }
        Ok(())
    }

    /// Collapses a one-member satellite and refreshes the header's
    /// representative key to a live member.
    fn after_satellite_delete(&mut self, header: NodeId) {
        let sroot = self.node(header).next;
        debug_assert!(!sroot.is_nil(), "satellite vanished under its header");
        if self.node(sroot).subtree_size == 1 {
            let k = self.node(sroot).key;
            self.nodes.free(sroot);
            let h = self.nodes.get_mut(header);
            h.next = NodeId::NIL;
            h.key = k;
        } else {
            let k = self.node(sroot).key;
            self.nodes.get_mut(header).key = k;
        }
    }

    fn transplant(&mut self, u: NodeId, v: NodeId) {
        let up = self.parent(u);
        self.replace_child(up, u, v);
        if !v.is_nil() {
            self.nodes.get_mut(v).parent = up;
        }
    }

    /// Standard red-black deletion of one node from its tree level. The
    /// spliced successor keeps its own handle, key, and satellite anchor.
    fn rb_delete(&mut self, z: NodeId) {
        let z_left = self.left(z);
        let z_right = self.right(z);
        let removed_color;
        let x;
        let x_parent;
        if z_left.is_nil() {
            removed_color = self.color(z);
            x = z_right;
            x_parent = self.parent(z);
            self.transplant(z, z_right);
        } else if z_right.is_nil() {
            removed_color = self.color(z);
            x = z_left;
            x_parent = self.parent(z);
            self.transplant(z, z_left);
        } else {
            let y = self.min_node(z_right);
            removed_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(y);
                self.transplant(y, self.right(y));
                self.nodes.get_mut(y).right = z_right;
                self.nodes.get_mut(z_right).parent = y;
            }
            self.transplant(z, y);
            self.nodes.get_mut(y).left = z_left;
            self.nodes.get_mut(z_left).parent = y;
            let zc = self.color(z);
            self.set_color(y, zc);
        }
        // x_parent is the deepest structurally changed node; walking up from
        // it re-settles every affected size, crossing a satellite anchor if
        // the deletion happened inside a duplicate group.
        self.fix_sizes_up(x_parent);
        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }
        self.nodes.free(z);
    }

    fn delete_fixup(&mut self, mut x: NodeId, mut x_parent: NodeId) {
        loop {
            if x.is_nil() {
                if x_parent.is_nil() {
                    break;
                }
            } else if self.color(x) == Color::Red || self.is_local_root(x) {
                break;
            }
            let x_is_left = if x.is_nil() {
                self.left(x_parent).is_nil()
            } else {
                self.left(x_parent) == x
            };
            if x_is_left {
                let mut w = self.right(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent_within(x);
                    continue;
                }
                if self.color(self.right(w)) == Color::Black {
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.set_color(w, Color::Red);
                    self.rotate_right(w);
                    w = self.right(x_parent);
                }
                let pc = self.color(x_parent);
                self.set_color(w, pc);
                self.set_color(x_parent, Color::Black);
                let wr = self.right(w);
                if !wr.is_nil() {
                    self.set_color(wr, Color::Black);
                }
                self.rotate_left(x_parent);
                break;
            } else {
                let mut w = self.left(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent_within(x);
                    continue;
                }
                if self.color(self.left(w)) == Color::Black {
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.set_color(w, Color::Red);
                    self.rotate_left(w);
                    w = self.left(x_parent);
                }
                let pc = self.color(x_parent);
                self.set_color(w, pc);
                self.set_color(x_parent, Color::Black);
                let wl = self.left(w);
                if !wl.is_nil() {
                    self.set_color(wl, Color::Black);
                }
                self.rotate_right(x_parent);
                break;
            }
        }
        if !x.is_nil() {
            self.set_color(x, Color::Black);
        }
    }

    // --- search -----------------------------------------------------------

    /// Main-tree node whose key compares equal, header or plain.
    fn search_main(&self, key: &K, ord: &dyn TreeOrdering<K>) -> Option<NodeId> {
        let mut x = self.root;
        while !x.is_nil() {
            match ord.compare_node(key, &self.node(x).key) {
                Ordering::Equal => return Some(x),
                Ordering::Less => x = self.left(x),
                Ordering::Greater => x = self.right(x),
            }
        }
        None
    }

    fn search_satellite(&self, header: NodeId, key: &K, ord: &dyn TreeOrdering<K>) -> Option<NodeId> {
        let mut x = self.node(header).next;
        while !x.is_nil() {
            match ord.compare_satellite(key, &self.node(x).key) {
                Ordering::Equal => return Some(x),
                Ordering::Less => x = self.left(x),
                Ordering::Greater => x = self.right(x),
            }
        }
        None
    }

    /// The node group matching `key`: `(header, group_size)`.
    pub fn search(&self, key: &K, ord: &dyn TreeOrdering<K>) -> Option<(NodeId, usize)> {
        let h = self.search_main(key, ord)?;
        Some((h, self.weight(h)))
    }

    /// The member node holding exactly `key`, descending into a satellite
    /// group when present.
    pub fn find_member(&self, key: &K, ord: &dyn TreeOrdering<K>) -> Option<NodeId> {
        let h = self.search_main(key, ord)?;
        if self.node(h).next.is_nil() {
            (self.node(h).key == *key).then_some(h)
        } else {
            self.search_satellite(h, key, ord)
        }
    }

    /// In-order predecessor within the node's own tree level.
    fn predecessor_local(&self, n: NodeId) -> NodeId {
        let l = self.left(n);
        if !l.is_nil() {
            return self.max_node(l);
        }
        let mut cur = n;
        loop {
            let p = self.parent_within(cur);
            if p.is_nil() {
                return NodeId::NIL;
            }
            if self.right(p) == cur {
                return p;
            }
            cur = p;
        }
    }

    /// In-order successor within the node's own tree level.
    fn successor_local(&self, n: NodeId) -> NodeId {
        let r = self.right(n);
        if !r.is_nil() {
            return self.min_node(r);
        }
        let mut cur = n;
        loop {
            let p = self.parent_within(cur);
            if p.is_nil() {
                return NodeId::NIL;
            }
            if self.left(p) == cur {
                return p;
            }
            cur = p;
        }
    }

    /// Swaps the key of the exact node holding `old` for `new` without any
    /// structural change. The caller must have proved the two keys order
    /// identically under `compare_node`; within a satellite the swap is
    /// additionally validated against the tie-break order of its neighbors.
    /// Returns false — leaving the tree untouched — when `old` is absent or
    /// the swap would break satellite ordering.
    pub fn replace_key(&mut self, old: &K, new: K, ord: &dyn TreeOrdering<K>) -> bool {
        let Some(x) = self.search_main(old, ord) else {
            return false;
        };
        if self.node(x).next.is_nil() {
            if self.node(x).key != *old {
                return false;
            }
            self.nodes.get_mut(x).key = new;
            return true;
        }
        let Some(s) = self.search_satellite(x, old, ord) else {
            return false;
        };
        let pred = self.predecessor_local(s);
        if !pred.is_nil() && ord.compare_satellite(&new, &self.node(pred).key) != Ordering::Greater {
            return false;
        }
        let succ = self.successor_local(s);
        if !succ.is_nil() && ord.compare_satellite(&new, &self.node(succ).key) != Ordering::Less {
            return false;
        }
        self.nodes.get_mut(s).key = new;
        if self.node(x).key == *old {
            self.nodes.get_mut(x).key = new;
        }
        true
    }

    /// Swaps the key at ordinal `pos` in place. Positional counterpart of
    /// [`RbTree::replace_key`]; the ordinal keeps its place in the sequence.
    pub fn replace_at(&mut self, pos: usize, key: K) -> Result<K> {
        let n = self.node_by_index(pos)?;
        let old = self.node(n).key;
        self.nodes.get_mut(n).key = key;
        Ok(old)
    }

    // --- rank / select ----------------------------------------------------

    /// Ordinal of a member node (satellite members address individually;
    /// for a duplicate-group header this is the ordinal of the group's
    /// first member).
    pub fn index_of_node(&self, n: NodeId) -> usize {
        let mut idx = self.size(self.left(n));
        let mut cur = n;
        loop {
            let p = self.parent_within(cur);
            if p.is_nil() {
                let anchor = self.node(cur).parent;
                if anchor.is_nil() {
                    break;
                }
                // Crossed out of a satellite: continue from its header.
                cur = anchor;
                idx += self.size(self.left(cur));
                continue;
            }
            if self.right(p) == cur {
                idx += self.size(self.left(p)) + self.weight(p);
            }
            cur = p;
        }
        idx
    }

    /// Member node at ordinal `pos`, descending into satellites.
    pub fn node_by_index(&self, pos: usize) -> Result<NodeId> {
        ensure!(
            pos < self.len(),
            "ordinal {pos} out of range for index of {} records",
            self.len()
        );
        let mut x = self.root;
        let mut pos = pos;
        loop {
            let l = self.size(self.left(x));
            if pos < l {
                x = self.left(x);
                continue;
            }
            pos -= l;
            let w = self.weight(x);
            if pos < w {
                let next = self.node(x).next;
                if next.is_nil() {
                    return Ok(x);
                }
                x = next;
                continue;
            }
            pos -= w;
            x = self.right(x);
        }
    }

    pub fn key_of(&self, n: NodeId) -> K {
        self.node(n).key
    }

    /// Key at ordinal `pos`.
    pub fn key_at(&self, pos: usize) -> Result<K> {
        Ok(self.node(self.node_by_index(pos)?).key)
    }

    // --- flattened traversal ----------------------------------------------

    /// First member of the group headed by a main node (the node itself
    /// when it has no satellite).
    fn enter_group(&self, n: NodeId) -> NodeId {
        let s = self.node(n).next;
        if s.is_nil() {
            n
        } else {
            self.min_node(s)
        }
    }

    fn first_member(&self) -> NodeId {
        if self.root.is_nil() {
            NodeId::NIL
        } else {
            self.enter_group(self.min_node(self.root))
        }
    }

    /// Successor of a member in the flattened ascending sequence.
    fn next_member(&self, n: NodeId) -> NodeId {
        let r = self.right(n);
        if !r.is_nil() {
            return self.enter_group(self.min_node(r));
        }
        let mut cur = n;
        loop {
            let p = self.node(cur).parent;
            if p.is_nil() {
                return NodeId::NIL;
            }
            if self.node(p).next == cur {
                // Group exhausted; continue after its header in the main
                // tree.
                return self.next_main_after(p);
            }
            if self.left(p) == cur {
                return self.enter_group(p);
            }
            cur = p;
        }
    }

    fn next_main_after(&self, h: NodeId) -> NodeId {
        let r = self.right(h);
        if !r.is_nil() {
            return self.enter_group(self.min_node(r));
        }
        let mut cur = h;
        loop {
            let p = self.node(cur).parent;
            if p.is_nil() {
                return NodeId::NIL;
            }
            if self.left(p) == cur {
                return self.enter_group(p);
            }
            cur = p;
        }
    }

    /// Ascending enumerator over all members.
    pub fn iter(&self) -> TreeIter<'_, K> {
        TreeIter {
            tree: self,
            current: self.first_member(),
            version: self.version,
        }
    }

    /// Enumerator starting at ordinal `pos`.
    pub fn iter_from(&self, pos: usize) -> Result<TreeIter<'_, K>> {
        let current = if pos == self.len() {
            NodeId::NIL
        } else {
            self.node_by_index(pos)?
        };
        Ok(TreeIter {
            tree: self,
            current,
            version: self.version,
        })
    }

    /// Resumes enumeration at `pos`, failing fast when the tree changed
    /// since `seen_version` was observed.
    pub fn resume_at(&self, pos: usize, seen_version: u64) -> Result<TreeIter<'_, K>> {
        ensure!(
            seen_version == self.version,
            "index modified during enumeration"
        );
        self.iter_from(pos)
    }

    // --- integrity audit --------------------------------------------------

    /// Walks the whole structure asserting every red-black, size, and
    /// satellite invariant. Panics on violation; returns the member count.
    pub fn check_invariants(&self) -> usize {
        if self.root.is_nil() {
            return 0;
        }
        assert_eq!(self.color(self.root), Color::Black, "main root must be black");
        assert!(self.parent(self.root).is_nil(), "main root has a parent");
        let (_, members) = self.check_subtree(self.root, false);
        assert_eq!(members, self.len());
        members
    }

    fn check_subtree(&self, n: NodeId, in_satellite: bool) -> (usize, usize) {
        if n.is_nil() {
            return (1, 0);
        }
        let node = self.node(n);
        if node.color == Color::Red {
            assert_eq!(self.color(node.left), Color::Black, "red node with red left child");
            assert_eq!(self.color(node.right), Color::Black, "red node with red right child");
        }
        if !node.left.is_nil() {
            assert_eq!(self.parent(node.left), n, "left child parent link broken");
        }
        if !node.right.is_nil() {
            assert_eq!(self.parent(node.right), n, "right child parent link broken");
        }
        let (bl, sl) = self.check_subtree(node.left, in_satellite);
        let (br, sr) = self.check_subtree(node.right, in_satellite);
        assert_eq!(bl, br, "black height mismatch");
        let weight = if node.next.is_nil() {
            1
        } else {
            assert!(!in_satellite, "nested satellite tree");
            assert_eq!(self.parent(node.next), n, "satellite anchor broken");
            assert_eq!(self.color(node.next), Color::Black, "satellite root must be black");
            let (_, ssize) = self.check_subtree(node.next, true);
            assert!(ssize >= 2, "satellite with fewer than two members");
            ssize
        };
        assert_eq!(
            node.subtree_size as usize,
            sl + sr + weight,
            "subtree size bookkeeping broken"
        );
        let blacks = bl + if node.color == Color::Black { 1 } else { 0 };
        (blacks, sl + sr + weight)
    }
}

/// Flattened ascending enumerator. Holds a shared borrow of the tree; use
/// [`RbTree::resume_at`] to continue across mutations, which fails fast if
/// the structure changed.
pub struct TreeIter<'a, K> {
    tree: &'a RbTree<K>,
    current: NodeId,
    version: u64,
}

impl<K: Copy + Default + PartialEq> Iterator for TreeIter<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        debug_assert_eq!(self.version, self.tree.version, "tree changed under iterator");
        if self.current.is_nil() {
            return None;
        }
        let key = self.tree.node(self.current).key;
        self.current = self.tree.next_member(self.current);
        Some(key)
    }
}
