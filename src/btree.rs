//! A generic, balanced and sibling linked B-tree.
//!
//! Every node holds `n` children and `n + 1` keys, child `i` covers the key range
//! `[keys[i], keys[i + 1])` as defined by the key class' three way comparison.
//! Boundary keys are mirrored: a node's first and last keys equal the separators
//! around it in the parent and the adjacent keys of its siblings.
//!
//! The meaning of the leaf children (what they address) is entirely up to the
//! [KeyClass], which gets callbacks to create, update and remove them.
use std::{cmp::Ordering, fmt, ops::ControlFlow};

use triomphe::Arc;

use crate::{
    error::{error_corrupt, error_validation, Error},
    node::{BTreeNode, NodeStore, SharedTreeInfo},
    options::SplitRatios,
    storage::Storage,
};

/// Which key of a leaf entry identifies it, the other one is just a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalKey {
    Left,
    Right,
}

/// Outcome of inserting into a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOp {
    /// Nothing to do for the parent
    Noop,
    /// The child address changed in place
    Change,
    /// A new child must be inserted to the left of the current one
    Left,
    /// A new child must be inserted to the right of the current one
    Right,
}

/// Where a new leaf child is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewNodeOp {
    /// The first child of an empty tree
    First,
    Left,
    Right,
}

/// Result of [KeyClass::insert].
#[derive(Debug, Clone, Copy)]
pub struct LeafInsert {
    pub op: InsertOp,
    /// New child address for [InsertOp::Change], [InsertOp::Left] and [InsertOp::Right]
    pub addr: u64,
    pub left_changed: bool,
    pub right_changed: bool,
}

/// Result of [KeyClass::remove].
#[derive(Debug, Clone, Copy)]
pub struct LeafRemove {
    /// Whether the entry must be removed from the tree
    pub remove: bool,
    pub left_changed: bool,
    pub right_changed: bool,
}

/// The key type specialization of a tree.
///
/// `Udata` carries the per call search target (and any in/out values the class needs),
/// `Found` is what a successful lookup returns.
pub trait KeyClass: Send + Sync + Sized + 'static {
    type Key: Clone + fmt::Debug + Send + Sync;
    type Udata;
    type Found;

    /// Node type id stored in every node header
    const TYPE_ID: u8;
    const CRITICAL_KEY: CriticalKey;

    fn key_size(&self) -> usize;
    fn encode_key(&self, key: &Self::Key, out: &mut [u8]);
    fn decode_key(&self, raw: &[u8]) -> Result<Self::Key, Error>;
    /// Placeholder key for empty nodes
    fn empty_key(&self) -> Self::Key;
    /// Total order between keys
    fn cmp2(&self, a: &Self::Key, b: &Self::Key) -> Ordering;
    /// Compares the target in `udata` against the key range delimited by `left` and `right`
    fn cmp3(&self, left: &Self::Key, udata: &Self::Udata, right: &Self::Key) -> Ordering;
    /// Checks whether the leaf child at `addr` is really the requested entry
    fn found(&self, addr: u64, left: &Self::Key, udata: &Self::Udata) -> Option<Self::Found>;
    /// Creates a new leaf child for `udata`, filling `left` (and `right` unless the
    /// new child is inserted to the left of an existing one).
    fn new_node(
        &self,
        io: &mut Storage,
        op: NewNodeOp,
        left: &mut Self::Key,
        udata: &mut Self::Udata,
        right: &mut Self::Key,
    ) -> Result<u64, Error>;
    /// Inserts `udata` into the range of the existing leaf child at `addr`.
    /// `mid` receives the separator key when returning [InsertOp::Left] or [InsertOp::Right].
    fn insert(
        &self,
        io: &mut Storage,
        addr: u64,
        left: &mut Self::Key,
        mid: &mut Self::Key,
        udata: &mut Self::Udata,
        right: &mut Self::Key,
    ) -> Result<LeafInsert, Error>;
    /// Releases whatever the leaf child at `addr` references.
    fn remove(
        &self,
        io: &mut Storage,
        addr: u64,
        left: &mut Self::Key,
        udata: &mut Self::Udata,
        right: &mut Self::Key,
    ) -> Result<LeafRemove, Error>;
}

/// Node statistics of a tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeInfo {
    pub nodes: u64,
    pub node_bytes: u64,
    pub height: u8,
    pub entries: u64,
}

#[derive(Debug)]
struct InsertOutcome {
    op: InsertOp,
    addr: u64,
    left_changed: bool,
    right_changed: bool,
}

#[derive(Debug, Default)]
struct RemoveOutcome {
    found: bool,
    remove: bool,
    left_changed: bool,
    right_changed: bool,
}

pub struct BTree<C: KeyClass> {
    shared: Arc<SharedTreeInfo<C>>,
    store: NodeStore<C>,
    root: u64,
}

impl<C: KeyClass> fmt::Debug for BTree<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root)
            .field("shared", &self.shared)
            .finish()
    }
}

impl<C: KeyClass> BTree<C> {
    /// Creates an empty tree, the root node is allocated and written immediately.
    pub fn create(io: &mut Storage, class: C, k: usize, cache_size: usize) -> Result<Self, Error> {
        if k == 0 || 2 * k > u16::MAX as usize {
            return Err(error_validation!("B-tree k must be in 1..={}", u16::MAX / 2));
        }
        let shared = Arc::new(SharedTreeInfo::new(class, k));
        let mut store = NodeStore::new(shared.clone(), cache_size);
        let root = store.create(io)?;
        store.unprotect(io, root, BTreeNode::empty(shared.clone(), 0), true)?;
        debug!("Created B-tree root {root} {:?}", shared);
        Ok(Self {
            shared,
            store,
            root,
        })
    }

    /// Opens an existing tree rooted at `root`.
    pub fn open(
        io: &mut Storage,
        class: C,
        k: usize,
        root: u64,
        cache_size: usize,
    ) -> Result<Self, Error> {
        let shared = Arc::new(SharedTreeInfo::new(class, k));
        let mut store = NodeStore::new(shared.clone(), cache_size);
        store.protect(io, root)?;
        store.release(root);
        Ok(Self {
            shared,
            store,
            root,
        })
    }

    /// Address of the root node, which never moves.
    #[inline]
    pub fn root(&self) -> u64 {
        self.root
    }

    #[inline]
    pub fn class(&self) -> &C {
        &self.shared.class
    }

    fn protect_child(
        &mut self,
        io: &mut Storage,
        addr: u64,
        parent_level: Option<u8>,
    ) -> Result<BTreeNode<C>, Error> {
        let node = self.store.protect(io, addr)?;
        if let Some(parent_level) = parent_level {
            if parent_level == 0 || node.level != parent_level - 1 {
                self.store.release(addr);
                return Err(error_corrupt!(
                    "B-tree node {addr} has level {} under a level {parent_level} node",
                    node.level
                ));
            }
        }
        Ok(node)
    }

    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if result.is_err() {
            self.store.clear_protected();
        }
        result
    }

    /// Looks up `udata` starting from the root. Not found is `Ok(None)`.
    pub fn find(&mut self, io: &mut Storage, udata: &C::Udata) -> Result<Option<C::Found>, Error> {
        let result = self.find_inner(io, udata);
        self.guard(result)
    }

    fn find_inner(
        &mut self,
        io: &mut Storage,
        udata: &C::Udata,
    ) -> Result<Option<C::Found>, Error> {
        let mut addr = self.root;
        let mut parent_level = None;
        loop {
            let node = self.protect_child(io, addr, parent_level)?;
            self.store.release(addr);
            let (idx, cmp) = node.search(udata);
            if node.children.is_empty() || cmp != Ordering::Equal {
                return Ok(None);
            }
            if node.is_leaf() {
                return Ok(self.shared.class.found(node.children[idx], &node.keys[idx], udata));
            }
            parent_level = Some(node.level);
            addr = node.children[idx];
        }
    }

    /// Inserts (or updates) the entry described by `udata`.
    pub fn insert(
        &mut self,
        io: &mut Storage,
        udata: &mut C::Udata,
        ratios: &SplitRatios,
    ) -> Result<(), Error> {
        let result = self.insert_inner(io, udata, ratios);
        self.guard(result)
    }

    fn insert_inner(
        &mut self,
        io: &mut Storage,
        udata: &mut C::Udata,
        ratios: &SplitRatios,
    ) -> Result<(), Error> {
        let class = &self.shared.class;
        let (mut left, mut mid, mut right) = (class.empty_key(), class.empty_key(), class.empty_key());
        let outcome = self.insert_helper(
            io, self.root, None, &mut left, &mut mid, udata, &mut right, ratios,
        )?;
        match outcome.op {
            InsertOp::Noop => return Ok(()),
            InsertOp::Right => (),
            op => return Err(error_corrupt!("unexpected {op:?} at the B-tree root")),
        }

        // The root split, relocate its left half and rebuild the root in place
        let old_root = self.store.protect(io, self.root)?;
        let mut twin = self.store.protect(io, outcome.addr)?;
        let left = old_root.keys[0].clone();
        let right = twin.keys[twin.len()].clone();
        let relocated = self.store.create(io)?;
        twin.left = Some(relocated);
        self.store.unprotect(io, outcome.addr, twin, true)?;
        let mut new_root = BTreeNode::empty(self.shared.clone(), old_root.level + 1);
        new_root.keys = vec![left, mid, right];
        new_root.children = vec![relocated, outcome.addr];
        trace!(
            "Root split, old root relocated to {relocated}, new height {}",
            new_root.level + 1
        );
        self.store.unprotect(io, relocated, old_root, true)?;
        self.store.unprotect(io, self.root, new_root, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_helper(
        &mut self,
        io: &mut Storage,
        addr: u64,
        parent_level: Option<u8>,
        left: &mut C::Key,
        mid: &mut C::Key,
        udata: &mut C::Udata,
        right: &mut C::Key,
        ratios: &SplitRatios,
    ) -> Result<InsertOutcome, Error> {
        let shared = self.shared.clone();
        let class = &shared.class;
        let mut node = self.protect_child(io, addr, parent_level)?;
        let (mut idx, cmp) = node.search(udata);
        let n = node.len();
        let mut dirty = false;

        let child = if n == 0 {
            if !node.is_leaf() {
                return Err(error_corrupt!("empty B-tree node {addr} at level {}", node.level));
            }
            let (mut first_left, mut first_right) = (class.empty_key(), class.empty_key());
            let child = class.new_node(
                io,
                NewNodeOp::First,
                &mut first_left,
                udata,
                &mut first_right,
            )?;
            node.keys = vec![first_left, first_right];
            node.children = vec![child];
            self.store.unprotect(io, addr, node, true)?;
            return Ok(InsertOutcome {
                op: InsertOp::Noop,
                addr: child,
                left_changed: false,
                right_changed: false,
            });
        } else if cmp == Ordering::Less && idx == 0 && node.is_leaf() {
            // new leftmost entry of the whole tree
            *mid = node.keys[0].clone();
            let child_addr = class.new_node(io, NewNodeOp::Left, &mut node.keys[0], udata, mid)?;
            InsertOutcome {
                op: InsertOp::Left,
                addr: child_addr,
                left_changed: true,
                right_changed: false,
            }
        } else if cmp == Ordering::Greater && idx + 1 >= n && node.is_leaf() {
            // new rightmost entry of the whole tree
            idx = n - 1;
            *mid = node.keys[n].clone();
            let child_addr =
                class.new_node(io, NewNodeOp::Right, mid, udata, &mut node.keys[n])?;
            InsertOutcome {
                op: InsertOp::Right,
                addr: child_addr,
                left_changed: false,
                right_changed: true,
            }
        } else {
            match cmp {
                Ordering::Less if idx == 0 => (),
                Ordering::Greater if idx + 1 >= n => idx = n - 1,
                Ordering::Equal => (),
                _ => {
                    self.store.release(addr);
                    return Err(error_corrupt!("B-tree node {addr} has a gap at child {idx}"));
                }
            }
            let child_addr = node.children[idx];
            let (lo, hi) = node.keys.split_at_mut(idx + 1);
            if node.level > 0 {
                self.insert_helper(
                    io,
                    child_addr,
                    Some(node.level),
                    &mut lo[idx],
                    mid,
                    udata,
                    &mut hi[0],
                    ratios,
                )?
            } else {
                let leaf = class.insert(io, child_addr, &mut lo[idx], mid, udata, &mut hi[0])?;
                InsertOutcome {
                    op: leaf.op,
                    addr: leaf.addr,
                    left_changed: leaf.left_changed,
                    right_changed: leaf.right_changed,
                }
            }
        };

        let mut outcome = InsertOutcome {
            op: InsertOp::Noop,
            addr: 0,
            left_changed: false,
            right_changed: false,
        };
        if child.left_changed {
            dirty = true;
            if idx == 0 {
                *left = node.keys[0].clone();
                outcome.left_changed = true;
            }
        }
        if child.right_changed {
            dirty = true;
            if idx + 1 == n {
                *right = node.keys[n].clone();
                outcome.right_changed = true;
            }
        }

        match child.op {
            InsertOp::Noop => (),
            InsertOp::Change => {
                node.children[idx] = child.addr;
                dirty = true;
            }
            InsertOp::Left | InsertOp::Right => {
                dirty = true;
                if node.len() == shared.two_k {
                    let (twin_addr, mut twin) = self.split(io, addr, &mut node, idx, ratios)?;
                    if idx < node.len() {
                        Self::insert_child(&mut node, idx, child.addr, child.op, mid);
                    } else {
                        let twin_idx = idx - node.len();
                        Self::insert_child(&mut twin, twin_idx, child.addr, child.op, mid);
                    }
                    *mid = twin.keys[0].clone();
                    outcome.op = InsertOp::Right;
                    outcome.addr = twin_addr;
                    self.store.unprotect(io, twin_addr, twin, true)?;
                } else {
                    Self::insert_child(&mut node, idx, child.addr, child.op, mid);
                }
            }
        }

        self.store.unprotect(io, addr, node, dirty)?;
        Ok(outcome)
    }

    fn insert_child(node: &mut BTreeNode<C>, idx: usize, child: u64, op: InsertOp, mid: &C::Key) {
        debug_assert!(node.len() < node.shared.two_k);
        node.keys.insert(idx + 1, mid.clone());
        match op {
            InsertOp::Right => node.children.insert(idx + 1, child),
            InsertOp::Left => node.children.insert(idx, child),
            _ => unreachable!(),
        }
    }

    /// Splits a full node, moving its right part into a new node linked as its right sibling.
    /// The split point is biased by the node position among its siblings.
    fn split(
        &mut self,
        io: &mut Storage,
        addr: u64,
        node: &mut BTreeNode<C>,
        idx: usize,
        ratios: &SplitRatios,
    ) -> Result<(u64, BTreeNode<C>), Error> {
        let two_k = self.shared.two_k;
        let ratio = if node.right.is_none() {
            ratios.right
        } else if node.left.is_none() {
            ratios.left
        } else {
            ratios.middle
        };
        let mut nleft = ((two_k as f64 * ratio) as usize).min(two_k);
        // keep the new child in the node whose child is splitting
        if idx < nleft && nleft == two_k {
            nleft -= 1;
        } else if idx >= nleft && nleft == 0 {
            nleft += 1;
        }

        let twin_addr = self.store.create(io)?;
        let mut twin = BTreeNode::empty(self.shared.clone(), node.level);
        twin.keys = node.keys[nleft..].to_vec();
        node.keys.truncate(nleft + 1);
        twin.children = node.children.split_off(nleft);
        twin.left = Some(addr);
        twin.right = node.right;
        if let Some(right_addr) = node.right {
            let mut sibling = self.store.protect(io, right_addr)?;
            sibling.left = Some(twin_addr);
            self.store.unprotect(io, right_addr, sibling, true)?;
        }
        node.right = Some(twin_addr);
        trace!(
            "Split node {addr} at level {}: {} | {} children, new node {twin_addr}",
            node.level,
            node.len(),
            twin.len()
        );
        Ok((twin_addr, twin))
    }

    /// Removes the entry described by `udata`, returns whether it was found.
    pub fn remove(&mut self, io: &mut Storage, udata: &mut C::Udata) -> Result<bool, Error> {
        let result = self.remove_inner(io, udata);
        self.guard(result)
    }

    fn remove_inner(&mut self, io: &mut Storage, udata: &mut C::Udata) -> Result<bool, Error> {
        let class = &self.shared.class;
        let (mut left, mut right) = (class.empty_key(), class.empty_key());
        let outcome = self.remove_helper(io, self.root, None, &mut left, udata, &mut right)?;
        Ok(outcome.found)
    }

    fn remove_helper(
        &mut self,
        io: &mut Storage,
        addr: u64,
        parent_level: Option<u8>,
        left: &mut C::Key,
        udata: &mut C::Udata,
        right: &mut C::Key,
    ) -> Result<RemoveOutcome, Error> {
        let shared = self.shared.clone();
        let class = &shared.class;
        let mut node = self.protect_child(io, addr, parent_level)?;
        let (idx, cmp) = node.search(udata);
        let n = node.len();
        if n == 0 || cmp != Ordering::Equal {
            self.store.release(addr);
            return Ok(RemoveOutcome::default());
        }

        let child_addr = node.children[idx];
        let child = if node.level > 0 {
            let (lo, hi) = node.keys.split_at_mut(idx + 1);
            let child = self.remove_helper(
                io,
                child_addr,
                Some(node.level),
                &mut lo[idx],
                udata,
                &mut hi[0],
            )?;
            if !child.found {
                self.store.release(addr);
                return Ok(child);
            }
            child
        } else {
            if class.found(child_addr, &node.keys[idx], udata).is_none() {
                self.store.release(addr);
                return Ok(RemoveOutcome::default());
            }
            let (lo, hi) = node.keys.split_at_mut(idx + 1);
            let leaf = class.remove(io, child_addr, &mut lo[idx], udata, &mut hi[0])?;
            RemoveOutcome {
                found: true,
                remove: leaf.remove,
                left_changed: leaf.left_changed,
                right_changed: leaf.right_changed,
            }
        };

        let mut outcome = RemoveOutcome {
            found: true,
            ..Default::default()
        };
        let mut dirty = false;
        let mut first_changed = false;
        let mut last_changed = false;
        if child.left_changed {
            dirty = true;
            first_changed |= idx == 0;
        }
        if child.right_changed {
            dirty = true;
            last_changed |= idx + 1 == n;
        }

        if child.remove {
            dirty = true;
            if n == 1 {
                if parent_level.is_none() {
                    // the root is never freed, it becomes an empty leaf
                    node.children.clear();
                    node.keys.truncate(1);
                    node.level = 0;
                    trace!("B-tree root {addr} emptied");
                } else {
                    self.collapse(io, addr, node)?;
                    outcome.remove = true;
                    return Ok(outcome);
                }
            } else {
                match C::CRITICAL_KEY {
                    CriticalKey::Left => {
                        node.keys.remove(idx);
                        node.children.remove(idx);
                        first_changed |= idx == 0;
                    }
                    CriticalKey::Right => {
                        node.keys.remove(idx + 1);
                        node.children.remove(idx);
                        last_changed |= idx + 1 == n;
                    }
                }
            }
        }

        if !node.children.is_empty() {
            if first_changed {
                *left = node.keys[0].clone();
                outcome.left_changed = true;
                if let Some(sibling_addr) = node.left {
                    let mut sibling = self.store.protect(io, sibling_addr)?;
                    let last = sibling.len();
                    sibling.keys[last] = node.keys[0].clone();
                    self.store.unprotect(io, sibling_addr, sibling, true)?;
                }
            }
            if last_changed {
                *right = node.keys[node.len()].clone();
                outcome.right_changed = true;
                if let Some(sibling_addr) = node.right {
                    let mut sibling = self.store.protect(io, sibling_addr)?;
                    sibling.keys[0] = node.keys[node.len()].clone();
                    self.store.unprotect(io, sibling_addr, sibling, true)?;
                }
            }
        }
        self.store.unprotect(io, addr, node, dirty)?;
        Ok(outcome)
    }

    /// Unlinks and frees a non root node that lost its last child.
    /// The boundary key that survives in the parent is mirrored into the sibling that
    /// takes over the node's key range.
    fn collapse(&mut self, io: &mut Storage, addr: u64, node: BTreeNode<C>) -> Result<(), Error> {
        let (first, last) = (&node.keys[0], &node.keys[node.keys.len() - 1]);
        if let Some(left_addr) = node.left {
            let mut sibling = self.store.protect(io, left_addr)?;
            sibling.right = node.right;
            if C::CRITICAL_KEY == CriticalKey::Left {
                let sibling_last = sibling.len();
                sibling.keys[sibling_last] = last.clone();
            }
            self.store.unprotect(io, left_addr, sibling, true)?;
        }
        if let Some(right_addr) = node.right {
            let mut sibling = self.store.protect(io, right_addr)?;
            sibling.left = node.left;
            if C::CRITICAL_KEY == CriticalKey::Right {
                sibling.keys[0] = first.clone();
            }
            self.store.unprotect(io, right_addr, sibling, true)?;
        }
        trace!("Collapsed B-tree node {addr} at level {}", node.level);
        self.store.free(io, addr)
    }

    /// Visits every leaf entry in key order as `(left key, child address, right key)`.
    ///
    /// Descends the leftmost spine then follows the right sibling links.
    /// Node contents are copied out before calling `op`, which may stop the iteration.
    pub fn iterate<F>(&mut self, io: &mut Storage, op: F) -> Result<ControlFlow<()>, Error>
    where
        F: FnMut(&C::Key, u64, &C::Key) -> Result<ControlFlow<()>, Error>,
    {
        let result = self.iterate_inner(io, op);
        self.guard(result)
    }

    fn iterate_inner<F>(&mut self, io: &mut Storage, mut op: F) -> Result<ControlFlow<()>, Error>
    where
        F: FnMut(&C::Key, u64, &C::Key) -> Result<ControlFlow<()>, Error>,
    {
        let mut addr = self.root;
        let mut parent_level = None;
        loop {
            let node = self.protect_child(io, addr, parent_level)?;
            self.store.release(addr);
            if node.is_leaf() || node.children.is_empty() {
                break;
            }
            parent_level = Some(node.level);
            addr = node.children[0];
        }

        let mut prev = None;
        let mut next = Some(addr);
        while let Some(addr) = next {
            let node = self.store.protect(io, addr)?;
            self.store.release(addr);
            if node.left != prev || !node.is_leaf() {
                return Err(error_corrupt!("broken sibling chain at B-tree node {addr}"));
            }
            for (i, child) in node.children.iter().enumerate() {
                if op(&node.keys[i], *child, &node.keys[i + 1])?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            prev = Some(addr);
            next = node.right;
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Number of leaf entries.
    pub fn len(&mut self, io: &mut Storage) -> Result<u64, Error> {
        let mut len = 0;
        self.iterate(io, |_, _, _| {
            len += 1;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(len)
    }

    pub fn info(&mut self, io: &mut Storage) -> Result<TreeInfo, Error> {
        let mut info = TreeInfo::default();
        let result = self.walk(io, self.root, None, &mut |node: &BTreeNode<C>| {
            info.nodes += 1;
            info.height = info.height.max(node.level + 1);
            if node.is_leaf() {
                info.entries += node.len() as u64;
            }
            Ok(())
        });
        self.guard(result)?;
        info.node_bytes = info.nodes * self.shared.node_size as u64;
        Ok(info)
    }

    /// Pre order traversal of every node.
    fn walk(
        &mut self,
        io: &mut Storage,
        addr: u64,
        parent_level: Option<u8>,
        visit: &mut dyn FnMut(&BTreeNode<C>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let node = self.protect_child(io, addr, parent_level)?;
        self.store.release(addr);
        visit(&node)?;
        if !node.is_leaf() {
            for child in &node.children {
                self.walk(io, *child, Some(node.level), visit)?;
            }
        }
        Ok(())
    }

    /// Full structural check: key order, levels, separators and sibling links.
    pub fn validate(&mut self, io: &mut Storage) -> Result<(), Error> {
        let result = self.validate_node(io, self.root, None, None);
        self.guard(result)
    }

    fn validate_node(
        &mut self,
        io: &mut Storage,
        addr: u64,
        parent_level: Option<u8>,
        bounds: Option<(&C::Key, &C::Key)>,
    ) -> Result<(), Error> {
        let shared = self.shared.clone();
        let class = &shared.class;
        let node = self.protect_child(io, addr, parent_level)?;
        self.store.release(addr);
        if node.children.is_empty() {
            if parent_level.is_some() || !node.is_leaf() {
                return Err(error_corrupt!("empty non root B-tree node {addr}"));
            }
            return Ok(());
        }
        if parent_level.is_none() && (node.left.is_some() || node.right.is_some()) {
            return Err(error_corrupt!("B-tree root {addr} has siblings"));
        }
        for pair in node.keys.windows(2) {
            if class.cmp2(&pair[0], &pair[1]) != Ordering::Less {
                return Err(error_corrupt!(
                    "B-tree node {addr} keys out of order {:?} {:?}",
                    pair[0],
                    pair[1]
                ));
            }
        }
        if let Some((lo, hi)) = bounds {
            if class.cmp2(lo, &node.keys[0]) != Ordering::Equal
                || class.cmp2(hi, &node.keys[node.len()]) != Ordering::Equal
            {
                return Err(error_corrupt!("B-tree node {addr} bounds differ from its parent"));
            }
        }
        if let Some(left_addr) = node.left {
            let sibling = self.store.protect(io, left_addr)?;
            self.store.release(left_addr);
            if sibling.right != Some(addr)
                || sibling.level != node.level
                || class.cmp2(&sibling.keys[sibling.len()], &node.keys[0]) != Ordering::Equal
            {
                return Err(error_corrupt!("B-tree node {addr} left sibling mismatch"));
            }
        }
        if !node.is_leaf() {
            for (i, child) in node.children.iter().enumerate() {
                self.validate_node(
                    io,
                    *child,
                    Some(node.level),
                    Some((&node.keys[i], &node.keys[i + 1])),
                )?;
            }
        }
        Ok(())
    }

    /// Deletes the whole tree, releasing every leaf entry through the key class.
    pub fn delete(mut self, io: &mut Storage, udata: &mut C::Udata) -> Result<(), Error> {
        let root = self.root;
        let result = self.delete_helper(io, root, None, udata);
        self.guard(result)
    }

    fn delete_helper(
        &mut self,
        io: &mut Storage,
        addr: u64,
        parent_level: Option<u8>,
        udata: &mut C::Udata,
    ) -> Result<(), Error> {
        let shared = self.shared.clone();
        let mut node = self.protect_child(io, addr, parent_level)?;
        if node.is_leaf() {
            for i in 0..node.len() {
                let (lo, hi) = node.keys.split_at_mut(i + 1);
                shared
                    .class
                    .remove(io, node.children[i], &mut lo[i], udata, &mut hi[0])?;
            }
        } else {
            for child in node.children.clone() {
                self.delete_helper(io, child, Some(node.level), udata)?;
            }
        }
        self.store.free(io, addr)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::{freespace::FreeSpace, fs::MemFile};

    /// Right critical test class: each entry is a u64 key `k` addressed by the child,
    /// and is identified by its right key.
    pub struct U64Keys;

    pub struct U64Udata {
        pub key: u64,
        pub value: u64,
    }

    impl KeyClass for U64Keys {
        type Key = u64;
        type Udata = U64Udata;
        type Found = u64;

        const TYPE_ID: u8 = 200;
        const CRITICAL_KEY: CriticalKey = CriticalKey::Right;

        fn key_size(&self) -> usize {
            8
        }

        fn encode_key(&self, key: &u64, out: &mut [u8]) {
            out.copy_from_slice(&key.to_be_bytes());
        }

        fn decode_key(&self, raw: &[u8]) -> Result<u64, Error> {
            Ok(u64::from_be_bytes(raw.try_into().map_err(|_| error_corrupt!("key"))?))
        }

        fn empty_key(&self) -> u64 {
            0
        }

        fn cmp2(&self, a: &u64, b: &u64) -> Ordering {
            a.cmp(b)
        }

        // (left, right]
        fn cmp3(&self, left: &u64, udata: &U64Udata, right: &u64) -> Ordering {
            if udata.key <= *left {
                Ordering::Less
            } else if udata.key > *right {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }

        fn found(&self, addr: u64, _left: &u64, udata: &U64Udata) -> Option<u64> {
            (addr >> 32 == udata.key).then_some(addr & u32::MAX as u64)
        }

        fn new_node(
            &self,
            _io: &mut Storage,
            op: NewNodeOp,
            left: &mut u64,
            udata: &mut U64Udata,
            right: &mut u64,
        ) -> Result<u64, Error> {
            // entries are identified by their right key, the left one of the last
            // entry must survive a right insert
            if op != NewNodeOp::Right {
                *left = udata.key.saturating_sub(1);
            }
            *right = udata.key;
            Ok(udata.key << 32 | udata.value)
        }

        fn insert(
            &self,
            _io: &mut Storage,
            addr: u64,
            _left: &mut u64,
            mid: &mut u64,
            udata: &mut U64Udata,
            right: &mut u64,
        ) -> Result<LeafInsert, Error> {
            if addr >> 32 == udata.key {
                return Ok(LeafInsert {
                    op: InsertOp::Change,
                    addr: udata.key << 32 | udata.value,
                    left_changed: false,
                    right_changed: false,
                });
            }
            // keys are strictly below the existing entry, split its range
            debug_assert!(udata.key < *right);
            *mid = udata.key;
            Ok(LeafInsert {
                op: InsertOp::Left,
                addr: udata.key << 32 | udata.value,
                left_changed: false,
                right_changed: false,
            })
        }

        fn remove(
            &self,
            _io: &mut Storage,
            _addr: u64,
            _left: &mut u64,
            _udata: &mut U64Udata,
            _right: &mut u64,
        ) -> Result<LeafRemove, Error> {
            Ok(LeafRemove {
                remove: true,
                left_changed: false,
                right_changed: false,
            })
        }
    }

    fn storage() -> Storage {
        Storage::new(std::sync::Arc::new(MemFile::new()), FreeSpace::default()).unwrap()
    }

    fn udata(key: u64, value: u64) -> U64Udata {
        U64Udata { key, value }
    }

    fn collect(tree: &mut BTree<U64Keys>, io: &mut Storage) -> Vec<(u64, u64)> {
        let mut items = Vec::new();
        tree.iterate(io, |_, child, right| {
            items.push((*right, child & u32::MAX as u64));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        items
    }

    #[test]
    fn test_insert_find_split() {
        let _ = env_logger::try_init();
        let mut io = storage();
        let mut tree = BTree::create(&mut io, U64Keys, 2, 1 << 20).unwrap();
        let ratios = SplitRatios::default();
        for k in (1..=200u64).rev().step_by(3).chain((1..=200).step_by(3)) {
            tree.insert(&mut io, &mut udata(k, k * 10), &ratios).unwrap();
            tree.validate(&mut io).unwrap();
        }
        let items = collect(&mut tree, &mut io);
        assert!(items.windows(2).all(|w| w[0].0 < w[1].0));
        for (k, v) in &items {
            assert_eq!(tree.find(&mut io, &udata(*k, 0)).unwrap(), Some(*v));
            assert_eq!(*v, k * 10);
        }
        assert_eq!(tree.find(&mut io, &udata(1000, 0)).unwrap(), None);
        let info = tree.info(&mut io).unwrap();
        assert!(info.height > 2);
        assert_eq!(info.entries, items.len() as u64);
        assert_eq!(tree.len(&mut io).unwrap(), items.len() as u64);
    }

    #[test]
    fn test_update_in_place() {
        let mut io = storage();
        let mut tree = BTree::create(&mut io, U64Keys, 2, 1 << 20).unwrap();
        let ratios = SplitRatios::default();
        for k in [10, 20, 30, 40, 50] {
            tree.insert(&mut io, &mut udata(k, 1), &ratios).unwrap();
        }
        tree.insert(&mut io, &mut udata(30, 99), &ratios).unwrap();
        assert_eq!(tree.find(&mut io, &udata(30, 0)).unwrap(), Some(99));
        assert_eq!(tree.len(&mut io).unwrap(), 5);
    }

    #[test]
    fn test_remove_collapse_and_reuse() {
        let _ = env_logger::try_init();
        let mut io = storage();
        let mut tree = BTree::create(&mut io, U64Keys, 2, 1 << 20).unwrap();
        let ratios = SplitRatios::default();
        for k in 1..=100u64 {
            tree.insert(&mut io, &mut udata(k, k), &ratios).unwrap();
        }
        let eoa_full = io.space().allocated_bytes();
        for k in (1..=100u64).filter(|k| k % 7 != 0) {
            assert!(tree.remove(&mut io, &mut udata(k, 0)).unwrap());
            tree.validate(&mut io).unwrap();
        }
        assert!(!tree.remove(&mut io, &mut udata(3, 0)).unwrap());
        assert_eq!(
            collect(&mut tree, &mut io),
            (7..=100).step_by(7).map(|k| (k, k)).collect::<Vec<_>>()
        );
        assert!(io.space().allocated_bytes() < eoa_full);
        for k in (7..=100u64).step_by(7) {
            assert!(tree.remove(&mut io, &mut udata(k, 0)).unwrap());
        }
        assert_eq!(tree.len(&mut io).unwrap(), 0);
        assert_eq!(tree.info(&mut io).unwrap().nodes, 1);
        tree.insert(&mut io, &mut udata(5, 5), &ratios).unwrap();
        assert_eq!(tree.find(&mut io, &udata(5, 0)).unwrap(), Some(5));
    }

    #[test]
    fn test_iterate_early_stop() {
        let mut io = storage();
        let mut tree = BTree::create(&mut io, U64Keys, 3, 1 << 20).unwrap();
        for k in 1..=50u64 {
            tree.insert(&mut io, &mut udata(k, k), &SplitRatios::default())
                .unwrap();
        }
        let mut seen = 0;
        let flow = tree
            .iterate(&mut io, |_, _, _| {
                seen += 1;
                Ok(if seen == 10 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert!(flow.is_break());
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_reopen_and_corruption() {
        let file = std::sync::Arc::new(MemFile::new());
        let mut io = Storage::new(file.clone(), FreeSpace::default()).unwrap();
        let mut tree = BTree::create(&mut io, U64Keys, 2, 1 << 20).unwrap();
        for k in 1..=20u64 {
            tree.insert(&mut io, &mut udata(k, k), &SplitRatios::default())
                .unwrap();
        }
        let root = tree.root();
        let mut reopened = BTree::open(&mut io, U64Keys, 2, root, 0).unwrap();
        assert_eq!(reopened.find(&mut io, &udata(17, 0)).unwrap(), Some(17));

        use crate::fs::FsFile;
        file.write_at(b"XXXX", root).unwrap();
        let err = BTree::open(&mut io, U64Keys, 2, root, 0).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_delete_frees_everything() {
        let mut io = storage();
        let mut tree = BTree::create(&mut io, U64Keys, 2, 1 << 20).unwrap();
        for k in 1..=64u64 {
            tree.insert(&mut io, &mut udata(k, k), &SplitRatios::default())
                .unwrap();
        }
        tree.delete(&mut io, &mut udata(0, 0)).unwrap();
        assert_eq!(io.space().allocated_bytes(), 0);
    }

    proptest! {
        #[test]
        fn prop_matches_model(
            ops in prop::collection::vec((1u64..500, any::<bool>()), 1..300),
            k in 1usize..5,
        ) {
            let mut io = storage();
            let mut tree = BTree::create(&mut io, U64Keys, k, 1 << 16).unwrap();
            let mut model = BTreeMap::new();
            let ratios = SplitRatios::default();
            for (i, (key, insert)) in ops.into_iter().enumerate() {
                if insert {
                    tree.insert(&mut io, &mut udata(key, i as u64), &ratios).unwrap();
                    model.insert(key, i as u64);
                } else {
                    let removed = tree.remove(&mut io, &mut udata(key, 0)).unwrap();
                    prop_assert_eq!(removed, model.remove(&key).is_some());
                }
            }
            tree.validate(&mut io).unwrap();
            prop_assert_eq!(collect(&mut tree, &mut io), model.into_iter().collect::<Vec<_>>());
        }
    }
}
