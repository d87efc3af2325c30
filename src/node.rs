//! B-tree node representation, serialization and the node store.
//!
//! Node layout (all integers big endian):
//!
//! | magic `TREE` | type id u8 | level u8 | child count u16 | left u64 | right u64 |
//! | key 0 | child 0 | key 1 | child 1 | ... | key n-1 | child n-1 | key n | zero padding |
//!
//! Nodes have a fixed size derived from the tree's 2k and the key class' key size.
use std::fmt;

use triomphe::Arc;
use zerocopy::{
    byteorder::big_endian::{U16, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::{
    btree::KeyClass,
    error::{error_corrupt, Error},
    storage::Storage,
    HashSet,
};

pub const NODE_MAGIC: [u8; 4] = *b"TREE";

/// Address used on disk for a missing sibling.
const UNDEF_ADDR: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct NodeHeader {
    magic: [u8; 4],
    type_id: u8,
    level: u8,
    count: U16,
    left: U64,
    right: U64,
}

const HEADER_SIZE: usize = size_of::<NodeHeader>();

/// Immutable parameters shared by every node of one tree.
pub struct SharedTreeInfo<C> {
    pub class: C,
    /// Encoded key size
    pub key_size: usize,
    /// Maximum number of children per node
    pub two_k: usize,
    /// Encoded node size
    pub node_size: usize,
}

impl<C: KeyClass> SharedTreeInfo<C> {
    pub fn new(class: C, k: usize) -> Self {
        let key_size = class.key_size();
        let two_k = 2 * k;
        let node_size = HEADER_SIZE + two_k * (key_size + size_of::<u64>()) + key_size;
        Self {
            class,
            key_size,
            two_k,
            node_size,
        }
    }
}

impl<C> fmt::Debug for SharedTreeInfo<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTreeInfo")
            .field("key_size", &self.key_size)
            .field("two_k", &self.two_k)
            .field("node_size", &self.node_size)
            .finish()
    }
}

/// A decoded node. `keys.len() == children.len() + 1` always holds, an empty node
/// (only ever the root) carries a single placeholder key.
pub struct BTreeNode<C: KeyClass> {
    pub shared: Arc<SharedTreeInfo<C>>,
    pub level: u8,
    pub left: Option<u64>,
    pub right: Option<u64>,
    pub keys: Vec<C::Key>,
    pub children: Vec<u64>,
}

impl<C: KeyClass> Clone for BTreeNode<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            level: self.level,
            left: self.left,
            right: self.right,
            keys: self.keys.clone(),
            children: self.children.clone(),
        }
    }
}

impl<C: KeyClass> fmt::Debug for BTreeNode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTreeNode")
            .field("level", &self.level)
            .field("left", &self.left)
            .field("right", &self.right)
            .field("keys", &self.keys)
            .field("children", &self.children)
            .finish()
    }
}

impl<C: KeyClass> BTreeNode<C> {
    pub fn empty(shared: Arc<SharedTreeInfo<C>>, level: u8) -> Self {
        let keys = vec![shared.class.empty_key()];
        Self {
            shared,
            level,
            left: None,
            right: None,
            keys,
            children: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Binary search for the child whose key range contains `udata`.
    /// Returns the last probed index and its comparison, `Equal` means found.
    pub fn search(&self, udata: &C::Udata) -> (usize, std::cmp::Ordering) {
        use std::cmp::Ordering;
        let class = &self.shared.class;
        let (mut lt, mut rt) = (0, self.children.len());
        let mut idx = 0;
        let mut cmp = Ordering::Less;
        while lt < rt {
            idx = (lt + rt) / 2;
            cmp = class.cmp3(&self.keys[idx], udata, &self.keys[idx + 1]);
            match cmp {
                Ordering::Less => rt = idx,
                Ordering::Greater => lt = idx + 1,
                Ordering::Equal => break,
            }
        }
        (idx, cmp)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let shared = &self.shared;
        debug_assert!(self.children.len() <= shared.two_k);
        debug_assert_eq!(self.keys.len(), self.children.len() + 1);
        out.clear();
        out.resize(shared.node_size, 0);
        let header = NodeHeader {
            magic: NODE_MAGIC,
            type_id: C::TYPE_ID,
            level: self.level,
            count: U16::new(self.children.len() as u16),
            left: U64::new(self.left.unwrap_or(UNDEF_ADDR)),
            right: U64::new(self.right.unwrap_or(UNDEF_ADDR)),
        };
        out[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        let mut pos = HEADER_SIZE;
        for (i, key) in self.keys.iter().enumerate() {
            shared
                .class
                .encode_key(key, &mut out[pos..pos + shared.key_size]);
            pos += shared.key_size;
            if let Some(child) = self.children.get(i) {
                out[pos..pos + 8].copy_from_slice(&child.to_be_bytes());
                pos += 8;
            }
        }
    }

    pub fn decode(shared: &Arc<SharedTreeInfo<C>>, addr: u64, raw: &[u8]) -> Result<Self, Error> {
        let Ok((header, mut rest)) = NodeHeader::ref_from_prefix(raw) else {
            return Err(error_corrupt!("B-tree node {addr} is truncated"));
        };
        if header.magic != NODE_MAGIC {
            return Err(error_corrupt!("B-tree node {addr} has a bad signature"));
        }
        if header.type_id != C::TYPE_ID {
            return Err(error_corrupt!(
                "B-tree node {addr} has type {} expected {}",
                header.type_id,
                C::TYPE_ID
            ));
        }
        let count = header.count.get() as usize;
        if count > shared.two_k {
            return Err(error_corrupt!(
                "B-tree node {addr} has {count} children, max {}",
                shared.two_k
            ));
        }
        if raw.len() < shared.node_size {
            return Err(error_corrupt!("B-tree node {addr} is truncated"));
        }
        let undef = |a: u64| (a != UNDEF_ADDR).then_some(a);
        let mut keys = Vec::with_capacity(count + 1);
        let mut children = Vec::with_capacity(count);
        for i in 0..=count {
            let (key, tail) = rest.split_at(shared.key_size);
            keys.push(shared.class.decode_key(key)?);
            rest = tail;
            if i < count {
                let (child, tail) = rest.split_at(8);
                let child = U64::ref_from_bytes(child)
                    .map_err(|_| error_corrupt!("B-tree node {addr} child {i} unreadable"))?;
                children.push(child.get());
                rest = tail;
            }
        }
        Ok(Self {
            shared: shared.clone(),
            level: header.level,
            left: undef(header.left.get()),
            right: undef(header.right.get()),
            keys,
            children,
        })
    }
}

#[derive(Clone)]
struct NodeWeighter(u64);

impl<C: KeyClass> quick_cache::Weighter<u64, BTreeNode<C>> for NodeWeighter {
    fn weight(&self, _addr: &u64, _node: &BTreeNode<C>) -> u64 {
        self.0
    }
}

/// Node cache and single holder discipline for the nodes of one tree.
///
/// The cache only ever holds clean nodes: dirty nodes are written through
/// when they are unprotected.
pub struct NodeStore<C: KeyClass> {
    shared: Arc<SharedTreeInfo<C>>,
    cache: quick_cache::unsync::Cache<u64, BTreeNode<C>, NodeWeighter>,
    protected: HashSet<u64>,
    scratch: Vec<u8>,
}

impl<C: KeyClass> NodeStore<C> {
    pub fn new(shared: Arc<SharedTreeInfo<C>>, cache_size: usize) -> Self {
        let node_size = shared.node_size as u64;
        let capacity = (cache_size as u64).max(node_size);
        let cache = quick_cache::unsync::Cache::with_weighter(
            (capacity / node_size) as usize,
            capacity,
            NodeWeighter(node_size),
        );
        Self {
            scratch: Vec::with_capacity(shared.node_size),
            shared,
            cache,
            protected: Default::default(),
        }
    }

    pub fn shared(&self) -> &Arc<SharedTreeInfo<C>> {
        &self.shared
    }

    /// Checks out a copy of the node at `addr`.
    /// Protecting a node that is already protected means the tree links loop.
    pub fn protect(&mut self, io: &mut Storage, addr: u64) -> Result<BTreeNode<C>, Error> {
        if !self.protected.insert(addr) {
            return Err(error_corrupt!("B-tree node {addr} reached twice"));
        }
        let result = match self.cache.get(&addr) {
            Some(node) => Ok(node.clone()),
            None => self.load(io, addr),
        };
        if result.is_err() {
            self.protected.remove(&addr);
        }
        result
    }

    fn load(&mut self, io: &mut Storage, addr: u64) -> Result<BTreeNode<C>, Error> {
        let raw = io.read_to_vec(addr, self.shared.node_size)?;
        let node = BTreeNode::decode(&self.shared, addr, &raw)?;
        self.cache.insert(addr, node.clone());
        Ok(node)
    }

    /// Returns a protected node, writing it through if dirty.
    pub fn unprotect(
        &mut self,
        io: &mut Storage,
        addr: u64,
        node: BTreeNode<C>,
        dirty: bool,
    ) -> Result<(), Error> {
        self.protected.remove(&addr);
        if dirty {
            node.encode(&mut self.scratch);
            if let Err(e) = io.write(addr, &self.scratch) {
                self.cache.remove(&addr);
                return Err(e);
            }
        }
        self.cache.insert(addr, node);
        Ok(())
    }

    /// Releases a protected node that wasn't modified.
    #[inline]
    pub fn release(&mut self, addr: u64) {
        self.protected.remove(&addr);
    }

    /// Allocates space for a new node, the address is returned protected.
    pub fn create(&mut self, io: &mut Storage) -> Result<u64, Error> {
        let addr = io.alloc(self.shared.node_size as u64)?;
        self.protected.insert(addr);
        Ok(addr)
    }

    /// Frees a (protected) node.
    pub fn free(&mut self, io: &mut Storage, addr: u64) -> Result<(), Error> {
        self.protected.remove(&addr);
        self.cache.remove(&addr);
        io.free(addr, self.shared.node_size as u64)
    }

    /// Drops protections after a failed operation.
    pub fn clear_protected(&mut self) {
        if !self.protected.is_empty() {
            debug!("Releasing {} protected nodes", self.protected.len());
            self.protected.clear();
        }
    }
}
