//! The chunk index: a [BTree] keyed by chunk logical offsets whose leaf children
//! are the file addresses of the (filtered) chunk bytes.
//!
//! Keys are `(stored bytes, filter mask, N x offset)`. A leaf entry is identified by
//! its left key, the right key only bounds its range and for the last entry of the
//! tree it's synthesized one chunk past the left key in every dimension.
use std::{cmp::Ordering, ops::ControlFlow};

use crate::{
    btree::{BTree, CriticalKey, InsertOp, KeyClass, LeafInsert, LeafRemove, NewNodeOp, TreeInfo},
    error::{error_corrupt, error_validation, Error},
    filter::FilterMask,
    options::SplitRatios,
    storage::Storage,
    utils::{disjoint, Coords},
};

/// Node type id of chunk index nodes.
const CHUNK_NODE_TYPE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Stored (post filter) size
    pub nbytes: u32,
    /// Pipeline stages skipped when encoding
    pub filter_mask: FilterMask,
    /// Logical offset of the chunk origin
    pub offset: Coords,
}

/// Where and how a chunk is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub addr: u64,
    pub nbytes: u32,
    pub filter_mask: FilterMask,
}

/// Per call data of chunk index operations.
#[derive(Debug)]
pub struct ChunkUdata {
    /// The target chunk, size and mask are only used when inserting
    pub key: ChunkKey,
    /// Address of the chunk storage after an insert
    pub addr: Option<u64>,
}

/// Key class for chunk offsets of a fixed dimensionality.
#[derive(Debug, Clone)]
pub struct ChunkKeys {
    chunk_dims: Coords,
}

impl ChunkKeys {
    pub fn new(chunk_dims: Coords) -> Self {
        Self { chunk_dims }
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.chunk_dims.len()
    }

    #[inline]
    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }
}

impl KeyClass for ChunkKeys {
    type Key = ChunkKey;
    type Udata = ChunkUdata;
    type Found = ChunkRecord;

    const TYPE_ID: u8 = CHUNK_NODE_TYPE;
    const CRITICAL_KEY: CriticalKey = CriticalKey::Left;

    fn key_size(&self) -> usize {
        4 + 4 + 8 * self.ndims()
    }

    fn encode_key(&self, key: &ChunkKey, out: &mut [u8]) {
        out[0..4].copy_from_slice(&key.nbytes.to_be_bytes());
        out[4..8].copy_from_slice(&key.filter_mask.bits().to_be_bytes());
        for (dst, o) in out[8..].chunks_exact_mut(8).zip(&key.offset) {
            dst.copy_from_slice(&o.to_be_bytes());
        }
    }

    fn decode_key(&self, raw: &[u8]) -> Result<ChunkKey, Error> {
        if raw.len() != self.key_size() {
            return Err(error_corrupt!("chunk key of {} bytes", raw.len()));
        }
        let u32_at = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(ChunkKey {
            nbytes: u32_at(0),
            filter_mask: FilterMask::from_bits_retain(u32_at(4)),
            offset: raw[8..]
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap_or_default()))
                .collect(),
        })
    }

    fn empty_key(&self) -> ChunkKey {
        ChunkKey {
            nbytes: 0,
            filter_mask: FilterMask::empty(),
            offset: smallvec::smallvec![0; self.ndims()],
        }
    }

    fn cmp2(&self, a: &ChunkKey, b: &ChunkKey) -> Ordering {
        a.offset.as_slice().cmp(b.offset.as_slice())
    }

    fn cmp3(&self, left: &ChunkKey, udata: &ChunkUdata, right: &ChunkKey) -> Ordering {
        let target = udata.key.offset.as_slice();
        if target < left.offset.as_slice() {
            Ordering::Less
        } else if target >= right.offset.as_slice() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    fn found(&self, addr: u64, left: &ChunkKey, udata: &ChunkUdata) -> Option<ChunkRecord> {
        (left.offset == udata.key.offset).then_some(ChunkRecord {
            addr,
            nbytes: left.nbytes,
            filter_mask: left.filter_mask,
        })
    }

    fn new_node(
        &self,
        io: &mut Storage,
        op: NewNodeOp,
        left: &mut ChunkKey,
        udata: &mut ChunkUdata,
        right: &mut ChunkKey,
    ) -> Result<u64, Error> {
        let addr = io.alloc(udata.key.nbytes as u64)?;
        udata.addr = Some(addr);
        *left = udata.key.clone();
        // the right key may already be the left key of the next chunk
        if op != NewNodeOp::Left {
            *right = ChunkKey {
                nbytes: 0,
                filter_mask: FilterMask::empty(),
                offset: udata
                    .key
                    .offset
                    .iter()
                    .zip(&self.chunk_dims)
                    .map(|(o, d)| o + d)
                    .collect(),
            };
        }
        Ok(addr)
    }

    fn insert(
        &self,
        io: &mut Storage,
        addr: u64,
        left: &mut ChunkKey,
        mid: &mut ChunkKey,
        udata: &mut ChunkUdata,
        _right: &mut ChunkKey,
    ) -> Result<LeafInsert, Error> {
        let key = &udata.key;
        if key.offset.as_slice() < left.offset.as_slice() {
            return Err(error_corrupt!(
                "chunk {:?} routed before entry {:?}",
                key.offset,
                left.offset
            ));
        }
        if key.offset == left.offset && left.nbytes > 0 {
            // already exists, storage is reallocated if the size changed
            let mut result = LeafInsert {
                op: InsertOp::Noop,
                addr,
                left_changed: true,
                right_changed: false,
            };
            if left.nbytes != key.nbytes {
                io.free(addr, left.nbytes as u64)?;
                result.addr = io.alloc(key.nbytes as u64)?;
                result.op = InsertOp::Change;
                trace!(
                    "Chunk {:?} reallocated {} -> {} bytes at {}",
                    key.offset,
                    left.nbytes,
                    key.nbytes,
                    result.addr
                );
            }
            udata.addr = Some(result.addr);
            left.nbytes = key.nbytes;
            left.filter_mask = key.filter_mask;
            Ok(result)
        } else if disjoint(&left.offset, &key.offset, &self.chunk_dims) {
            // a new chunk to the right of this one
            *mid = key.clone();
            let new_addr = io.alloc(key.nbytes as u64)?;
            udata.addr = Some(new_addr);
            Ok(LeafInsert {
                op: InsertOp::Right,
                addr: new_addr,
                left_changed: false,
                right_changed: false,
            })
        } else {
            Err(error_validation!(
                "chunk {:?} overlaps chunk {:?}",
                key.offset,
                left.offset
            ))
        }
    }

    fn remove(
        &self,
        io: &mut Storage,
        addr: u64,
        left: &mut ChunkKey,
        _udata: &mut ChunkUdata,
        _right: &mut ChunkKey,
    ) -> Result<LeafRemove, Error> {
        io.free(addr, left.nbytes as u64)?;
        Ok(LeafRemove {
            remove: true,
            left_changed: false,
            right_changed: false,
        })
    }
}

/// Maps chunk origins to their storage.
#[derive(Debug)]
pub struct ChunkIndex {
    tree: BTree<ChunkKeys>,
}

impl ChunkIndex {
    pub fn create(
        io: &mut Storage,
        chunk_dims: Coords,
        k: usize,
        cache_size: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            tree: BTree::create(io, ChunkKeys::new(chunk_dims), k, cache_size)?,
        })
    }

    pub fn open(
        io: &mut Storage,
        chunk_dims: Coords,
        k: usize,
        root: u64,
        cache_size: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            tree: BTree::open(io, ChunkKeys::new(chunk_dims), k, root, cache_size)?,
        })
    }

    #[inline]
    pub fn root(&self) -> u64 {
        self.tree.root()
    }

    #[inline]
    pub fn chunk_dims(&self) -> &[u64] {
        self.tree.class().chunk_dims()
    }

    fn udata(&self, offset: &[u64], nbytes: u32, filter_mask: FilterMask) -> Result<ChunkUdata, Error> {
        let chunk_dims = self.chunk_dims();
        if offset.len() != chunk_dims.len() {
            return Err(error_validation!(
                "chunk offset {offset:?} has rank {} expected {}",
                offset.len(),
                chunk_dims.len()
            ));
        }
        if offset.iter().zip(chunk_dims).any(|(o, d)| o % d != 0) {
            return Err(error_validation!(
                "chunk offset {offset:?} isn't aligned to {chunk_dims:?}"
            ));
        }
        Ok(ChunkUdata {
            key: ChunkKey {
                nbytes,
                filter_mask,
                offset: offset.into(),
            },
            addr: None,
        })
    }

    /// Storage of the chunk at `offset`, `None` if it was never allocated.
    pub fn chunk_record(
        &mut self,
        io: &mut Storage,
        offset: &[u64],
    ) -> Result<Option<ChunkRecord>, Error> {
        let udata = self.udata(offset, 0, FilterMask::empty())?;
        self.tree.find(io, &udata)
    }

    /// Inserts or updates the chunk at `offset`, (re)allocating `nbytes` of storage.
    /// Returns the chunk address.
    pub fn insert(
        &mut self,
        io: &mut Storage,
        offset: &[u64],
        nbytes: u32,
        filter_mask: FilterMask,
        ratios: &SplitRatios,
    ) -> Result<u64, Error> {
        let mut udata = self.udata(offset, nbytes, filter_mask)?;
        self.tree.insert(io, &mut udata, ratios)?;
        udata
            .addr
            .ok_or_else(|| error_corrupt!("chunk {offset:?} insert produced no address"))
    }

    /// Removes the chunk at `offset` freeing its storage, returns whether it existed.
    pub fn remove(&mut self, io: &mut Storage, offset: &[u64]) -> Result<bool, Error> {
        let mut udata = self.udata(offset, 0, FilterMask::empty())?;
        self.tree.remove(io, &mut udata)
    }

    /// Visits every chunk in offset order.
    pub fn iterate<F>(&mut self, io: &mut Storage, mut op: F) -> Result<ControlFlow<()>, Error>
    where
        F: FnMut(&[u64], ChunkRecord) -> Result<ControlFlow<()>, Error>,
    {
        self.tree.iterate(io, |left, addr, _right| {
            op(
                &left.offset,
                ChunkRecord {
                    addr,
                    nbytes: left.nbytes,
                    filter_mask: left.filter_mask,
                },
            )
        })
    }

    pub fn records(&mut self, io: &mut Storage) -> Result<Vec<(Coords, ChunkRecord)>, Error> {
        let mut result = Vec::new();
        self.iterate(io, |offset, record| {
            result.push((Coords::from(offset), record));
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(result)
    }

    /// Sum of the stored chunk sizes.
    pub fn allocated_bytes(&mut self, io: &mut Storage) -> Result<u64, Error> {
        let mut total = 0;
        self.iterate(io, |_, record| {
            total += record.nbytes as u64;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(total)
    }

    pub fn len(&mut self, io: &mut Storage) -> Result<u64, Error> {
        self.tree.len(io)
    }

    pub fn info(&mut self, io: &mut Storage) -> Result<TreeInfo, Error> {
        self.tree.info(io)
    }

    pub fn validate(&mut self, io: &mut Storage) -> Result<(), Error> {
        self.tree.validate(io)
    }

    /// Deletes the index, freeing every chunk and node.
    pub fn delete(self, io: &mut Storage) -> Result<(), Error> {
        let mut udata = ChunkUdata {
            key: self.tree.class().empty_key(),
            addr: None,
        };
        self.tree.delete(io, &mut udata)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::seq::SliceRandom;

    use super::*;
    use crate::{freespace::FreeSpace, fs::MemFile, utils::test_rng};

    fn storage() -> Storage {
        Storage::new(Arc::new(MemFile::new()), FreeSpace::default()).unwrap()
    }

    fn grid(extent: [u64; 2], chunk: [u64; 2]) -> Vec<Coords> {
        let mut result = Vec::new();
        for i in (0..extent[0]).step_by(chunk[0] as usize) {
            for j in (0..extent[1]).step_by(chunk[1] as usize) {
                result.push(smallvec::smallvec![i, j]);
            }
        }
        result
    }

    #[test]
    fn test_random_order_insert_find() {
        let _ = env_logger::try_init();
        let mut io = storage();
        let mut index = ChunkIndex::create(&mut io, [10, 10].into(), 2, 1 << 20).unwrap();
        let mut offsets = grid([200, 150], [10, 10]);
        offsets.shuffle(&mut test_rng());
        let ratios = SplitRatios::default();
        let mut addrs = Vec::new();
        for (i, offset) in offsets.iter().enumerate() {
            let nbytes = 100 + i as u32;
            let addr = index
                .insert(&mut io, offset, nbytes, FilterMask::empty(), &ratios)
                .unwrap();
            addrs.push(addr);
        }
        index.validate(&mut io).unwrap();
        for (i, offset) in offsets.iter().enumerate() {
            let record = index.chunk_record(&mut io, offset).unwrap().unwrap();
            assert_eq!(record.addr, addrs[i]);
            assert_eq!(record.nbytes, 100 + i as u32);
        }
        let records = index.records(&mut io).unwrap();
        assert_eq!(records.len(), offsets.len());
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(
            index.allocated_bytes(&mut io).unwrap(),
            (0..offsets.len() as u64).map(|i| 100 + i).sum::<u64>()
        );
        assert_eq!(
            index.chunk_record(&mut io, &[200, 0]).unwrap(),
            None
        );
    }

    #[test]
    fn test_resize_reallocates() {
        let mut io = storage();
        let mut index = ChunkIndex::create(&mut io, [4, 4].into(), 2, 1 << 20).unwrap();
        let ratios = SplitRatios::default();
        let a = index
            .insert(&mut io, &[4, 0], 64, FilterMask::empty(), &ratios)
            .unwrap();
        let b = index
            .insert(&mut io, &[4, 0], 64, FilterMask::from_bits_retain(1), &ratios)
            .unwrap();
        assert_eq!(a, b);
        let c = index
            .insert(&mut io, &[4, 0], 20, FilterMask::empty(), &ratios)
            .unwrap();
        let record = index.chunk_record(&mut io, &[4, 0]).unwrap().unwrap();
        assert_eq!(record.addr, c);
        assert_eq!(record.nbytes, 20);
        assert_eq!(record.filter_mask, FilterMask::empty());
        assert!(index
            .insert(&mut io, &[4, 1], 20, FilterMask::empty(), &ratios)
            .is_err());
        assert!(index.chunk_record(&mut io, &[4]).is_err());
    }

    #[test]
    fn test_remove_frees_storage() {
        let mut io = storage();
        let mut index = ChunkIndex::create(&mut io, [20, 20].into(), 2, 1 << 20).unwrap();
        let ratios = SplitRatios::default();
        let offsets = grid([90, 90], [20, 20]);
        for offset in &offsets {
            index
                .insert(&mut io, offset, 1600, FilterMask::empty(), &ratios)
                .unwrap();
        }
        assert_eq!(index.len(&mut io).unwrap(), 25);
        let before = io.space().allocated_bytes();
        let mut removed = 0;
        for offset in offsets.iter().filter(|o| o.iter().any(|c| *c >= 70)) {
            assert!(index.remove(&mut io, offset).unwrap());
            removed += 1;
            index.validate(&mut io).unwrap();
        }
        assert_eq!(removed, 9);
        assert!(!index.remove(&mut io, &[80, 80]).unwrap());
        assert!(io.space().allocated_bytes() <= before - 9 * 1600);
        for offset in &offsets {
            let expected = offset.iter().all(|c| *c < 70);
            assert_eq!(index.chunk_record(&mut io, offset).unwrap().is_some(), expected);
        }
        // removed chunks can come back
        index
            .insert(&mut io, &[80, 0], 10, FilterMask::empty(), &ratios)
            .unwrap();
        assert_eq!(index.len(&mut io).unwrap(), 17);
        index.validate(&mut io).unwrap();
        index.delete(&mut io).unwrap();
        assert_eq!(io.space().allocated_bytes(), 0);
    }
}
