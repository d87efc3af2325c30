//! Write-back cache of decoded chunks.
//!
//! Entries live in an arena and are addressed by index. A fixed number of hash slots
//! maps chunk origins to entries, a colliding chunk evicts the slot occupant (there's no
//! chaining). Entries are also linked in recency order, oldest first, which drives
//! eviction when the byte budget would be exceeded.
//!
//! Chunks that can't be admitted (larger than the budget, colliding with a locked
//! entry or with everything else locked) are still served, but they are written or
//! dropped as soon as they're unlocked.
use std::sync::Arc;

use crate::{
    error::{error_validation, Error},
    filter::FilterPipeline,
    layout::ChunkLayout,
    options::{CacheOptions, SplitRatios},
    store::ChunkStore,
    utils::{chunks_per_dim, linear_chunk_index, outside_extent, ByteSize, Coords},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Chunks initialized with the fill value because they had no storage
    pub inits: u64,
    /// Chunk writes, including uncached ones
    pub flushes: u64,
    pub entries: usize,
    pub nbytes: usize,
}

struct CacheEntry {
    locked: bool,
    dirty: bool,
    origin: Coords,
    buf: Vec<u8>,
    /// Bytes not yet read, used to pick eviction victims
    rd_count: usize,
    /// Bytes not yet written, used to pick eviction victims
    wr_count: usize,
    prev: Option<usize>,
    next: Option<usize>,
    slot: usize,
    split_ratios: SplitRatios,
    layout: Arc<ChunkLayout>,
    pipeline: Arc<FilterPipeline>,
}

impl CacheEntry {
    #[inline]
    fn size(&self) -> usize {
        self.buf.len()
    }

    /// Entries that were completely read and/or completely written (and aren't
    /// partially either) are unlikely to be accessed again soon.
    fn fully_accessed(&self) -> bool {
        let size = self.size();
        !self.locked
            && match (self.rd_count, self.wr_count) {
                (0, 0) => true,
                (0, wr) => wr == size,
                (rd, 0) => rd == size,
                _ => false,
            }
    }
}

/// A chunk checked out of the cache, see [ChunkCache::lock].
#[derive(Debug)]
#[must_use]
pub enum ChunkLock {
    Cached(usize),
    Uncached(UncachedChunk),
}

#[derive(Debug)]
pub struct UncachedChunk {
    origin: Coords,
    buf: Vec<u8>,
}

impl ChunkLock {
    pub fn is_cached(&self) -> bool {
        matches!(self, ChunkLock::Cached(_))
    }
}

pub struct ChunkCache {
    slots: Vec<Option<usize>>,
    entries: Vec<Option<CacheEntry>>,
    vacant: Vec<usize>,
    /// Least recently used
    head: Option<usize>,
    /// Most recently used
    tail: Option<usize>,
    /// Sum of the cached buffers sizes
    nbytes: usize,
    budget: usize,
    w0: f64,
    split_ratios: SplitRatios,
    chunk_dims: Coords,
    /// Chunks per dimension over the current extent, used to compute slots
    nchunks: Coords,
    /// Origins of locked chunks that aren't cached
    uncached_locks: Vec<Coords>,
    stats: CacheStats,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("slots", &self.slots.len())
            .field("nbytes", &ByteSize(self.nbytes as u64))
            .field("budget", &ByteSize(self.budget as u64))
            .field("stats", &self.stats)
            .finish()
    }
}

impl ChunkCache {
    pub fn new(options: &CacheOptions, layout: &ChunkLayout, extent: &[u64]) -> Self {
        Self {
            slots: vec![None; options.cache_slots.max(1)],
            entries: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            nbytes: 0,
            budget: options.cache_size,
            w0: options.w0,
            split_ratios: options.split_ratios,
            chunk_dims: layout.chunk_dims.clone(),
            nchunks: chunks_per_dim(extent, &layout.chunk_dims),
            uncached_locks: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len() - self.vacant.len(),
            nbytes: self.nbytes,
            ..self.stats
        }
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    #[inline]
    pub fn budget(&self) -> usize {
        self.budget
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    fn slot_of(&self, origin: &[u64]) -> usize {
        (linear_chunk_index(origin, &self.chunk_dims, &self.nchunks) % self.slots.len() as u64)
            as usize
    }

    #[inline]
    fn entry(&self, idx: usize) -> &CacheEntry {
        self.entries[idx].as_ref().expect("vacant cache entry")
    }

    #[inline]
    fn entry_mut(&mut self, idx: usize) -> &mut CacheEntry {
        self.entries[idx].as_mut().expect("vacant cache entry")
    }

    fn find(&self, origin: &[u64]) -> Option<usize> {
        self.slots[self.slot_of(origin)].filter(|idx| self.entry(*idx).origin.as_slice() == origin)
    }

    pub fn contains(&self, origin: &[u64]) -> bool {
        self.find(origin).is_some()
    }

    /// Whether the cached chunk at `origin` has unwritten modifications.
    pub fn is_dirty(&self, origin: &[u64]) -> bool {
        self.find(origin).is_some_and(|idx| self.entry(idx).dirty)
    }

    /// Entry indexes from least to most recently used.
    fn lru_order(&self) -> Vec<usize> {
        let mut result = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            result.push(idx);
            cursor = self.entry(idx).next;
        }
        result
    }

    /// Origins of every cached chunk, least recently used first.
    pub fn origins(&self) -> Vec<Coords> {
        self.lru_order()
            .into_iter()
            .map(|idx| self.entry(idx).origin.clone())
            .collect()
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let ent = self.entry(idx);
            (ent.prev, ent.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let ent = self.entry_mut(idx);
        ent.prev = None;
        ent.next = None;
    }

    fn push_back(&mut self, idx: usize) {
        let tail = self.tail;
        {
            let ent = self.entry_mut(idx);
            ent.prev = tail;
            ent.next = None;
        }
        match tail {
            Some(t) => self.entry_mut(t).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail != Some(idx) {
            self.unlink(idx);
            self.push_back(idx);
        }
    }

    fn insert(&mut self, entry: CacheEntry) -> usize {
        let slot = entry.slot;
        self.nbytes += entry.size();
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                idx
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        self.slots[slot] = Some(idx);
        self.push_back(idx);
        idx
    }

    fn remove(&mut self, idx: usize) -> CacheEntry {
        self.unlink(idx);
        let entry = self.entries[idx].take().expect("vacant cache entry");
        if self.slots[entry.slot] == Some(idx) {
            self.slots[entry.slot] = None;
        }
        self.nbytes -= entry.size();
        self.vacant.push(idx);
        entry
    }

    /// Checks out the chunk at `origin`, reading (or initializing) it if it isn't cached.
    ///
    /// `relax` means the caller is about to overwrite the whole chunk, so a missing chunk
    /// isn't read from the file. Locking a chunk that's already locked is an error.
    pub fn lock(
        &mut self,
        store: &mut ChunkStore,
        origin: &[u64],
        relax: bool,
    ) -> Result<ChunkLock, Error> {
        store.layout().check_origin(origin)?;
        let slot = self.slot_of(origin);
        if let Some(idx) = self.slots[slot] {
            let ent = self.entry_mut(idx);
            if ent.origin.as_slice() == origin {
                if ent.locked {
                    return Err(error_validation!("chunk {origin:?} is already locked"));
                }
                ent.locked = true;
                self.stats.hits += 1;
                self.touch(idx);
                return Ok(ChunkLock::Cached(idx));
            }
        }
        if self.uncached_locks.iter().any(|o| o.as_slice() == origin) {
            return Err(error_validation!("chunk {origin:?} is already locked"));
        }

        let buf = if relax {
            self.stats.hits += 1;
            vec![0; store.layout().chunk_nbytes()]
        } else if let Some(buf) = store.read_chunk(origin)? {
            self.stats.misses += 1;
            buf
        } else {
            self.stats.inits += 1;
            store.init_chunk()
        };

        let size = buf.len();
        if self.admit(store, slot, size)? {
            let idx = self.insert(CacheEntry {
                locked: true,
                dirty: false,
                origin: origin.into(),
                buf,
                rd_count: size,
                wr_count: size,
                prev: None,
                next: None,
                slot,
                split_ratios: self.split_ratios,
                layout: store.layout().clone(),
                pipeline: store.pipeline().clone(),
            });
            debug_assert!(self.nbytes <= self.budget);
            Ok(ChunkLock::Cached(idx))
        } else {
            self.uncached_locks.push(origin.into());
            Ok(ChunkLock::Uncached(UncachedChunk {
                origin: origin.into(),
                buf,
            }))
        }
    }

    /// Makes room for a chunk of `size` bytes in `slot`, returns false if it can't be cached.
    fn admit(&mut self, store: &mut ChunkStore, slot: usize, size: usize) -> Result<bool, Error> {
        if size > self.budget {
            warn!(
                "Chunk of {} exceeds the cache size {}, bypassing the cache",
                ByteSize(size as u64),
                ByteSize(self.budget as u64)
            );
            return Ok(false);
        }
        if let Some(occupant) = self.slots[slot] {
            if self.entry(occupant).locked {
                debug!("Cache slot {slot} is held by a locked chunk");
                return Ok(false);
            }
            self.preempt(store, occupant, true)?;
        }
        self.prune(store, size)?;
        Ok(self.nbytes + size <= self.budget)
    }

    pub fn data<'a>(&'a self, lock: &'a ChunkLock) -> &'a [u8] {
        match lock {
            ChunkLock::Cached(idx) => &self.entry(*idx).buf,
            ChunkLock::Uncached(chunk) => &chunk.buf,
        }
    }

    pub fn data_mut<'a>(&'a mut self, lock: &'a mut ChunkLock) -> &'a mut [u8] {
        match lock {
            ChunkLock::Cached(idx) => &mut self.entry_mut(*idx).buf,
            ChunkLock::Uncached(chunk) => &mut chunk.buf,
        }
    }

    /// Returns a locked chunk. `dirty` marks it as modified, `naccessed` is the number of
    /// bytes read or written while locked.
    pub fn unlock(
        &mut self,
        store: &mut ChunkStore,
        lock: ChunkLock,
        dirty: bool,
        naccessed: usize,
    ) -> Result<(), Error> {
        match lock {
            ChunkLock::Cached(idx) => {
                let ent = self.entry_mut(idx);
                debug_assert!(ent.locked);
                ent.locked = false;
                if dirty {
                    ent.dirty = true;
                    ent.wr_count = ent.wr_count.saturating_sub(naccessed);
                } else {
                    ent.rd_count = ent.rd_count.saturating_sub(naccessed);
                }
                Ok(())
            }
            ChunkLock::Uncached(chunk) => {
                self.uncached_locks.retain(|o| *o != chunk.origin);
                if dirty {
                    let pipeline = store.pipeline().clone();
                    store.write_chunk(&chunk.origin, &chunk.buf, &pipeline, &self.split_ratios)?;
                    self.stats.flushes += 1;
                }
                Ok(())
            }
        }
    }

    /// Writes the entry if dirty. With `reset` the entry is also removed from the cache,
    /// even if the write fails.
    fn flush_entry(&mut self, store: &mut ChunkStore, idx: usize, reset: bool) -> Result<(), Error> {
        let ent = self.entry(idx);
        debug_assert_eq!(ent.size(), ent.layout.chunk_nbytes());
        let result = if ent.dirty {
            store
                .write_chunk(&ent.origin, &ent.buf, &ent.pipeline, &ent.split_ratios)
                .map(|nbytes| {
                    trace!("Flushed chunk {:?} as {nbytes} bytes", ent.origin);
                })
        } else {
            Ok(())
        };
        match &result {
            Ok(()) if self.entry(idx).dirty => {
                self.entry_mut(idx).dirty = false;
                self.stats.flushes += 1;
            }
            Err(e) if reset => {
                error!("Dropping chunk {:?} after failed flush: {e}", self.entry(idx).origin);
            }
            _ => (),
        }
        if reset {
            self.remove(idx);
        }
        result
    }

    /// Evicts an unlocked entry, writing it first if `flush`.
    fn preempt(&mut self, store: &mut ChunkStore, idx: usize, flush: bool) -> Result<(), Error> {
        debug_assert!(!self.entry(idx).locked);
        trace!("Preempting chunk {:?} flush {flush}", self.entry(idx).origin);
        if flush {
            self.flush_entry(store, idx, true)
        } else {
            self.remove(idx);
            Ok(())
        }
    }

    /// Evicts entries until `size` more bytes fit in the budget (or nothing else can
    /// be evicted). The scan starts with a pass over the oldest entries that only
    /// evicts fully read or written entries, after a `w0` fraction of the entries a
    /// second pass starts evicting any unlocked entry from the oldest.
    fn prune(&mut self, store: &mut ChunkStore, size: usize) -> Result<(), Error> {
        let mut w0 = (self.stats().entries as f64 * self.w0) as isize;
        let mut p: [Option<usize>; 2] = [self.head, None];
        while (p[0].is_some() || p[1].is_some()) && self.nbytes + size > self.budget {
            if w0 == 0 {
                p[1] = self.head;
            }
            let mut n = p.map(|p| p.and_then(|i| self.entry(i).next));
            for method in 0..2 {
                if self.nbytes + size <= self.budget {
                    break;
                }
                let victim = match p[method] {
                    Some(c) if method == 0 && self.entry(c).fully_accessed() => c,
                    Some(c) if method == 1 && !self.entry(c).locked => c,
                    _ => continue,
                };
                let victim_next = self.entry(victim).next;
                for j in 0..2 {
                    if p[j] == Some(victim) {
                        p[j] = None;
                    }
                    if n[j] == Some(victim) {
                        n[j] = victim_next;
                    }
                }
                self.preempt(store, victim, true)?;
            }
            p = n;
            w0 -= 1;
        }
        Ok(())
    }

    /// Writes every dirty entry, entries stay cached. Returns the first error after
    /// attempting all entries.
    pub fn flush(&mut self, store: &mut ChunkStore) -> Result<(), Error> {
        let mut result = Ok(());
        for idx in self.lru_order() {
            if let Err(e) = self.flush_entry(store, idx, false) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Writes and evicts every entry. The cache ends empty even on errors,
    /// the first error is returned.
    pub fn teardown(&mut self, store: &mut ChunkStore) -> Result<(), Error> {
        let mut result = Ok(());
        for idx in self.lru_order() {
            if let Err(e) = self.flush_entry(store, idx, true) {
                warn!("Error tearing down chunk cache: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.uncached_locks.clear();
        debug_assert_eq!(self.nbytes, 0);
        result
    }

    /// Evicts without writing every entry whose origin lies outside `extent`.
    /// Returns the number of entries dropped.
    pub fn discard_outside(&mut self, store: &mut ChunkStore, extent: &[u64]) -> Result<usize, Error> {
        let mut discarded = 0;
        for idx in self.lru_order() {
            let ent = self.entry(idx);
            if !outside_extent(&ent.origin, extent) {
                continue;
            }
            if ent.locked {
                return Err(error_validation!(
                    "chunk {:?} is locked while shrinking the extent",
                    ent.origin
                ));
            }
            self.preempt(store, idx, false)?;
            discarded += 1;
        }
        Ok(discarded)
    }

    /// Recomputes hash slots after the extent changed. Entries colliding in their new
    /// slot evict (flushing) the older occupant.
    pub fn rehash(&mut self, store: &mut ChunkStore, extent: &[u64]) -> Result<(), Error> {
        if let Some(ent) = self.entries.iter().flatten().find(|e| e.locked) {
            return Err(error_validation!(
                "chunk {:?} is locked while changing the extent",
                ent.origin
            ));
        }
        if !self.uncached_locks.is_empty() {
            return Err(Error::validation("chunks are locked while changing the extent"));
        }
        self.nchunks = chunks_per_dim(extent, &self.chunk_dims);
        self.slots.fill(None);
        let mut result = Ok(());
        for idx in self.lru_order() {
            let slot = self.slot_of(&self.entry(idx).origin);
            if let Some(occupant) = self.slots[slot] {
                if let Err(e) = self.preempt(store, occupant, true) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            self.entry_mut(idx).slot = slot;
            self.slots[slot] = Some(idx);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::{
        error::error_filter,
        filter::{Filter, FilterDescription, FilterRegistry},
        options::FillValue,
        store::test_store,
        utils::test_rng,
    };

    /// 4x4 chunks of 1 byte elements (16 bytes) over a 32x32 extent.
    fn setup(budget: usize, slots: usize, pipeline: FilterPipeline) -> (ChunkCache, ChunkStore) {
        let fill = FillValue {
            value: Some(vec![0xFF]),
            ..Default::default()
        };
        let store = test_store(&[4, 4], 1, pipeline, fill);
        let options = CacheOptions {
            cache_size: budget,
            cache_slots: slots,
            ..Default::default()
        };
        let cache = ChunkCache::new(&options, store.layout(), &[32, 32]);
        (cache, store)
    }

    fn write(cache: &mut ChunkCache, store: &mut ChunkStore, origin: &[u64], byte: u8) {
        let mut lock = cache.lock(store, origin, false).unwrap();
        cache.data_mut(&mut lock).fill(byte);
        cache.unlock(store, lock, true, 16).unwrap();
    }

    fn read(cache: &mut ChunkCache, store: &mut ChunkStore, origin: &[u64]) -> Vec<u8> {
        let lock = cache.lock(store, origin, false).unwrap();
        let data = cache.data(&lock).to_vec();
        cache.unlock(store, lock, false, 16).unwrap();
        data
    }

    #[test]
    fn test_write_flush_evict_read() {
        let _ = env_logger::try_init();
        for filters in [vec![], vec![FilterDescription::lz4(), FilterDescription::checksum()]] {
            let pipeline = FilterRegistry::default().build(&filters).unwrap();
            let (mut cache, mut store) = setup(64, 31, pipeline);
            assert_eq!(read(&mut cache, &mut store, &[0, 4]), [0xFF; 16]);
            assert_eq!(cache.stats().inits, 1);
            write(&mut cache, &mut store, &[0, 4], 7);
            assert_eq!(cache.stats().hits, 1);
            assert!(cache.is_dirty(&[0, 4]));
            cache.flush(&mut store).unwrap();
            let writes = store.storage().stats().writes;
            assert_eq!(cache.stats().flushes, 1);
            // nothing dirty, nothing written
            cache.flush(&mut store).unwrap();
            assert_eq!(store.storage().stats().writes, writes);
            cache.teardown(&mut store).unwrap();
            assert!(cache.is_empty());
            assert_eq!(read(&mut cache, &mut store, &[0, 4]), [7; 16]);
            assert_eq!(cache.stats().misses, 1);
        }
    }

    #[test]
    fn test_budget_never_exceeded() {
        let mut rng = test_rng();
        let (mut cache, mut store) = setup(64, 13, FilterPipeline::default());
        let mut model = std::collections::BTreeMap::new();
        for _ in 0..500 {
            let origin = [rng.random_range(0..8u64) * 4, rng.random_range(0..8u64) * 4];
            if rng.random_bool(0.5) {
                let byte = rng.random();
                write(&mut cache, &mut store, &origin, byte);
                model.insert(origin, byte);
            } else {
                let expected = model.get(&origin).copied().unwrap_or(0xFF);
                assert_eq!(read(&mut cache, &mut store, &origin), [expected; 16]);
            }
            assert!(cache.nbytes() <= cache.budget());
            assert!(cache.stats().entries <= 4);
        }
        cache.teardown(&mut store).unwrap();
        for (origin, byte) in model {
            assert_eq!(store.read_chunk(&origin).unwrap().unwrap(), [byte; 16]);
        }
        store.index.validate(&mut store.io).unwrap();
    }

    #[test]
    fn test_prune_prefers_fully_accessed() {
        let _ = env_logger::try_init();
        for (w0, survivors) in [
            (0.75, [[0, 0], [0, 8], [0, 12]]),
            (0.0, [[0, 4], [0, 8], [0, 12]]),
        ] {
            let (_, mut store) = setup(0, 1, FilterPipeline::default());
            let options = CacheOptions {
                cache_size: 48,
                cache_slots: 31,
                w0,
                ..Default::default()
            };
            let mut cache = ChunkCache::new(&options, store.layout(), &[32, 32]);
            // oldest to newest: partially read, fully read, partially read
            for (origin, nread) in [([0, 0], 4), ([0, 4], 16), ([0, 8], 4)] {
                let lock = cache.lock(&mut store, &origin, false).unwrap();
                cache.unlock(&mut store, lock, false, nread).unwrap();
            }
            assert_eq!(cache.nbytes(), 48);
            read(&mut cache, &mut store, &[0, 12]);
            let origins: Vec<Vec<u64>> = cache.origins().iter().map(|o| o.to_vec()).collect();
            assert_eq!(origins, survivors, "w0 {w0}");
            assert!(cache.nbytes() <= cache.budget());
        }
    }

    #[test]
    fn test_uncached_chunks() {
        // budget smaller than one chunk
        let (mut cache, mut store) = setup(8, 31, FilterPipeline::default());
        let mut lock = cache.lock(&mut store, &[4, 4], false).unwrap();
        assert!(!lock.is_cached());
        assert!(cache.lock(&mut store, &[4, 4], false).is_err());
        cache.data_mut(&mut lock)[0] = 1;
        cache.unlock(&mut store, lock, true, 1).unwrap();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().flushes, 1);
        assert_eq!(store.read_chunk(&[4, 4]).unwrap().unwrap()[..2], [1, 0xFF]);
        // a read only uncached chunk is dropped
        let lock = cache.lock(&mut store, &[8, 8], false).unwrap();
        cache.unlock(&mut store, lock, false, 16).unwrap();
        assert_eq!(store.record(&[8, 8]).unwrap(), None);
    }

    #[test]
    fn test_locking_rules() {
        let (mut cache, mut store) = setup(64, 1, FilterPipeline::default());
        assert!(matches!(
            cache.lock(&mut store, &[1, 0], false),
            Err(Error::Validation(_))
        ));
        let lock = cache.lock(&mut store, &[0, 0], true).unwrap();
        assert_eq!(cache.data(&lock), [0; 16]);
        assert_eq!(cache.stats().hits, 1);
        assert!(matches!(
            cache.lock(&mut store, &[0, 0], false),
            Err(Error::Validation(_))
        ));
        // single slot held by a locked entry
        let other = cache.lock(&mut store, &[0, 4], false).unwrap();
        assert!(!other.is_cached());
        cache.unlock(&mut store, other, false, 0).unwrap();
        cache.unlock(&mut store, lock, true, 16).unwrap();
        // collision evicts the unlocked occupant after writing it
        write(&mut cache, &mut store, &[0, 4], 3);
        assert!(!cache.contains(&[0, 0]));
        assert_eq!(store.read_chunk(&[0, 0]).unwrap().unwrap(), [0; 16]);
        assert!(cache.rehash(&mut store, &[64, 64]).is_ok());
        assert!(cache.contains(&[0, 4]));
    }

    #[derive(Debug)]
    struct Broken;

    impl Filter for Broken {
        fn encode(&self, _data: &[u8]) -> Result<Vec<u8>, Error> {
            Err(error_filter!("broken"))
        }

        fn decode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(data.to_vec())
        }
    }

    #[test]
    fn test_failed_flush() {
        let mut registry = FilterRegistry::default();
        registry.register("broken", |_| Ok(Box::new(Broken)));
        let pipeline = registry
            .build(&[FilterDescription::new("broken", [])])
            .unwrap();
        let (mut cache, mut store) = setup(64, 31, pipeline);
        write(&mut cache, &mut store, &[0, 0], 1);
        assert!(cache.flush(&mut store).unwrap_err().is_filter());
        // left dirty for a retry
        assert!(cache.is_dirty(&[0, 0]));
        assert!(cache.teardown(&mut store).unwrap_err().is_filter());
        assert!(cache.is_empty());
        assert_eq!(cache.nbytes(), 0);
    }
}
