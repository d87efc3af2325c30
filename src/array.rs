//! Chunked N-dimensional arrays.
//!
//! An array lives in a folder holding the `data` file (chunks and index nodes) and
//! the `ARRAY` metadata file (options, current extent, index root and free space).
//! Metadata is rewritten on [ChunkedArray::flush] and [ChunkedArray::close].
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    allocator::{allocate_chunks, AllocStats},
    btree::TreeInfo,
    cache::{CacheStats, ChunkCache},
    coordinator::{Coordinator, SingleProcess},
    error::{error_validation, io_invalid_data, Error},
    filter::FilterRegistry,
    freespace::FreeSpace,
    fs::FileSystem,
    index::{ChunkIndex, ChunkRecord},
    layout::ChunkLayout,
    options::{AllocTime, ArrayMetadata, ArrayOptions, CacheOptions, DATA_FILE, METADATA_FILE},
    prune::{prune_extent, PruneStats},
    sequence::{copy_vv, for_each_vv, SeqList},
    storage::{IoStats, Storage},
    store::ChunkStore,
    utils::{outside_extent, Coords},
};

/// Warns when an array is dropped without being closed.
#[derive(Debug)]
struct CloseGuard {
    path: PathBuf,
    closed: bool,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "Array {} dropped without close, unflushed chunks are lost",
                self.path.display()
            );
        }
    }
}

/// An open chunked array.
///
/// Every operation is synchronous and may perform file I/O. Under a parallel
/// [Coordinator] every process opens its own handle on the same folder, chunk
/// writes must be partitioned between processes by the caller.
#[derive(Debug)]
pub struct ChunkedArray {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    options: ArrayOptions,
    cache_options: CacheOptions,
    extent: Coords,
    store: ChunkStore,
    cache: ChunkCache,
    coordinator: Arc<dyn Coordinator>,
    /// Whether the chunks covering the extent were allocated (late allocation)
    allocated: bool,
    guard: CloseGuard,
}

impl ChunkedArray {
    /// Creates an array in the `path` folder of the native file system.
    #[cfg(unix)]
    pub fn create(path: impl AsRef<Path>, options: ArrayOptions) -> Result<Self, Error> {
        Self::create_with(
            Arc::new(crate::fs::NativeFS),
            path,
            options,
            CacheOptions::default(),
            &FilterRegistry::default(),
            Arc::new(SingleProcess),
        )
    }

    /// Opens the array in the `path` folder of the native file system.
    #[cfg(unix)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(
            Arc::new(crate::fs::NativeFS),
            path,
            CacheOptions::default(),
            &FilterRegistry::default(),
            Arc::new(SingleProcess),
        )
    }

    /// Creates an array in the `path` folder of `fs`.
    ///
    /// Ranks of a parallel `coordinator` share one data file but allocate from their
    /// own free space, so their allocations only agree if they happen in lockstep.
    /// Parallel arrays are therefore always created with [AllocTime::Early].
    pub fn create_with(
        fs: Arc<dyn FileSystem>,
        path: impl AsRef<Path>,
        mut options: ArrayOptions,
        cache_options: CacheOptions,
        registry: &FilterRegistry,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self, Error> {
        if coordinator.is_parallel() && options.alloc_time != AllocTime::Early {
            debug!(
                "Parallel array {} uses early allocation instead of {:?}",
                path.as_ref().display(),
                options.alloc_time
            );
            options.alloc_time = AllocTime::Early;
        }
        options.validate()?;
        cache_options.validate()?;
        let path = path.as_ref().to_path_buf();
        let data_path = path.join(DATA_FILE);
        let file = if coordinator.is_fill_writer() {
            if fs.exists(&path.join(METADATA_FILE)) {
                return Err(error_validation!("array {} already exists", path.display()));
            }
            fs.create_dir_all(&path)?;
            let file = fs.create(&data_path)?;
            if coordinator.is_parallel() {
                coordinator.barrier()?;
            }
            file
        } else {
            coordinator.barrier()?;
            fs.open(&data_path)?
        };
        let mut io = Storage::new(file, FreeSpace::new(cache_options.max_file_size))?;
        let index = ChunkIndex::create(
            &mut io,
            options.chunk_coords(),
            options.btree_k as usize,
            cache_options.node_cache_size,
        )?;
        let extent: Coords = options.dims.iter().copied().collect();
        let mut array = Self::assemble(fs, path, options, cache_options, registry, coordinator, io, index, extent)?;
        info!(
            "Created array {} extent {:?} chunks {:?}",
            array.path.display(),
            array.extent,
            array.options.chunk_dims
        );
        if array.options.alloc_time == AllocTime::Early {
            array.allocate(false)?;
        }
        array.write_metadata()?;
        Ok(array)
    }

    pub fn open_with(
        fs: Arc<dyn FileSystem>,
        path: impl AsRef<Path>,
        cache_options: CacheOptions,
        registry: &FilterRegistry,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self, Error> {
        cache_options.validate()?;
        let path = path.as_ref().to_path_buf();
        let Some(metadata) = ArrayMetadata::read_from_folder(&*fs, &path)? else {
            return Err(error_validation!("no array at {}", path.display()));
        };
        let ArrayMetadata {
            options,
            extent,
            index_root,
            mut space,
        } = metadata;
        options.validate()?;
        options.check_extent(&extent)?;
        space
            .validate()
            .map_err(|e| io_invalid_data!("array free space is inconsistent: {e}"))?;
        space.set_max_file_size(cache_options.max_file_size);
        let file = fs.open(&path.join(DATA_FILE))?;
        if file.len()? < space.eoa() {
            return Err(io_invalid_data!(
                "data file is shorter than its end of allocation {}",
                space.eoa()
            ));
        }
        let mut io = Storage::new(file, space)?;
        let index = ChunkIndex::open(
            &mut io,
            options.chunk_coords(),
            options.btree_k as usize,
            index_root,
            cache_options.node_cache_size,
        )?;
        let extent: Coords = extent.into_iter().collect();
        let array = Self::assemble(fs, path, options, cache_options, registry, coordinator, io, index, extent)?;
        info!("Opened array {} extent {:?}", array.path.display(), array.extent);
        Ok(array)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        fs: Arc<dyn FileSystem>,
        path: PathBuf,
        options: ArrayOptions,
        cache_options: CacheOptions,
        registry: &FilterRegistry,
        coordinator: Arc<dyn Coordinator>,
        io: Storage,
        index: ChunkIndex,
        extent: Coords,
    ) -> Result<Self, Error> {
        let pipeline = registry.build(&options.filters)?;
        if coordinator.is_parallel() && !pipeline.is_empty() {
            return Err(Error::validation(
                "filters aren't supported with parallel coordinators",
            ));
        }
        if coordinator.is_parallel() && options.alloc_time != AllocTime::Early {
            return Err(error_validation!(
                "parallel coordinators require early allocation, {} uses {:?}",
                path.display(),
                options.alloc_time
            ));
        }
        let layout = ChunkLayout::new(options.chunk_coords(), options.element_size);
        let cache = ChunkCache::new(&cache_options, &layout, &extent);
        let fill = options.fill.clone();
        let store = ChunkStore::new(io, index, Arc::new(layout), Arc::new(pipeline), fill);
        Ok(Self {
            guard: CloseGuard {
                path: path.clone(),
                closed: false,
            },
            allocated: options.alloc_time != AllocTime::Late,
            fs,
            path,
            options,
            cache_options,
            extent,
            store,
            cache,
            coordinator,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn options(&self) -> &ArrayOptions {
        &self.options
    }

    #[inline]
    pub fn extent(&self) -> &[u64] {
        &self.extent
    }

    #[inline]
    pub fn layout(&self) -> &ChunkLayout {
        self.store.layout()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn io_stats(&self) -> IoStats {
        self.store.io.stats()
    }

    pub fn index_info(&mut self) -> Result<TreeInfo, Error> {
        self.store.index.info(&mut self.store.io)
    }

    /// Stored chunks in origin order.
    pub fn chunk_records(&mut self) -> Result<Vec<(Coords, ChunkRecord)>, Error> {
        self.store.index.records(&mut self.store.io)
    }

    /// Checks the chunk index structure.
    pub fn validate(&mut self) -> Result<(), Error> {
        self.store.index.validate(&mut self.store.io)?;
        self.store.io.space().validate()
    }

    fn write_metadata(&mut self) -> Result<(), Error> {
        if !self.coordinator.is_fill_writer() {
            return Ok(());
        }
        let metadata = ArrayMetadata {
            options: self.options.clone(),
            extent: self.extent.to_vec(),
            index_root: self.store.index.root(),
            space: self.store.io.space().clone(),
        };
        metadata.write_to_folder(&*self.fs, &self.path)
    }

    /// Reserves storage for every chunk covering the current extent.
    pub fn allocate(&mut self, full_overwrite: bool) -> Result<AllocStats, Error> {
        let stats = allocate_chunks(
            &self.cache,
            &mut self.store,
            &*self.coordinator,
            &self.extent,
            &self.cache_options.split_ratios,
            full_overwrite,
        )?;
        self.allocated = true;
        Ok(stats)
    }

    /// Changes the array extent. Chunks outside a shrunk extent are discarded, a grown
    /// extent is allocated right away with early allocation.
    pub fn set_extent(&mut self, extent: &[u64]) -> Result<PruneStats, Error> {
        self.options.check_extent(extent)?;
        let shrinks = extent.iter().zip(self.extent.iter()).any(|(n, o)| n < o);
        let grows = extent.iter().zip(self.extent.iter()).any(|(n, o)| n > o);
        let mut stats = PruneStats::default();
        if shrinks {
            stats = prune_extent(
                &mut self.cache,
                &mut self.store,
                extent,
                self.coordinator.is_fill_writer(),
            )?;
            if self.coordinator.is_parallel() {
                self.cache.flush(&mut self.store)?;
                self.coordinator.barrier()?;
            }
        }
        self.cache.rehash(&mut self.store, extent)?;
        info!(
            "Array {} extent {:?} -> {extent:?}",
            self.path.display(),
            self.extent
        );
        self.extent = extent.into();
        if grows && self.options.alloc_time != AllocTime::Incremental && self.allocated {
            self.allocate(false)?;
        }
        Ok(stats)
    }

    fn check_chunk(&self, origin: &[u64]) -> Result<(), Error> {
        self.store.layout().check_origin(origin)?;
        if outside_extent(origin, &self.extent) {
            return Err(error_validation!(
                "chunk {origin:?} is outside the extent {:?}",
                self.extent
            ));
        }
        Ok(())
    }

    /// The stored chunk if it can be accessed in place, bypassing the cache.
    /// That's the case for unfiltered chunks that aren't cached, when they don't fit
    /// the cache or when other processes may be writing to other parts of them.
    fn direct_record(&mut self, origin: &[u64]) -> Result<Option<ChunkRecord>, Error> {
        let chunk_nbytes = self.store.layout().chunk_nbytes();
        if !self.store.pipeline().is_empty()
            || self.cache.contains(origin)
            || !(self.coordinator.is_parallel() || chunk_nbytes > self.cache.budget())
        {
            return Ok(None);
        }
        Ok(self
            .store
            .record(origin)?
            .filter(|r| r.nbytes as usize == chunk_nbytes && r.filter_mask.is_empty()))
    }

    /// Gathers the chunk bytes described by `chunk_seq` into the ranges of `buf`
    /// described by `mem_seq`. Returns the bytes transferred.
    pub fn readvv(
        &mut self,
        origin: &[u64],
        chunk_seq: &mut SeqList,
        mem_seq: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.check_chunk(origin)?;
        chunk_seq.check_bounds(self.store.layout().chunk_nbytes(), "chunk")?;
        mem_seq.check_bounds(buf.len(), "memory")?;
        if let Some(record) = self.direct_record(origin)? {
            let store = &mut self.store;
            return for_each_vv(chunk_seq, mem_seq, |chunk_off, mem_off, n| {
                store.read_direct(&record, chunk_off, &mut buf[mem_off..mem_off + n])
            });
        }
        let lock = self.cache.lock(&mut self.store, origin, false)?;
        let result = copy_vv(buf, mem_seq, self.cache.data(&lock), chunk_seq);
        let naccessed = *result.as_ref().unwrap_or(&0);
        self.cache.unlock(&mut self.store, lock, false, naccessed)?;
        result
    }

    /// Scatters the ranges of `buf` described by `mem_seq` into the chunk bytes
    /// described by `chunk_seq`. Returns the bytes transferred.
    pub fn writevv(
        &mut self,
        origin: &[u64],
        chunk_seq: &mut SeqList,
        mem_seq: &mut SeqList,
        buf: &[u8],
    ) -> Result<usize, Error> {
        self.check_chunk(origin)?;
        let chunk_nbytes = self.store.layout().chunk_nbytes();
        chunk_seq.check_bounds(chunk_nbytes, "chunk")?;
        mem_seq.check_bounds(buf.len(), "memory")?;
        if !self.allocated {
            self.allocate(false)?;
        }
        if let Some(record) = self.direct_record(origin)? {
            let store = &mut self.store;
            return for_each_vv(chunk_seq, mem_seq, |chunk_off, mem_off, n| {
                store.write_direct(&record, chunk_off, &buf[mem_off..mem_off + n])
            });
        }
        let relax = mem_seq.remaining_bytes() >= chunk_nbytes
            && chunk_seq.iter().eq([(0, chunk_nbytes)]);
        let mut lock = self.cache.lock(&mut self.store, origin, relax)?;
        let result = copy_vv(self.cache.data_mut(&mut lock), chunk_seq, buf, mem_seq);
        let naccessed = *result.as_ref().unwrap_or(&0);
        self.cache
            .unlock(&mut self.store, lock, naccessed != 0, naccessed)?;
        result
    }

    /// Reads a whole chunk.
    pub fn read_chunk(&mut self, origin: &[u64]) -> Result<Vec<u8>, Error> {
        let nbytes = self.store.layout().chunk_nbytes();
        let mut buf = vec![0; nbytes];
        self.readvv(
            origin,
            &mut SeqList::single(0, nbytes),
            &mut SeqList::single(0, nbytes),
            &mut buf,
        )?;
        Ok(buf)
    }

    /// Overwrites a whole chunk.
    pub fn write_chunk(&mut self, origin: &[u64], data: &[u8]) -> Result<(), Error> {
        let nbytes = self.store.layout().chunk_nbytes();
        if data.len() != nbytes {
            return Err(error_validation!(
                "chunk data has {} bytes expected {nbytes}",
                data.len()
            ));
        }
        self.writevv(
            origin,
            &mut SeqList::single(0, nbytes),
            &mut SeqList::single(0, nbytes),
            data,
        )?;
        Ok(())
    }

    fn check_box(&self, start: &[u64], count: &[u64]) -> Result<usize, Error> {
        let rank = self.options.rank();
        if start.len() != rank
            || count.len() != rank
            || (0..rank).any(|i| start[i].saturating_add(count[i]) > self.extent[i])
        {
            return Err(error_validation!(
                "box {start:?}+{count:?} isn't inside the extent {:?}",
                self.extent
            ));
        }
        Ok(count.iter().product::<u64>() as usize * self.options.element_size as usize)
    }

    /// Reads the elements of the box `[start, start + count)` in row-major order.
    pub fn read_box(&mut self, start: &[u64], count: &[u64]) -> Result<Vec<u8>, Error> {
        let nbytes = self.check_box(start, count)?;
        let mut buf = vec![0; nbytes];
        for origin in self.store.layout().chunks_in_box(start, count) {
            let (mut chunk_seq, mut mem_seq) =
                self.store.layout().box_sequences(&origin, start, count);
            self.readvv(&origin, &mut chunk_seq, &mut mem_seq, &mut buf)?;
        }
        Ok(buf)
    }

    /// Writes the elements of the box `[start, start + count)` from row-major `data`.
    pub fn write_box(&mut self, start: &[u64], count: &[u64], data: &[u8]) -> Result<(), Error> {
        let nbytes = self.check_box(start, count)?;
        if data.len() != nbytes {
            return Err(error_validation!(
                "box data has {} bytes expected {nbytes}",
                data.len()
            ));
        }
        if !self.allocated {
            let whole = start.iter().all(|s| *s == 0) && count == self.extent.as_slice();
            self.allocate(whole)?;
        }
        for origin in self.store.layout().chunks_in_box(start, count) {
            let (mut chunk_seq, mut mem_seq) =
                self.store.layout().box_sequences(&origin, start, count);
            self.writevv(&origin, &mut chunk_seq, &mut mem_seq, data)?;
        }
        Ok(())
    }

    /// Writes every dirty cached chunk and the array metadata.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.cache.flush(&mut self.store)?;
        self.store.io.sync(false)?;
        self.write_metadata()
    }

    /// Writes everything and closes the array.
    pub fn close(mut self) -> Result<(), Error> {
        self.guard.closed = true;
        let result = self.cache.teardown(&mut self.store);
        self.store.io.sync(true)?;
        self.write_metadata()?;
        info!("Closed array {}", self.path.display());
        result
    }

    /// Deletes the array, its chunks and its folder.
    pub fn delete(mut self) -> Result<(), Error> {
        self.guard.closed = true;
        let zeros: Coords = smallvec::smallvec![0; self.options.rank()];
        // every origin is outside an empty extent
        self.cache.discard_outside(&mut self.store, &zeros)?;
        let ChunkStore { mut io, index, .. } = self.store;
        index.delete(&mut io)?;
        debug_assert_eq!(io.space().allocated_bytes(), 0);
        if self.coordinator.is_fill_writer() {
            self.fs.remove_dir_all(&self.path)?;
        }
        info!("Deleted array {}", self.path.display());
        Ok(())
    }
}
