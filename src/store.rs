//! Chunk transfer between memory and the file: index lookups, filtering and raw I/O.
use std::sync::Arc;

use crate::{
    error::{error_filter, Error},
    filter::{FilterMask, FilterPipeline},
    index::{ChunkIndex, ChunkRecord},
    layout::ChunkLayout,
    options::{FillValue, SplitRatios},
    storage::Storage,
};

/// The file side of an array: its storage, chunk index and the
/// parameters needed to (de)serialize chunks.
#[derive(Debug)]
pub struct ChunkStore {
    pub(crate) io: Storage,
    pub(crate) index: ChunkIndex,
    layout: Arc<ChunkLayout>,
    pipeline: Arc<FilterPipeline>,
    fill: FillValue,
}

impl ChunkStore {
    pub fn new(
        io: Storage,
        index: ChunkIndex,
        layout: Arc<ChunkLayout>,
        pipeline: Arc<FilterPipeline>,
        fill: FillValue,
    ) -> Self {
        Self {
            io,
            index,
            layout,
            pipeline,
            fill,
        }
    }

    #[inline]
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    #[inline]
    pub fn pipeline(&self) -> &Arc<FilterPipeline> {
        &self.pipeline
    }

    #[inline]
    pub fn fill(&self) -> &FillValue {
        &self.fill
    }

    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.io
    }

    pub fn record(&mut self, origin: &[u64]) -> Result<Option<ChunkRecord>, Error> {
        self.index.chunk_record(&mut self.io, origin)
    }

    /// Reads and decodes the chunk at `origin`, `None` if it has no storage.
    pub fn read_chunk(&mut self, origin: &[u64]) -> Result<Option<Vec<u8>>, Error> {
        let Some(record) = self.record(origin)? else {
            return Ok(None);
        };
        let raw = self.io.read_to_vec(record.addr, record.nbytes as usize)?;
        let data = self.pipeline.decode(raw, record.filter_mask)?;
        if data.len() != self.layout.chunk_nbytes() {
            return Err(error_filter!(
                "chunk {origin:?} decoded to {} bytes expected {}",
                data.len(),
                self.layout.chunk_nbytes()
            ));
        }
        Ok(Some(data))
    }

    /// A chunk that was never written, holding the fill value when the fill time
    /// writes it and zeros otherwise.
    pub fn init_chunk(&self) -> Vec<u8> {
        let mut buf = vec![0; self.layout.chunk_nbytes()];
        if self.fill.written_on_alloc() {
            self.fill.fill(&mut buf);
        }
        buf
    }

    /// Encodes `data` through `pipeline` and writes it, (re)allocating storage in the
    /// index if the stored size changed. Returns the stored size.
    pub fn write_chunk(
        &mut self,
        origin: &[u64],
        data: &[u8],
        pipeline: &FilterPipeline,
        ratios: &SplitRatios,
    ) -> Result<u32, Error> {
        let (encoded, mask) = if pipeline.is_empty() {
            (None, FilterMask::empty())
        } else {
            let (encoded, mask) = pipeline.encode(data)?;
            (Some(encoded), mask)
        };
        let bytes = encoded.as_deref().unwrap_or(data);
        let nbytes = u32::try_from(bytes.len())
            .map_err(|_| error_filter!("encoded chunk of {} bytes", bytes.len()))?;
        let addr = self
            .index
            .insert(&mut self.io, origin, nbytes, mask, ratios)?;
        self.io.write(addr, bytes)?;
        Ok(nbytes)
    }

    /// Writes raw (unfiltered) bytes at `offset` of the stored chunk.
    pub fn write_direct(&mut self, record: &ChunkRecord, offset: usize, data: &[u8]) -> Result<(), Error> {
        debug_assert!(offset + data.len() <= record.nbytes as usize);
        self.io.write(record.addr + offset as u64, data)
    }

    /// Reads raw (unfiltered) bytes at `offset` of the stored chunk.
    pub fn read_direct(&mut self, record: &ChunkRecord, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        debug_assert!(offset + buf.len() <= record.nbytes as usize);
        self.io.read(record.addr + offset as u64, buf)
    }
}

#[cfg(test)]
pub(crate) fn test_store(
    chunk_dims: &[u64],
    element_size: u32,
    pipeline: FilterPipeline,
    fill: FillValue,
) -> ChunkStore {
    let mut io = Storage::new(
        Arc::new(crate::fs::MemFile::new()),
        crate::freespace::FreeSpace::default(),
    )
    .unwrap();
    let index = ChunkIndex::create(&mut io, chunk_dims.into(), 4, 64 * 1024).unwrap();
    let layout = Arc::new(ChunkLayout::new(chunk_dims.into(), element_size));
    ChunkStore::new(io, index, layout, Arc::new(pipeline), fill)
}
