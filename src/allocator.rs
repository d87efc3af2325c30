//! Bulk storage reservation for every chunk covering an extent.
use crate::{
    cache::ChunkCache,
    coordinator::Coordinator,
    error::Error,
    filter::FilterMask,
    options::SplitRatios,
    store::ChunkStore,
    utils::{next_chunk_origin, ByteSize, Coords},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Chunks that got storage
    pub allocated: usize,
    /// Chunks whose fill value was written by this process
    pub filled: usize,
}

/// Reserves storage for every chunk covering `extent` that is neither cached nor
/// indexed, visiting origins in row-major order.
///
/// New chunks get the fill value written when the fill policy asks for it, or when
/// a filter pipeline is configured since unwritten storage couldn't be decoded.
/// `full_overwrite` means the caller is about to write every element, which skips
/// fill writes in the absence of filters. In a parallel group only the fill writer
/// writes fill data and the group synchronizes afterwards.
pub fn allocate_chunks(
    cache: &ChunkCache,
    store: &mut ChunkStore,
    coordinator: &dyn Coordinator,
    extent: &[u64],
    ratios: &SplitRatios,
    full_overwrite: bool,
) -> Result<AllocStats, Error> {
    let mut stats = AllocStats::default();
    if extent.contains(&0) {
        return Ok(stats);
    }
    let layout = store.layout().clone();
    let pipeline = store.pipeline().clone();
    let write_fill = !pipeline.is_empty() || (!full_overwrite && store.fill().written_on_alloc());
    let (fill_bytes, fill_mask) = if write_fill {
        let data = store.init_chunk();
        if pipeline.is_empty() {
            (data, FilterMask::empty())
        } else {
            pipeline.encode(&data)?
        }
    } else {
        (Vec::new(), FilterMask::empty())
    };
    let nbytes = if write_fill {
        fill_bytes.len()
    } else {
        layout.chunk_nbytes()
    } as u32;

    let mut origin: Coords = smallvec::smallvec![0; layout.rank()];
    loop {
        if !cache.contains(&origin) && store.record(&origin)?.is_none() {
            let addr = store
                .index
                .insert(&mut store.io, &origin, nbytes, fill_mask, ratios)?;
            stats.allocated += 1;
            if write_fill && coordinator.is_fill_writer() {
                store.io.write(addr, &fill_bytes)?;
                stats.filled += 1;
            }
        }
        if !next_chunk_origin(&mut origin, &layout.chunk_dims, extent) {
            break;
        }
    }

    if stats.allocated != 0 {
        debug!(
            "Allocated {} chunks of {} for extent {extent:?}",
            stats.allocated,
            ByteSize(nbytes as u64)
        );
        if coordinator.is_parallel() {
            coordinator.barrier()?;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::SingleProcess,
        filter::{FilterDescription, FilterPipeline, FilterRegistry},
        options::{CacheOptions, FillTime, FillValue},
        prune::prune_extent,
        store::test_store,
    };

    #[test]
    fn test_allocate_and_prune_grid() {
        let _ = env_logger::try_init();
        let mut store = test_store(&[20, 20], 1, FilterPipeline::default(), FillValue::default());
        let mut cache = ChunkCache::new(&CacheOptions::default(), store.layout(), &[90, 90]);
        let ratios = SplitRatios::default();
        let stats =
            allocate_chunks(&cache, &mut store, &SingleProcess, &[90, 90], &ratios, false).unwrap();
        assert_eq!(stats, AllocStats { allocated: 25, filled: 0 });
        assert_eq!(store.index.len(&mut store.io).unwrap(), 25);
        assert_eq!(store.index.allocated_bytes(&mut store.io).unwrap(), 25 * 400);

        let allocations = store.storage().stats().allocations;
        let stats =
            allocate_chunks(&cache, &mut store, &SingleProcess, &[90, 90], &ratios, false).unwrap();
        assert_eq!(stats.allocated, 0);
        assert_eq!(store.storage().stats().allocations, allocations);

        let stats = prune_extent(&mut cache, &mut store, &[70, 70], true).unwrap();
        assert_eq!(stats.removed, 9);
        let records = store.index.records(&mut store.io).unwrap();
        assert_eq!(records.len(), 16);
        assert!(records.iter().all(|(o, _)| o.iter().all(|c| *c < 70)));
    }

    #[test]
    fn test_fill_written() {
        let fill = FillValue {
            value: Some(vec![5, 6]),
            fill_time: FillTime::IfSet,
        };
        let mut store = test_store(&[2, 2], 2, FilterPipeline::default(), fill);
        let cache = ChunkCache::new(&CacheOptions::default(), store.layout(), &[4, 2]);
        let ratios = SplitRatios::default();
        let stats =
            allocate_chunks(&cache, &mut store, &SingleProcess, &[4, 2], &ratios, false).unwrap();
        assert_eq!(stats, AllocStats { allocated: 2, filled: 2 });
        assert_eq!(
            store.read_chunk(&[2, 0]).unwrap().unwrap(),
            [5, 6, 5, 6, 5, 6, 5, 6]
        );
        // overwriting everything anyway, no fill needed
        let stats =
            allocate_chunks(&cache, &mut store, &SingleProcess, &[4, 4], &ratios, true).unwrap();
        assert_eq!(stats, AllocStats { allocated: 2, filled: 0 });
    }

    #[test]
    fn test_filtered_fill_size() {
        let pipeline = FilterRegistry::default()
            .build(&[FilterDescription::lz4()])
            .unwrap();
        let mut store = test_store(&[64], 1, pipeline, FillValue::default());
        let cache = ChunkCache::new(&CacheOptions::default(), store.layout(), &[128]);
        let ratios = SplitRatios::default();
        let stats =
            allocate_chunks(&cache, &mut store, &SingleProcess, &[128], &ratios, true).unwrap();
        assert_eq!(stats.filled, 2);
        let record = store.record(&[64]).unwrap().unwrap();
        // zeros compress
        assert!(record.nbytes < 64);
        assert_eq!(store.read_chunk(&[64]).unwrap().unwrap(), [0; 64]);
    }
}
