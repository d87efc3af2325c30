//! Discarding chunks that fall outside a shrunk extent.
use std::ops::ControlFlow;

use crate::{
    cache::ChunkCache,
    error::Error,
    store::ChunkStore,
    utils::{outside_extent, Coords},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Cache entries dropped without being written
    pub discarded: usize,
    /// Chunks removed from the index (and their storage freed)
    pub removed: usize,
    /// Chunks crossing the new boundary whose outside elements were reset
    pub reset: usize,
}

/// Drops every chunk whose origin lies outside `extent`.
///
/// Cache entries are discarded first so a stale entry can never be written back
/// once its index entry is gone. Chunks that cross the new boundary keep their
/// storage but elements outside `extent` are reset to the fill value, so extending
/// the array again exposes fill data. Resetting is skipped unless `reset_boundary`,
/// in a parallel group only the fill writer does it.
pub fn prune_extent(
    cache: &mut ChunkCache,
    store: &mut ChunkStore,
    extent: &[u64],
    reset_boundary: bool,
) -> Result<PruneStats, Error> {
    let mut stats = PruneStats {
        discarded: cache.discard_outside(store, extent)?,
        ..Default::default()
    };

    let mut outside = Vec::new();
    let mut boundary = Vec::new();
    let chunk_dims = store.layout().chunk_dims.clone();
    let straddles = |origin: &[u64]| {
        origin
            .iter()
            .zip(&chunk_dims)
            .zip(extent)
            .any(|((o, c), e)| o + c > *e)
    };
    store.index.iterate(&mut store.io, |origin, _record| {
        if outside_extent(origin, extent) {
            outside.push(Coords::from(origin));
        } else if straddles(origin) {
            boundary.push(Coords::from(origin));
        }
        Ok(ControlFlow::Continue(()))
    })?;
    // removal restructures the tree, so it can't happen while iterating
    for origin in &outside {
        if store.index.remove(&mut store.io, origin)? {
            stats.removed += 1;
        }
    }

    if !reset_boundary {
        return Ok(stats);
    }
    boundary.extend(
        cache
            .origins()
            .into_iter()
            .filter(|o| straddles(o)),
    );
    boundary.sort_unstable();
    boundary.dedup();
    let layout = store.layout().clone();
    for origin in boundary {
        let seq = layout.outside_sequences(&origin, extent);
        if seq.is_done() {
            continue;
        }
        let mut lock = cache.lock(store, &origin, false)?;
        let buf = cache.data_mut(&mut lock);
        let mut naccessed = 0;
        for (offset, len) in seq.iter() {
            store.fill().init(&mut buf[offset..offset + len]);
            naccessed += len;
        }
        cache.unlock(store, lock, true, naccessed)?;
        stats.reset += 1;
    }
    if stats != PruneStats::default() {
        debug!("Pruned to extent {extent:?}: {stats:?}");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::FilterPipeline,
        options::{CacheOptions, FillValue, SplitRatios},
        store::test_store,
    };

    #[test]
    fn test_prune_cache_and_index() {
        let _ = env_logger::try_init();
        let fill = FillValue {
            value: Some(vec![9]),
            ..Default::default()
        };
        let mut store = test_store(&[2, 2], 1, FilterPipeline::default(), fill);
        let mut cache = ChunkCache::new(&CacheOptions::default(), store.layout(), &[6, 6]);
        let ratios = SplitRatios::default();
        let pipeline = store.pipeline().clone();
        // (0,0) (0,4) (4,0) (4,4) stored, (2,4) only cached and dirty
        for origin in [[0, 0], [0, 4], [4, 0], [4, 4]] {
            store
                .write_chunk(&origin, &[1; 4], &pipeline, &ratios)
                .unwrap();
        }
        let mut lock = cache.lock(&mut store, &[2, 4], false).unwrap();
        cache.data_mut(&mut lock).fill(2);
        cache.unlock(&mut store, lock, true, 4).unwrap();
        let mut lock = cache.lock(&mut store, &[4, 0], false).unwrap();
        cache.data_mut(&mut lock).fill(3);
        cache.unlock(&mut store, lock, true, 4).unwrap();

        let stats = prune_extent(&mut cache, &mut store, &[3, 6], true).unwrap();
        // (4,0) cached and stored, (4,4) stored
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.removed, 2);
        // (2,4) is cached and crosses the boundary in the first dimension
        assert_eq!(stats.reset, 1);
        assert!(!cache.contains(&[4, 0]));
        cache.teardown(&mut store).unwrap();
        assert_eq!(store.record(&[4, 0]).unwrap(), None);
        assert_eq!(store.record(&[4, 4]).unwrap(), None);
        assert_eq!(store.read_chunk(&[0, 4]).unwrap().unwrap(), [1; 4]);
        assert_eq!(store.read_chunk(&[2, 4]).unwrap().unwrap(), [2, 2, 9, 9]);
        store.index.validate(&mut store.io).unwrap();
    }
}
