//! Chunked N-dimensional array storage.
//!
//! An array is split into fixed size chunks. Chunks are located through a B-tree
//! keyed by chunk origin, filtered (shuffled, compressed, checksummed) on their way
//! to the file and held in a write-back LRU cache while being accessed.
//!
//! ```no_run
//! use chunkstore::{ArrayOptions, ChunkedArray};
//!
//! let options = ArrayOptions::new([90, 90], [20, 20]);
//! let mut array = ChunkedArray::create("/tmp/array", options).unwrap();
//! array.write_box(&[0, 0], &[2, 2], &[1, 2, 3, 4]).unwrap();
//! assert_eq!(array.read_box(&[1, 0], &[1, 2]).unwrap(), [3, 4]);
//! array.close().unwrap();
//! ```
#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_more;

mod allocator;
mod array;
mod btree;
mod cache;
mod coordinator;
mod error;
mod filter;
mod freespace;
pub mod fs;
mod index;
mod layout;
mod node;
mod options;
mod prune;
mod sequence;
mod storage;
mod store;
mod utils;


pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, foldhash::fast::RandomState>;
pub(crate) type HashSet<K> = hashbrown::HashSet<K, foldhash::fast::RandomState>;

pub use allocator::AllocStats;
pub use array::ChunkedArray;
pub use btree::TreeInfo;
pub use cache::CacheStats;
pub use coordinator::{Coordinator, SingleProcess, ThreadGroup};
pub use error::Error;
pub use filter::{Filter, FilterDescription, FilterMask, FilterPipeline, FilterRegistry};
pub use index::ChunkRecord;
pub use layout::ChunkLayout;
pub use options::{AllocTime, ArrayOptions, CacheOptions, FillTime, FillValue, SplitRatios};
pub use prune::PruneStats;
pub use sequence::SeqList;
pub use storage::IoStats;
pub use utils::Coords;

#[doc(hidden)]
pub mod fuzzing {
    //! Internals exposed to the fuzz targets.
    pub use crate::{freespace::FreeSpace, index::ChunkIndex, storage::Storage};
}
