use std::path::Path;

use crate::{
    error::{error_validation, Error},
    filter::FilterDescription,
    fs::FileSystem,
    utils::Coords,
};

/// Name of the metadata file inside an array folder.
pub(crate) const METADATA_FILE: &str = "ARRAY";
/// Name of the data file inside an array folder.
pub(crate) const DATA_FILE: &str = "data";

/// When the fill value is written to newly allocated chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FillTime {
    /// Always write the fill value (zeros if no value is set) when storage is allocated.
    Alloc,
    /// Write the fill value only if the user set one.
    #[default]
    IfSet,
    /// Never write fill values, unwritten storage holds whatever the file held.
    Never,
}

/// When chunk storage is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AllocTime {
    /// All chunks covering the extent are allocated on create and on every extent growth.
    Early,
    /// All chunks covering the extent are allocated on the first write.
    Late,
    /// Chunks are allocated as they're first flushed from the cache.
    #[default]
    Incremental,
}

/// The fill value pattern and its write policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FillValue {
    /// Pattern replicated over every element, its length must match the element size.
    /// `None` means zeros.
    pub value: Option<Vec<u8>>,
    /// Default: [FillTime::IfSet]
    pub fill_time: FillTime,
}

impl FillValue {
    /// Whether allocation should write the fill value, ignoring overwrite hints.
    pub fn written_on_alloc(&self) -> bool {
        match self.fill_time {
            FillTime::Alloc => true,
            FillTime::IfSet => self.value.is_some(),
            FillTime::Never => false,
        }
    }

    /// Initializes never written elements: the pattern if the fill time writes it,
    /// zeros otherwise.
    pub fn init(&self, buf: &mut [u8]) {
        if self.written_on_alloc() {
            self.fill(buf);
        } else {
            buf.fill(0);
        }
    }

    /// Fills `buf` with the pattern, or zeros if none is set.
    pub fn fill(&self, buf: &mut [u8]) {
        match self.value.as_deref() {
            Some(pattern) if !pattern.is_empty() && pattern.iter().any(|b| *b != 0) => {
                for dst in buf.chunks_mut(pattern.len()) {
                    dst.copy_from_slice(&pattern[..dst.len()]);
                }
            }
            _ => buf.fill(0),
        }
    }
}

/// Node split ratios, the fraction of children that stay in the left node when
/// splitting the leftmost, an interior or the rightmost node of a level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    /// Default: `0.1`
    pub left: f64,
    /// Default: `0.5`
    pub middle: f64,
    /// Default: `0.9`
    pub right: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            left: 0.1,
            middle: 0.5,
            right: 0.9,
        }
    }
}

impl SplitRatios {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        for r in [self.left, self.middle, self.right] {
            if !(0.0..=1.0).contains(&r) {
                return Err(error_validation!("split ratio {r} outside [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Persistent options of a chunked array
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ArrayOptions {
    /// Initial extent of the array.
    pub dims: Vec<u64>,
    /// Maximum extent, `None` means the array can't be extended past `dims`.
    /// Use `u64::MAX` for unlimited dimensions.
    ///
    /// Default: `None`
    pub max_dims: Option<Vec<u64>>,
    /// Chunk size in elements, same rank as `dims`.
    pub chunk_dims: Vec<u64>,
    /// Element size in bytes.
    ///
    /// Default: `1`
    pub element_size: u32,
    /// Default: no value, [FillTime::IfSet]
    pub fill: FillValue,
    /// Default: [AllocTime::Incremental]
    pub alloc_time: AllocTime,
    /// Filters applied to chunks when they're written to the file, in encode order.
    ///
    /// Default: empty
    pub filters: Vec<FilterDescription>,
    /// Chunk index nodes hold up to `2 * btree_k` children.
    ///
    /// Default: `32`
    pub btree_k: u16,
}

impl ArrayOptions {
    pub fn new(dims: impl Into<Vec<u64>>, chunk_dims: impl Into<Vec<u64>>) -> Self {
        Self {
            dims: dims.into(),
            max_dims: None,
            chunk_dims: chunk_dims.into(),
            element_size: 1,
            fill: FillValue::default(),
            alloc_time: AllocTime::default(),
            filters: Vec::new(),
            btree_k: 32,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.chunk_dims.len()
    }

    pub(crate) fn chunk_coords(&self) -> Coords {
        self.chunk_dims.iter().copied().collect()
    }

    /// Size in bytes of a full (unfiltered) chunk.
    pub fn chunk_nbytes(&self) -> u64 {
        self.chunk_dims
            .iter()
            .fold(self.element_size as u64, |acc, d| acc.saturating_mul(*d))
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.rank() == 0 {
            return Err(Error::validation("arrays must have at least one dimension"));
        }
        if self.dims.len() != self.rank() {
            return Err(error_validation!(
                "dims {:?} and chunk_dims {:?} have different ranks",
                self.dims,
                self.chunk_dims
            ));
        }
        if self.chunk_dims.contains(&0) {
            return Err(Error::validation("chunk dimensions must be > 0"));
        }
        if self.element_size == 0 {
            return Err(Error::validation("element_size must be > 0"));
        }
        // stored sizes are 32 bits in chunk keys and filters may add some overhead
        if self.chunk_nbytes() > u32::MAX as u64 / 2 {
            return Err(error_validation!(
                "chunk size {} bytes is too large",
                self.chunk_nbytes()
            ));
        }
        if let Some(max_dims) = &self.max_dims {
            if max_dims.len() != self.rank() {
                return Err(error_validation!("max_dims {max_dims:?} has the wrong rank"));
            }
        }
        self.check_extent(&self.dims)?;
        if let Some(value) = &self.fill.value {
            if value.len() != self.element_size as usize {
                return Err(error_validation!(
                    "fill value has {} bytes, element size is {}",
                    value.len(),
                    self.element_size
                ));
            }
        }
        if !(1..=i16::MAX as u16).contains(&self.btree_k) {
            return Err(error_validation!("btree_k {} out of range", self.btree_k));
        }
        Ok(())
    }

    /// Checks that `extent` is a valid extent for this array.
    pub(crate) fn check_extent(&self, extent: &[u64]) -> Result<(), Error> {
        if extent.len() != self.rank() {
            return Err(error_validation!(
                "extent {extent:?} has rank {} expected {}",
                extent.len(),
                self.rank()
            ));
        }
        let max_dims = self.max_dims.as_deref().unwrap_or(&self.dims);
        if let Some(i) = (0..self.rank()).find(|i| extent[*i] > max_dims[*i]) {
            return Err(error_validation!(
                "extent {extent:?} exceeds maximum {max_dims:?} in dimension {i}"
            ));
        }
        Ok(())
    }
}

/// State persisted in the array folder metadata file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct ArrayMetadata {
    pub options: ArrayOptions,
    pub extent: Vec<u64>,
    pub index_root: u64,
    pub space: crate::freespace::FreeSpace,
}

impl ArrayMetadata {
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn read_from_folder(fs: &dyn FileSystem, path: &Path) -> Result<Option<Self>, Error> {
        let path = path.join(METADATA_FILE);
        if fs.exists(&path) {
            Self::from_bytes(&fs.read_file(&path)?).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn write_to_folder(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), Error> {
        let bytes = self.to_bytes()?;
        fs.replace_file(&path.join(METADATA_FILE), &bytes)?;
        fs.sync_dir(path)?;
        Ok(())
    }
}

/// Runtime options of an open array, not persisted.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CacheOptions {
    /// Chunk cache byte budget. Chunks larger than the budget bypass the cache.
    ///
    /// Default: `1 MB`
    pub cache_size: usize,
    /// Number of hash slots of the chunk cache.
    ///
    /// Default: `521`
    pub cache_slots: usize,
    /// Fraction of the LRU scan during cache pruning that only evicts chunks
    /// which were fully read or fully written.
    ///
    /// Default: `0.75`
    pub w0: f64,
    /// Default: see [SplitRatios]
    pub split_ratios: SplitRatios,
    /// Byte budget of the chunk index node cache.
    ///
    /// Default: `256 KB`
    pub node_cache_size: usize,
    /// Allocations that would grow the data file past this size fail.
    ///
    /// Default: `None`
    pub max_file_size: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_size: 1024 * 1024,
            cache_slots: 521,
            w0: 0.75,
            split_ratios: SplitRatios::default(),
            node_cache_size: 256 * 1024,
            max_file_size: None,
        }
    }
}

impl CacheOptions {
    /// A new default CacheOptions
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.cache_slots == 0 {
            return Err(Error::validation("cache_slots must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.w0) {
            return Err(error_validation!("w0 {} outside [0, 1]", self.w0));
        }
        self.split_ratios.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let mut options = ArrayOptions::new([90, 90], [20, 20]);
        options.validate().unwrap();
        assert_eq!(options.chunk_nbytes(), 400);
        options.fill.value = Some(vec![1, 2]);
        assert!(options.validate().is_err());
        options.element_size = 2;
        options.validate().unwrap();
        options.max_dims = Some(vec![100, u64::MAX]);
        options.check_extent(&[100, 1 << 40]).unwrap();
        assert!(options.check_extent(&[101, 0]).is_err());
        assert!(options.check_extent(&[1]).is_err());
        options.chunk_dims = vec![0, 1];
        assert!(options.validate().is_err());

        let mut cache = CacheOptions::new();
        cache.validate().unwrap();
        cache.split_ratios.left = 1.5;
        assert!(cache.validate().is_err());
    }

    #[test]
    fn test_fill_pattern() {
        let mut fill = FillValue::default();
        let mut buf = [9u8; 6];
        fill.fill(&mut buf);
        assert_eq!(buf, [0; 6]);
        assert!(!fill.written_on_alloc());
        fill.value = Some(vec![1, 2, 3]);
        fill.fill(&mut buf);
        assert_eq!(buf, [1, 2, 3, 1, 2, 3]);
        assert!(fill.written_on_alloc());
        fill.fill_time = FillTime::Never;
        assert!(!fill.written_on_alloc());
        fill.init(&mut buf);
        assert_eq!(buf, [0; 6]);
        fill.fill_time = FillTime::Alloc;
        fill.init(&mut buf);
        assert_eq!(buf, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_metadata_json() {
        let mut options = ArrayOptions::new([10], [4]);
        options.filters.push(FilterDescription::lz4());
        let meta = ArrayMetadata {
            options,
            extent: vec![10],
            index_root: 0,
            space: Default::default(),
        };
        let decoded = ArrayMetadata::from_bytes(&meta.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.options, meta.options);
        assert!(ArrayMetadata::from_bytes(b"{").is_err());
    }
}
