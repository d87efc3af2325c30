//! Reversible chunk transforms applied when chunks move between the cache and the file.
use std::{fmt, sync::Arc};

use crate::{
    error::{error_filter, error_validation, Error},
    HashMap,
};

/// Maximum number of stages in a pipeline, one mask bit per stage.
pub const MAX_STAGES: usize = 32;

bitflags::bitflags! {
    /// Pipeline stages skipped when a chunk was encoded, bit `i` is stage `i`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FilterMask: u32 {
        const _ = !0;
    }
}

impl FilterMask {
    #[inline]
    pub fn stage(i: usize) -> Self {
        Self::from_bits_retain(1 << i)
    }

    #[inline]
    pub fn skips(&self, i: usize) -> bool {
        self.contains(Self::stage(i))
    }
}

/// A reversible chunk transform.
pub trait Filter: Send + Sync + fmt::Debug {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, Error>;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, Error>;

    /// Bytes an encode is expected to add. Optional stages whose output grows past
    /// this are skipped.
    fn overhead(&self) -> usize {
        0
    }
}

/// Persisted description of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilterDescription {
    pub name: String,
    /// Optional stages are skipped (and recorded in the chunk filter mask) when they
    /// fail or don't pay off, mandatory stage failures abort the chunk write.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub params: Vec<u64>,
}

impl FilterDescription {
    pub fn new(name: impl Into<String>, params: impl Into<Vec<u64>>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            params: params.into(),
        }
    }

    /// Byte shuffle by element size, groups the n-th byte of every element together.
    pub fn shuffle(element_size: u32) -> Self {
        Self::new(SHUFFLE, [element_size as u64])
    }

    /// LZ4 block compression. Optional, incompressible chunks are stored as is.
    pub fn lz4() -> Self {
        Self::new(LZ4, []).optional()
    }

    /// xxh3 checksum appended to the chunk, verified on read.
    pub fn checksum() -> Self {
        Self::new(CHECKSUM, [])
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

const SHUFFLE: &str = "shuffle";
const LZ4: &str = "lz4";
const CHECKSUM: &str = "xxh3";

#[derive(Debug)]
struct Shuffle {
    element_size: usize,
}

impl Filter for Shuffle {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let es = self.element_size;
        let n = data.len() / es;
        let mut out = Vec::with_capacity(data.len());
        for b in 0..es {
            out.extend((0..n).map(|e| data[e * es + b]));
        }
        // trailing partial element is left in place
        out.extend_from_slice(&data[n * es..]);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let es = self.element_size;
        let n = data.len() / es;
        let mut out = vec![0; data.len()];
        for b in 0..es {
            for e in 0..n {
                out[e * es + b] = data[b * n + e];
            }
        }
        out[n * es..].copy_from_slice(&data[n * es..]);
        Ok(out)
    }
}

#[derive(Debug)]
struct Lz4;

impl Filter for Lz4 {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| error_filter!("lz4 decompression failed: {e}"))
    }
}

#[derive(Debug)]
struct Checksum;

impl Filter for Checksum {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(data.len() + 8);
        out.extend_from_slice(data);
        out.extend_from_slice(&xxhash_rust::xxh3::xxh3_64(data).to_le_bytes());
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let Some((body, checksum)) = data.split_last_chunk::<8>() else {
            return Err(error_filter!("checksummed chunk of {} bytes", data.len()));
        };
        let expected = u64::from_le_bytes(*checksum);
        let actual = xxhash_rust::xxh3::xxh3_64(body);
        if actual != expected {
            return Err(error_filter!(
                "chunk checksum mismatch {actual:x} expected {expected:x}"
            ));
        }
        Ok(body.to_vec())
    }

    fn overhead(&self) -> usize {
        8
    }
}

/// Builds a filter from its description.
pub type FilterFactory =
    Arc<dyn Fn(&FilterDescription) -> Result<Box<dyn Filter>, Error> + Send + Sync>;

/// Resolves filter descriptions into pipelines.
/// The default registry knows the built-in shuffle, lz4 and xxh3 filters.
#[derive(Clone)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: Default::default(),
        };
        registry.register(SHUFFLE, |desc| {
            let element_size = match desc.params.as_slice() {
                [es] if *es > 0 => *es as usize,
                _ => {
                    return Err(error_validation!(
                        "shuffle expects one element size parameter, got {:?}",
                        desc.params
                    ))
                }
            };
            Ok(Box::new(Shuffle { element_size }))
        });
        registry.register(LZ4, |_| Ok(Box::new(Lz4)));
        registry.register(CHECKSUM, |_| Ok(Box::new(Checksum)));
        registry
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the factory for filters named `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&FilterDescription) -> Result<Box<dyn Filter>, Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn build(&self, descriptions: &[FilterDescription]) -> Result<FilterPipeline, Error> {
        if descriptions.len() > MAX_STAGES {
            return Err(error_validation!(
                "pipelines are limited to {MAX_STAGES} stages"
            ));
        }
        let mut stages = Vec::with_capacity(descriptions.len());
        for desc in descriptions {
            let factory = self
                .factories
                .get(&desc.name)
                .ok_or_else(|| error_validation!("unknown filter {:?}", desc.name))?;
            stages.push(Stage {
                name: desc.name.clone(),
                optional: desc.optional,
                filter: factory(desc)?,
            });
        }
        Ok(FilterPipeline { stages })
    }
}

struct Stage {
    name: String,
    optional: bool,
    filter: Box<dyn Filter>,
}

/// An ordered list of filters.
#[derive(Default)]
pub struct FilterPipeline {
    stages: Vec<Stage>,
}

impl fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| &s.name))
            .finish()
    }
}

impl FilterPipeline {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Runs every stage in order, returning the encoded bytes and the stages skipped.
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, FilterMask), Error> {
        let mut mask = FilterMask::empty();
        let mut current: Option<Vec<u8>> = None;
        for (i, stage) in self.stages.iter().enumerate() {
            let input = current.as_deref().unwrap_or(data);
            match stage.filter.encode(input) {
                Ok(out) if stage.optional && out.len() > input.len() + stage.filter.overhead() => {
                    trace!("Skipping filter {} output {} > {}", stage.name, out.len(), input.len());
                    mask |= FilterMask::stage(i);
                }
                Ok(out) => current = Some(out),
                Err(e) if stage.optional => {
                    debug!("Skipping failed optional filter {}: {e}", stage.name);
                    mask |= FilterMask::stage(i);
                }
                Err(e) => return Err(e),
            }
        }
        Ok((current.unwrap_or_else(|| data.to_vec()), mask))
    }

    /// Runs the stages not in `mask` in reverse order.
    pub fn decode(&self, data: Vec<u8>, mask: FilterMask) -> Result<Vec<u8>, Error> {
        let mut current = data;
        for (i, stage) in self.stages.iter().enumerate().rev() {
            if mask.skips(i) {
                continue;
            }
            current = stage.filter.decode(&current).map_err(|e| {
                if e.is_filter() {
                    e
                } else {
                    error_filter!("filter {} failed: {e}", stage.name)
                }
            })?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::utils::test_rng;

    #[derive(Debug)]
    struct Failing;

    impl Filter for Failing {
        fn encode(&self, _data: &[u8]) -> Result<Vec<u8>, Error> {
            Err(error_filter!("nope"))
        }

        fn decode(&self, _data: &[u8]) -> Result<Vec<u8>, Error> {
            Err(error_filter!("nope"))
        }
    }

    #[test]
    fn test_shuffle_compress_checksum() {
        let registry = FilterRegistry::default();
        let pipeline = registry
            .build(&[
                FilterDescription::shuffle(4),
                FilterDescription::lz4(),
                FilterDescription::checksum(),
            ])
            .unwrap();
        assert_eq!(pipeline.len(), 3);
        // small increasing integers shuffle into long runs
        let data = (0..1001u32).flat_map(|i| i.to_le_bytes()).chain([7, 7]).collect::<Vec<u8>>();
        let (encoded, mask) = pipeline.encode(&data).unwrap();
        assert_eq!(mask, FilterMask::empty());
        assert!(encoded.len() < data.len());
        assert_eq!(pipeline.decode(encoded.clone(), mask).unwrap(), data);

        let mut corrupted = encoded;
        corrupted[10] ^= 1;
        assert!(pipeline.decode(corrupted, mask).unwrap_err().is_filter());
    }

    #[test]
    fn test_optional_stage_skipped() {
        let registry = FilterRegistry::default();
        let pipeline = registry.build(&[FilterDescription::lz4()]).unwrap();
        let mut data = vec![0u8; 4096];
        test_rng().fill_bytes(&mut data);
        let (encoded, mask) = pipeline.encode(&data).unwrap();
        assert!(mask.skips(0));
        assert_eq!(encoded, data);
        assert_eq!(pipeline.decode(encoded, mask).unwrap(), data);
    }

    #[test]
    fn test_custom_filters() {
        let mut registry = FilterRegistry::new();
        registry.register("failing", |_| Ok(Box::new(Failing)));
        let mandatory = registry
            .build(&[FilterDescription::new("failing", [])])
            .unwrap();
        assert!(mandatory.encode(b"abc").unwrap_err().is_filter());
        let optional = registry
            .build(&[FilterDescription::new("failing", []).optional()])
            .unwrap();
        let (encoded, mask) = optional.encode(b"abc").unwrap();
        assert_eq!((encoded.as_slice(), mask), (&b"abc"[..], FilterMask::stage(0)));

        assert!(matches!(
            registry.build(&[FilterDescription::new("zstd", [])]),
            Err(Error::Validation(_))
        ));
        assert!(registry
            .build(&[FilterDescription::new("shuffle", [])])
            .is_err());
    }
}
