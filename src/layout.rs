//! Chunk geometry: how array elements map to chunks and to bytes inside a chunk.
use crate::{
    error::{error_validation, Error},
    sequence::SeqList,
    utils::Coords,
};

/// Shape of the chunks of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_dims: Coords,
    pub element_size: u32,
}

impl ChunkLayout {
    pub fn new(chunk_dims: Coords, element_size: u32) -> Self {
        Self {
            chunk_dims,
            element_size,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.chunk_dims.len()
    }

    /// Bytes in a full chunk.
    #[inline]
    pub fn chunk_nbytes(&self) -> usize {
        self.chunk_dims.iter().product::<u64>() as usize * self.element_size as usize
    }

    /// Origin of the chunk holding element `coords`.
    pub fn chunk_origin(&self, coords: &[u64]) -> Coords {
        coords
            .iter()
            .zip(&self.chunk_dims)
            .map(|(c, d)| c - c % d)
            .collect()
    }

    pub fn check_origin(&self, origin: &[u64]) -> Result<(), Error> {
        if origin.len() != self.rank()
            || origin.iter().zip(&self.chunk_dims).any(|(o, d)| o % d != 0)
        {
            return Err(error_validation!(
                "{origin:?} isn't a chunk origin for chunks of {:?}",
                self.chunk_dims
            ));
        }
        Ok(())
    }

    /// Origins of every chunk intersecting the box `[start, start + count)`, row-major.
    pub fn chunks_in_box(&self, start: &[u64], count: &[u64]) -> Vec<Coords> {
        let mut result = Vec::new();
        if count.contains(&0) {
            return result;
        }
        let first = self.chunk_origin(start);
        let end: Coords = start.iter().zip(count).map(|(s, c)| s + c).collect();
        let mut counter = first.clone();
        loop {
            result.push(counter.clone());
            let mut dim = self.rank();
            loop {
                if dim == 0 {
                    return result;
                }
                dim -= 1;
                counter[dim] += self.chunk_dims[dim];
                if counter[dim] < end[dim] {
                    break;
                }
                counter[dim] = first[dim];
            }
        }
    }

    /// Sequence lists describing the intersection of the chunk at `origin` with the box
    /// `[start, start + count)`: byte ranges inside the chunk buffer and the matching
    /// ranges inside a row-major buffer holding the box.
    pub fn box_sequences(&self, origin: &[u64], start: &[u64], count: &[u64]) -> (SeqList, SeqList) {
        let rank = self.rank();
        let es = self.element_size as usize;
        let mut chunk_seq = SeqList::new();
        let mut mem_seq = SeqList::new();
        let lo: Coords = (0..rank).map(|i| origin[i].max(start[i])).collect();
        let hi: Coords = (0..rank)
            .map(|i| (origin[i] + self.chunk_dims[i]).min(start[i] + count[i]))
            .collect();
        if (0..rank).any(|i| lo[i] >= hi[i]) {
            return (chunk_seq, mem_seq);
        }
        let run = (hi[rank - 1] - lo[rank - 1]) as usize * es;
        let mut idx = lo.clone();
        loop {
            let (mut chunk_off, mut mem_off) = (0u64, 0u64);
            for i in 0..rank {
                chunk_off = chunk_off * self.chunk_dims[i] + (idx[i] - origin[i]);
                mem_off = mem_off * count[i] + (idx[i] - start[i]);
            }
            chunk_seq.push(chunk_off as usize * es, run);
            mem_seq.push(mem_off as usize * es, run);
            // advance every dimension but the innermost
            let mut dim = rank - 1;
            loop {
                if dim == 0 {
                    return (chunk_seq, mem_seq);
                }
                dim -= 1;
                idx[dim] += 1;
                if idx[dim] < hi[dim] {
                    break;
                }
                idx[dim] = lo[dim];
            }
        }
    }

    /// Byte ranges of the chunk at `origin` holding elements at or beyond `extent`.
    pub fn outside_sequences(&self, origin: &[u64], extent: &[u64]) -> SeqList {
        let rank = self.rank();
        let es = self.element_size as usize;
        let mut seq = SeqList::new();
        let mut idx: Coords = smallvec::smallvec![0; rank];
        let row = self.chunk_dims[rank - 1] as usize * es;
        loop {
            let mut row_off = 0u64;
            for i in 0..rank {
                row_off = row_off * self.chunk_dims[i] + idx[i];
            }
            let row_off = row_off as usize * es;
            if (0..rank - 1).any(|i| origin[i] + idx[i] >= extent[i]) {
                seq.push(row_off, row);
            } else {
                let inside = extent[rank - 1]
                    .saturating_sub(origin[rank - 1])
                    .min(self.chunk_dims[rank - 1]) as usize
                    * es;
                seq.push(row_off + inside, row - inside);
            }
            let mut dim = rank - 1;
            loop {
                if dim == 0 {
                    return seq;
                }
                dim -= 1;
                idx[dim] += 1;
                if idx[dim] < self.chunk_dims[dim] {
                    break;
                }
                idx[dim] = 0;
            }
        }
    }
}
