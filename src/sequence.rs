//! Sequence lists: scatter-gather descriptions of byte ranges inside a buffer.
use crate::error::{error_validation, Error};

/// An ordered list of `(offset, length)` byte ranges with a consume cursor.
///
/// Adjacent ranges are merged when pushed. Copies consume the list from the front,
/// possibly leaving the current range partially consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqList {
    offsets: Vec<usize>,
    lens: Vec<usize>,
    /// Index of the current range
    pos: usize,
}

impl SeqList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single range.
    pub fn single(offset: usize, len: usize) -> Self {
        let mut result = Self::new();
        result.push(offset, len);
        result
    }

    pub fn push(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        if let (Some(last_off), Some(last_len)) = (self.offsets.last(), self.lens.last_mut()) {
            if last_off + *last_len == offset {
                *last_len += len;
                return;
            }
        }
        self.offsets.push(offset);
        self.lens.push(len);
    }

    /// Number of ranges not yet fully consumed.
    #[inline]
    pub fn remaining_ranges(&self) -> usize {
        self.offsets.len() - self.pos
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.pos == self.offsets.len()
    }

    /// Bytes not yet consumed.
    pub fn remaining_bytes(&self) -> usize {
        self.lens[self.pos..].iter().sum()
    }

    /// Highest byte offset referenced (exclusive).
    pub fn end(&self) -> usize {
        self.offsets
            .iter()
            .zip(&self.lens)
            .map(|(o, l)| o + l)
            .max()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.offsets[self.pos..]
            .iter()
            .copied()
            .zip(self.lens[self.pos..].iter().copied())
    }

    fn current(&self) -> Option<(usize, usize)> {
        Some((*self.offsets.get(self.pos)?, self.lens[self.pos]))
    }

    fn consume(&mut self, n: usize) {
        self.offsets[self.pos] += n;
        self.lens[self.pos] -= n;
        if self.lens[self.pos] == 0 {
            self.pos += 1;
        }
    }

    pub(crate) fn check_bounds(&self, buf_len: usize, what: &str) -> Result<(), Error> {
        if self.end() > buf_len {
            return Err(error_validation!(
                "{what} sequence reaches byte {} of a {buf_len} byte buffer",
                self.end()
            ));
        }
        Ok(())
    }
}

/// Walks two sequence lists in lockstep, calling `op(a_offset, b_offset, len)` for
/// every piece where both lists have bytes left. Both lists are consumed, returns the
/// total length visited.
pub fn for_each_vv<F>(a_seq: &mut SeqList, b_seq: &mut SeqList, mut op: F) -> Result<usize, Error>
where
    F: FnMut(usize, usize, usize) -> Result<(), Error>,
{
    let mut total = 0;
    while let (Some((a_off, a_len)), Some((b_off, b_len))) = (a_seq.current(), b_seq.current()) {
        let n = a_len.min(b_len);
        op(a_off, b_off, n)?;
        a_seq.consume(n);
        b_seq.consume(n);
        total += n;
    }
    Ok(total)
}

/// Copies bytes described by `src_seq` in `src` to the ranges described by `dst_seq` in `dst`,
/// until either list is exhausted. Both lists are consumed, returns the bytes copied.
pub fn copy_vv(
    dst: &mut [u8],
    dst_seq: &mut SeqList,
    src: &[u8],
    src_seq: &mut SeqList,
) -> Result<usize, Error> {
    dst_seq.check_bounds(dst.len(), "destination")?;
    src_seq.check_bounds(src.len(), "source")?;
    for_each_vv(dst_seq, src_seq, |d_off, s_off, n| {
        dst[d_off..d_off + n].copy_from_slice(&src[s_off..s_off + n]);
        Ok(())
    })
}
