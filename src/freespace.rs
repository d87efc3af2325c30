//! Byte granular file space management.
//!
//! Free ranges are kept sorted by address and always coalesced, so two adjacent
//! ranges never coexist. Space beyond the end of allocation (eoa) is implicitly free
//! and a free range touching eoa is given back to the horizon immediately.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{error_allocation, error_corrupt, Error};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpace {
    /// Free ranges, address -> length.
    /// Invariant: disjoint, non adjacent and strictly below eoa.
    ranges: BTreeMap<u64, u64>,
    /// End of allocation
    eoa: u64,
    /// Sum of the ranges lengths
    free_bytes: u64,
    /// Allocations may not push eoa past this value
    #[serde(skip)]
    max_file_size: Option<u64>,
}

impl FreeSpace {
    pub fn new(max_file_size: Option<u64>) -> Self {
        Self {
            max_file_size,
            ..Default::default()
        }
    }

    pub fn set_max_file_size(&mut self, max_file_size: Option<u64>) {
        self.max_file_size = max_file_size;
    }

    /// End of allocation, no allocated byte lies at or beyond it.
    #[inline]
    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    #[inline]
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    #[inline]
    pub fn allocated_bytes(&self) -> u64 {
        self.eoa - self.free_bytes
    }

    pub fn iter_free(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(a, l)| (*a, *l))
    }

    /// Allocates `len` bytes, preferring the smallest free range that fits
    /// (lowest address on ties) before growing the end of allocation.
    pub fn alloc(&mut self, len: u64) -> Result<u64, Error> {
        if len == 0 {
            return Err(error_allocation!("zero length allocation"));
        }
        let best = self
            .ranges
            .iter()
            .filter(|(_, l)| **l >= len)
            .min_by_key(|(a, l)| (**l, **a))
            .map(|(a, l)| (*a, *l));
        if let Some((addr, range_len)) = best {
            self.ranges.remove(&addr);
            if range_len > len {
                self.ranges.insert(addr + len, range_len - len);
            }
            self.free_bytes -= len;
            return Ok(addr);
        }

        let new_eoa = self
            .eoa
            .checked_add(len)
            .ok_or_else(|| error_allocation!("address space exhausted allocating {len}"))?;
        if let Some(max) = self.max_file_size {
            if new_eoa > max {
                return Err(error_allocation!(
                    "allocation of {len} bytes exceeds maximum file size {max} (eoa {})",
                    self.eoa
                ));
            }
        }
        let addr = self.eoa;
        self.eoa = new_eoa;
        Ok(addr)
    }

    /// Returns `[addr, addr + len)` to the free space.
    /// Freeing space that isn't allocated is reported as corruption.
    pub fn free(&mut self, addr: u64, len: u64) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        let end = addr
            .checked_add(len)
            .filter(|end| *end <= self.eoa)
            .ok_or_else(|| error_corrupt!("free of {addr}+{len} beyond eoa {}", self.eoa))?;

        let mut start = addr;
        let mut new_len = len;
        if let Some((&prev, &prev_len)) = self.ranges.range(..=addr).next_back() {
            if prev + prev_len > addr {
                return Err(error_corrupt!("double free of {addr}+{len}"));
            }
            if prev + prev_len == addr {
                self.ranges.remove(&prev);
                start = prev;
                new_len += prev_len;
            }
        }
        if let Some((&next, &next_len)) = self.ranges.range(addr..).next() {
            if next < end {
                return Err(error_corrupt!("double free of {addr}+{len}"));
            }
            if next == end {
                self.ranges.remove(&next);
                new_len += next_len;
            }
        }
        self.free_bytes += len;
        self.ranges.insert(start, new_len);
        self.truncate_end();
        Ok(())
    }

    /// Gives the trailing free range (if any) back to the end of allocation.
    fn truncate_end(&mut self) {
        if let Some((&addr, &len)) = self.ranges.last_key_value() {
            if addr + len == self.eoa {
                self.ranges.remove(&addr);
                self.eoa = addr;
                self.free_bytes -= len;
                trace!("Returned {len} bytes to eoa {}", self.eoa);
            }
        }
    }

    /// Checks internal invariants, used by tests and fuzzing.
    pub fn validate(&self) -> Result<(), Error> {
        let mut prev_end = None;
        let mut total = 0;
        for (&addr, &len) in &self.ranges {
            if len == 0 || prev_end.is_some_and(|e| e >= addr) {
                return Err(error_corrupt!("bad free range {addr}+{len}"));
            }
            prev_end = Some(addr + len);
            total += len;
        }
        if prev_end.is_some_and(|e| e >= self.eoa) || total != self.free_bytes {
            return Err(error_corrupt!("free space accounting mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::utils::test_rng;

    #[test]
    fn test_coalesce_and_truncate() {
        let mut fs = FreeSpace::default();
        let a = fs.alloc(100).unwrap();
        let b = fs.alloc(50).unwrap();
        let c = fs.alloc(10).unwrap();
        assert_eq!((a, b, c), (0, 100, 150));
        fs.free(a, 100).unwrap();
        fs.free(b, 50).unwrap();
        assert_eq!(fs.iter_free().collect::<Vec<_>>(), [(0, 150)]);
        assert_eq!(fs.free_bytes(), 150);
        fs.free(c, 10).unwrap();
        assert_eq!(fs.eoa(), 0);
        assert_eq!(fs.free_bytes(), 0);
        fs.validate().unwrap();
    }

    #[test]
    fn test_best_fit_reuse() {
        let mut fs = FreeSpace::default();
        let addrs = (0..6).map(|_| fs.alloc(40).unwrap()).collect::<Vec<_>>();
        fs.free(addrs[1], 40).unwrap();
        fs.free(addrs[3], 40).unwrap();
        fs.free(addrs[4], 40).unwrap();
        // the 40 byte hole is a better fit than the 80 byte one
        assert_eq!(fs.alloc(30).unwrap(), addrs[1]);
        assert_eq!(fs.alloc(80).unwrap(), addrs[3]);
        assert_eq!(fs.alloc(20).unwrap(), 240);
        fs.validate().unwrap();
    }

    #[test]
    fn test_errors() {
        let mut fs = FreeSpace::new(Some(100));
        assert!(matches!(fs.alloc(0), Err(Error::AllocationFailure(_))));
        let a = fs.alloc(60).unwrap();
        assert!(matches!(fs.alloc(41), Err(Error::AllocationFailure(_))));
        fs.alloc(40).unwrap();
        fs.free(a, 60).unwrap();
        assert!(fs.free(a + 10, 5).unwrap_err().is_corruption());
        assert!(fs.free(90, 20).unwrap_err().is_corruption());
        fs.validate().unwrap();
    }

    #[test]
    fn test_random_workload() {
        let _ = env_logger::try_init();
        let mut rng = test_rng();
        let mut fs = FreeSpace::default();
        let mut live: Vec<(u64, u64)> = Vec::new();
        for _ in 0..2_000 {
            if live.is_empty() || rng.random_bool(0.6) {
                let len = rng.random_range(1..500);
                let addr = fs.alloc(len).unwrap();
                assert!(live
                    .iter()
                    .all(|(a, l)| addr + len <= *a || a + l <= addr));
                live.push((addr, len));
            } else {
                let (addr, len) = live.swap_remove(rng.random_range(0..live.len()));
                fs.free(addr, len).unwrap();
            }
            fs.validate().unwrap();
            assert_eq!(
                fs.allocated_bytes(),
                live.iter().map(|(_, l)| l).sum::<u64>()
            );
        }
    }
}
