#![no_main]

use std::collections::BTreeMap;

use chunkstore::fuzzing::FreeSpace;
use libfuzzer_sys::arbitrary;
use libfuzzer_sys::arbitrary::*;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Alloc(u16),
    /// Frees the n-th live allocation
    Free(u8),
    /// Frees a random range, usually a double free
    FreeRaw(u16, u16),
}

#[derive(Debug, Arbitrary)]
struct Input {
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let mut subject = FreeSpace::default();
    // addr -> len
    let mut model = BTreeMap::<u64, u64>::new();
    for op in input.ops {
        match op {
            Op::Alloc(len) => {
                let len = len.max(1) as u64;
                let addr = subject.alloc(len).unwrap();
                if let Some((a, l)) = model.range(..addr + len).next_back() {
                    assert!(a + l <= addr, "{addr}+{len} overlaps {a}+{l}");
                }
                model.insert(addr, len);
            }
            Op::Free(n) => {
                if model.is_empty() {
                    continue;
                }
                let addr = *model.keys().nth(n as usize % model.len()).unwrap();
                let len = model.remove(&addr).unwrap();
                subject.free(addr, len).unwrap();
            }
            Op::FreeRaw(addr, len) => {
                let (addr, len) = (addr as u64, len.max(1) as u64);
                let overlaps_live = model.range(..addr + len).next_back().is_some_and(|(a, l)| a + l > addr);
                if overlaps_live {
                    continue;
                }
                // the range is entirely free (or past eoa), must be rejected
                assert!(subject.free(addr, len).is_err());
            }
        }
        subject.validate().unwrap();
        assert_eq!(subject.allocated_bytes(), model.values().sum::<u64>());
    }
    for (addr, len) in std::mem::take(&mut model) {
        subject.free(addr, len).unwrap();
    }
    assert_eq!((subject.eoa(), subject.free_bytes()), (0, 0));
});
