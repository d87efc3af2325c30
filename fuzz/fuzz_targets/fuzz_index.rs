#![no_main]

use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc};

use chunkstore::{
    fs::MemFile,
    fuzzing::{ChunkIndex, FreeSpace, Storage},
    FilterMask, SplitRatios,
};
use libfuzzer_sys::arbitrary;
use libfuzzer_sys::arbitrary::*;
use libfuzzer_sys::fuzz_target;

const CHUNK_DIMS: [u64; 2] = [4, 8];

#[derive(Debug, Arbitrary)]
enum Op {
    Insert(u8, u8, u8),
    Remove(u8, u8),
    Find(u8, u8),
    Reopen,
}

#[derive(Debug, Arbitrary)]
struct Input {
    k: u8,
    ops: Vec<Op>,
}

fn origin(x: u8, y: u8) -> [u64; 2] {
    [(x % 32) as u64 * CHUNK_DIMS[0], (y % 32) as u64 * CHUNK_DIMS[1]]
}

fuzz_target!(|input: Input| {
    let _ = env_logger::try_init();
    let k = (input.k % 6) as usize + 1;
    let ratios = SplitRatios::default();
    let mut io = Storage::new(Arc::new(MemFile::new()), FreeSpace::default()).unwrap();
    let mut index = ChunkIndex::create(&mut io, CHUNK_DIMS[..].into(), k, 4096).unwrap();
    let mut model = BTreeMap::<[u64; 2], u32>::new();
    for op in input.ops {
        match op {
            Op::Insert(x, y, nbytes) => {
                let origin = origin(x, y);
                let nbytes = nbytes.max(1) as u32;
                index
                    .insert(&mut io, &origin, nbytes, FilterMask::empty(), &ratios)
                    .unwrap();
                model.insert(origin, nbytes);
            }
            Op::Remove(x, y) => {
                let origin = origin(x, y);
                let removed = index.remove(&mut io, &origin).unwrap();
                assert_eq!(removed, model.remove(&origin).is_some());
            }
            Op::Find(x, y) => {
                let origin = origin(x, y);
                let record = index.chunk_record(&mut io, &origin).unwrap();
                assert_eq!(record.map(|r| r.nbytes), model.get(&origin).copied());
            }
            Op::Reopen => {
                let root = index.root();
                index = ChunkIndex::open(&mut io, CHUNK_DIMS[..].into(), k, root, 4096).unwrap();
            }
        }
    }
    index.validate(&mut io).unwrap();
    let mut visited = Vec::new();
    index
        .iterate(&mut io, |offset, record| {
            visited.push(([offset[0], offset[1]], record.nbytes));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
    assert_eq!(visited, model.into_iter().collect::<Vec<_>>());
    index.delete(&mut io).unwrap();
    assert_eq!(io.space().allocated_bytes(), 0);
});
