#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use chunkstore::{
    fs::{FileSystem, MemFS},
    ArrayOptions, CacheOptions, ChunkedArray, FilterDescription, FilterRegistry, SingleProcess,
};
use libfuzzer_sys::fuzz_target;

#[macro_use]
extern crate log;

const MAX: u64 = 24;
const FILL: u8 = 0x5A;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { x: u8, y: u8, w: u8, h: u8, byte: u8 },
    Read { x: u8, y: u8, w: u8, h: u8 },
    SetExtent(u8, u8),
    Flush,
    Reopen,
}

#[derive(Debug, Arbitrary)]
struct Input {
    filtered: bool,
    cache_chunks: u8,
    ops: Vec<Op>,
}

/// Clamps a box to the extent, `None` if it would be empty.
fn clamp(extent: [u64; 2], x: u8, y: u8, w: u8, h: u8) -> Option<([u64; 2], [u64; 2])> {
    if extent.contains(&0) {
        return None;
    }
    let start = [x as u64 % extent[0], y as u64 % extent[1]];
    let count = [
        (w as u64 % (extent[0] - start[0])) + 1,
        (h as u64 % (extent[1] - start[1])) + 1,
    ];
    Some((start, count))
}

struct Model {
    extent: [u64; 2],
    grid: Vec<u8>,
}

impl Model {
    fn idx(&self, r: u64, c: u64) -> usize {
        (r * MAX + c) as usize
    }
}

fn open(fs: &Arc<dyn FileSystem>, cache_options: &CacheOptions) -> ChunkedArray {
    ChunkedArray::open_with(
        fs.clone(),
        "/fuzz",
        cache_options.clone(),
        &FilterRegistry::default(),
        Arc::new(SingleProcess),
    )
    .unwrap()
}

fuzz_target!(|input: Input| {
    let _ = env_logger::try_init();
    let fs: Arc<dyn FileSystem> = Arc::new(MemFS::default());
    let mut options = ArrayOptions::new([MAX / 2, MAX / 2], [5, 4]);
    options.max_dims = Some(vec![MAX, MAX]);
    options.fill.value = Some(vec![FILL]);
    options.btree_k = 2;
    if input.filtered {
        options.filters = vec![FilterDescription::lz4(), FilterDescription::checksum()];
    }
    let mut cache_options = CacheOptions::new();
    cache_options.cache_size = 20 * (input.cache_chunks % 8) as usize;
    cache_options.cache_slots = 5;
    let mut array = ChunkedArray::create_with(
        fs.clone(),
        "/fuzz",
        options,
        cache_options.clone(),
        &FilterRegistry::default(),
        Arc::new(SingleProcess),
    )
    .unwrap();
    let mut model = Model {
        extent: [MAX / 2, MAX / 2],
        grid: vec![FILL; (MAX * MAX) as usize],
    };

    for op in input.ops {
        trace!("{op:?}");
        match op {
            Op::Write { x, y, w, h, byte } => {
                let Some((start, count)) = clamp(model.extent, x, y, w, h) else {
                    continue;
                };
                let data = vec![byte; (count[0] * count[1]) as usize];
                array.write_box(&start, &count, &data).unwrap();
                for r in start[0]..start[0] + count[0] {
                    for c in start[1]..start[1] + count[1] {
                        let i = model.idx(r, c);
                        model.grid[i] = byte;
                    }
                }
            }
            Op::Read { x, y, w, h } => {
                let Some((start, count)) = clamp(model.extent, x, y, w, h) else {
                    continue;
                };
                let data = array.read_box(&start, &count).unwrap();
                let mut expected = Vec::with_capacity(data.len());
                for r in start[0]..start[0] + count[0] {
                    for c in start[1]..start[1] + count[1] {
                        expected.push(model.grid[model.idx(r, c)]);
                    }
                }
                assert_eq!(data, expected);
            }
            Op::SetExtent(a, b) => {
                let extent = [a as u64 % (MAX + 1), b as u64 % (MAX + 1)];
                array.set_extent(&extent).unwrap();
                // elements cut off read back as fill when the extent grows again
                for r in 0..MAX {
                    for c in 0..MAX {
                        if r >= extent[0] || c >= extent[1] {
                            let i = model.idx(r, c);
                            model.grid[i] = FILL;
                        }
                    }
                }
                model.extent = extent;
            }
            Op::Flush => array.flush().unwrap(),
            Op::Reopen => {
                array.close().unwrap();
                array = open(&fs, &cache_options);
                assert_eq!(array.extent(), &model.extent);
            }
        }
    }
    array.validate().unwrap();
    array.delete().unwrap();
    assert!(!fs.exists(std::path::Path::new("/fuzz")));
});
