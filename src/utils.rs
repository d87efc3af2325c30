use std::fmt;

use smallvec::SmallVec;

/// N-dimensional coordinates or sizes, one element per array dimension.
pub type Coords = SmallVec<u64, 4>;

/// Returns true if `origin` lies at or beyond `extent` in any dimension,
/// i.e. the chunk starting at `origin` holds no in-bounds element.
#[inline]
pub fn outside_extent(origin: &[u64], extent: &[u64]) -> bool {
    debug_assert_eq!(origin.len(), extent.len());
    origin.iter().zip(extent).any(|(o, e)| o >= e)
}

/// Returns true if the boxes `[a, a + size)` and `[b, b + size)` don't overlap.
#[inline]
pub fn disjoint(a: &[u64], b: &[u64], size: &[u64]) -> bool {
    a.iter()
        .zip(b)
        .zip(size)
        .any(|((a, b), s)| a.saturating_add(*s) <= *b || b.saturating_add(*s) <= *a)
}

/// Number of chunks needed to cover `extent` in each dimension.
pub fn chunks_per_dim(extent: &[u64], chunk_dims: &[u64]) -> Coords {
    extent
        .iter()
        .zip(chunk_dims)
        .map(|(e, c)| e.div_ceil(*c))
        .collect()
}

/// Linearizes the chunk at `origin` (element coordinates, chunk aligned) in row-major
/// order over a grid of `nchunks` chunks per dimension. Dimensions where the origin
/// exceeds the grid still produce a distinct (although non dense) index.
pub fn linear_chunk_index(origin: &[u64], chunk_dims: &[u64], nchunks: &[u64]) -> u64 {
    let mut idx = 0u64;
    for ((o, c), n) in origin.iter().zip(chunk_dims).zip(nchunks) {
        idx = idx.wrapping_mul((*n).max(1)).wrapping_add(o / c);
    }
    idx
}

/// Advances `counter` to the next chunk origin covering `extent`, fastest varying
/// dimension last. Returns false once every origin has been visited.
pub fn next_chunk_origin(counter: &mut [u64], chunk_dims: &[u64], extent: &[u64]) -> bool {
    for i in (0..counter.len()).rev() {
        counter[i] += chunk_dims[i];
        if counter[i] >= extent[i] {
            counter[i] = 0;
        } else {
            return true;
        }
    }
    false
}

#[derive(Display)]
#[display("{:?}", self)]
/// Outputs bytes sizes as human sizes
pub struct ByteSize(pub u64);

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KB: u64 = 1024;
        const MB: u64 = 1024 * 1024;
        const GB: u64 = 1024 * 1024 * 1024;
        let (value, suffix) = match self.0 {
            v @ 0..KB => (v as f64, "B"),
            v @ KB..MB => (v as f64 / KB as f64, "KB"),
            v @ MB..GB => (v as f64 / MB as f64, "MB"),
            v @ GB.. => (v as f64 / GB as f64, "GB"),
        };
        write!(f, "{value:.3}{suffix}")
    }
}

/// Seeded rng for randomized tests, `SEED` overrides the random seed.
#[cfg(test)]
pub fn test_rng() -> rand::rngs::SmallRng {
    use rand::SeedableRng;
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| rand::random(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {}", seed);
    rand::rngs::SmallRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_walk() {
        let mut counter = [0u64, 0];
        let mut visited = vec![counter];
        while next_chunk_origin(&mut counter, &[20, 20], &[90, 50]) {
            visited.push(counter);
        }
        assert_eq!(visited.len(), 5 * 3);
        assert_eq!(visited[1], [0, 20]);
        assert_eq!(visited[3], [20, 0]);
        assert_eq!(visited.last(), Some(&[80, 40]));
    }

    #[test]
    fn test_extent_checks() {
        assert!(!outside_extent(&[60, 60], &[70, 70]));
        assert!(outside_extent(&[60, 80], &[70, 70]));
        assert!(outside_extent(&[70, 0], &[70, 70]));
        assert!(disjoint(&[0, 0], &[0, 20], &[20, 20]));
        assert!(!disjoint(&[0, 0], &[10, 10], &[20, 20]));
    }

    #[test]
    fn test_linear_index() {
        let nchunks = chunks_per_dim(&[90, 90], &[20, 20]);
        assert_eq!(nchunks.as_slice(), &[5, 5]);
        assert_eq!(linear_chunk_index(&[0, 0], &[20, 20], &nchunks), 0);
        assert_eq!(linear_chunk_index(&[0, 40], &[20, 20], &nchunks), 2);
        assert_eq!(linear_chunk_index(&[40, 20], &[20, 20], &nchunks), 11);
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(ByteSize(512).to_string(), "512.000B");
        assert_eq!(ByteSize(1536).to_string(), "1.500KB");
    }
}
