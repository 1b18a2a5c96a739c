//! Maglev lookup table construction. Every backend walks its own
//! permutation of the buckets and claims the first free one on its turn,
//! a backend with weight `w` takes `w` turns per round.

use std::collections::BTreeMap;
use svclb_dp::hash::jhash2;

const OFFSET_SEED: u32 = 0x4d41_474c;
const SKIP_SEED: u32 = 0x5345_4544;

/// A backend as seen by the table builder. `hash_key` must be stable for
/// the backend across rebuilds, ids may change.
#[derive(Clone, Debug)]
pub struct MaglevBackend {
    pub id: u32,
    pub weight: u16,
    pub hash_key: Vec<u8>,
}

impl MaglevBackend {
    pub fn new(id: u32, weight: u16, hash_key: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            weight,
            hash_key: hash_key.into(),
        }
    }
}

fn to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            u32::from_be_bytes(w)
        })
        .collect()
}

struct Permutation {
    offset: u64,
    skip: u64,
    next: u64,
}

impl Permutation {
    fn new(key: &[u8], size: u32) -> Self {
        let words = to_words(key);
        let size = size as u64;
        Self {
            offset: jhash2(&words, OFFSET_SEED) as u64 % size,
            skip: jhash2(&words, SKIP_SEED) as u64 % (size - 1) + 1,
            next: 0,
        }
    }

    fn bucket(&mut self, size: u64) -> usize {
        let b = (self.offset + self.next * self.skip) % size;
        self.next += 1;
        b as usize
    }
}

/// Builds a table of `size` buckets holding backend ids. The size must be
/// prime for every permutation to visit all buckets. Returns an empty
/// table if there are no backends with a non zero weight.
pub fn build_table(backends: &[MaglevBackend], size: u32) -> Vec<u32> {
    let backends = backends
        .iter()
        .filter(|b| b.weight > 0)
        .collect::<Vec<_>>();
    if backends.is_empty() || size < 2 {
        return vec![];
    }

    let mut perms = backends
        .iter()
        .map(|b| Permutation::new(&b.hash_key, size))
        .collect::<Vec<_>>();
    let mut table = vec![0u32; size as usize];
    let mut taken = vec![false; size as usize];
    let mut filled = 0usize;

    'fill: loop {
        for (i, be) in backends.iter().enumerate() {
            for _ in 0..be.weight {
                let perm = &mut perms[i];
                let mut b = perm.bucket(size as u64);
                while taken[b] {
                    b = perm.bucket(size as u64);
                }
                taken[b] = true;
                table[b] = be.id;
                filled += 1;
                if filled == size as usize {
                    break 'fill;
                }
            }
        }
    }

    table
}

/// Number of buckets owned by each backend id.
pub fn distribution(table: &[u32]) -> BTreeMap<u32, usize> {
    let mut dist = BTreeMap::new();
    for id in table {
        *dist.entry(*id).or_insert(0) += 1;
    }
    dist
}
