//! Fixed-size bucket array with two candidate buckets per name.
//!
//! A record lives in one of the two buckets picked by [`primary_hash`] and
//! [`secondary_hash`]. Insert prefers an empty candidate, otherwise the
//! shorter chain (ties go to the primary). Chains are kept sorted by name.

use super::record::FileRecord;

const PRIMARY_BASE: u64 = 31;
const PRIMARY_MODULUS: u64 = 1_000_000_007;
const SECONDARY_BASE: u64 = 37;
const SECONDARY_MODULUS: u64 = 1_000_000_009;

fn polynomial_hash(name: &str, base: u64, modulus: u64) -> u64 {
    let mut hash = 0u64;
    let mut power = 1u64;
    for byte in name.bytes() {
        hash = (hash + (u64::from(byte) + 1) * power) % modulus;
        power = (power * base) % modulus;
    }
    hash
}

pub(crate) fn primary_hash(name: &str, buckets: usize) -> usize {
    (polynomial_hash(name, PRIMARY_BASE, PRIMARY_MODULUS) % buckets as u64) as usize
}

pub(crate) fn secondary_hash(name: &str, buckets: usize) -> usize {
    (polynomial_hash(name, SECONDARY_BASE, SECONDARY_MODULUS) % buckets as u64) as usize
}

pub(crate) struct BucketTable {
    buckets: Vec<Vec<FileRecord>>,
    len: usize,
}

impl BucketTable {
    pub(crate) fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn candidates(&self, name: &str) -> (usize, usize) {
        let n = self.buckets.len();
        (primary_hash(name, n), secondary_hash(name, n))
    }

    /// (bucket, position) of `name`, probing the primary chain then the secondary
    fn locate(&self, name: &str) -> Option<(usize, usize)> {
        let (first, second) = self.candidates(name);
        [first, second].into_iter().find_map(|bucket| {
            self.buckets[bucket]
                .binary_search_by(|r| r.name().cmp(name))
                .ok()
                .map(|pos| (bucket, pos))
        })
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&FileRecord> {
        self.locate(name)
            .map(|(bucket, pos)| &self.buckets[bucket][pos])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut FileRecord> {
        self.locate(name)
            .map(|(bucket, pos)| &mut self.buckets[bucket][pos])
    }

    /// Insert a record whose name is not yet present
    pub(crate) fn insert(&mut self, record: FileRecord) {
        debug_assert!(!self.contains(record.name()));
        let (first, second) = self.candidates(record.name());
        let bucket = if self.buckets[first].is_empty() {
            first
        } else if self.buckets[second].is_empty() {
            second
        } else if self.buckets[second].len() < self.buckets[first].len() {
            second
        } else {
            first
        };

        let chain = &mut self.buckets[bucket];
        let pos = chain
            .binary_search_by(|r| r.name().cmp(record.name()))
            .unwrap_or_else(|pos| pos);
        chain.insert(pos, record);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<FileRecord> {
        let (bucket, pos) = self.locate(name)?;
        self.len -= 1;
        Some(self.buckets[bucket].remove(pos))
    }

    /// Records in traversal order: bucket index, then chain order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.buckets.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileRecord> {
        self.buckets.iter_mut().flatten()
    }

    #[cfg(test)]
    fn bucket_of(&self, name: &str) -> Option<usize> {
        self.locate(name).map(|(bucket, _)| bucket)
    }
}
