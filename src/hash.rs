//! Content hashing and fixed-size block segmentation using BLAKE3

use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::hash::{BuildHasherDefault, Hash, Hasher};

/// Width of a content hash in bytes
pub const HASH_SIZE: usize = blake3::OUT_LEN;

/// A block's content identity: the BLAKE3 digest of its bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; HASH_SIZE]);

impl ContentHash {
    /// Hash a block of raw bytes
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Bucket key for table lookup.
    ///
    /// Digests are already uniformly distributed, so the first eight bytes
    /// are as good a key as any further mixing would produce.
    pub fn fingerprint(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(prefix)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Hash for ContentHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint());
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

/// Pass-through hasher that uses a [`ContentHash`] fingerprint as the bucket key.
///
/// Only `write_u64` carries a key; other writes fold bytes in so the hasher
/// stays correct if it is ever fed something else.
#[derive(Default, Clone, Copy)]
pub struct FingerprintHasher(u64);

impl Hasher for FingerprintHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(b);
        }
    }

    fn write_u64(&mut self, key: u64) {
        self.0 = key;
    }
}

pub type BuildFingerprintHasher = BuildHasherDefault<FingerprintHasher>;

/// Hash a single block
pub fn hash(block: &[u8]) -> ContentHash {
    ContentHash::of(block)
}

fn check_segmentation(buffer: &[u8], total_length: usize, block_size: usize) -> Result<()> {
    if block_size == 0 {
        return Err(Error::invalid_input("block size must be non-zero"));
    }
    if total_length % block_size != 0 {
        return Err(Error::invalid_input(format!(
            "length {} is not a multiple of the block size {}",
            total_length, block_size
        )));
    }
    if buffer.len() < total_length {
        return Err(Error::invalid_input(format!(
            "buffer holds {} bytes, expected at least {}",
            buffer.len(),
            total_length
        )));
    }
    Ok(())
}

/// Split the first `total_length` bytes of `buffer` into `block_size` chunks
/// and hash each one, in position order.
///
/// Fails with [`Error::InvalidInput`] when the length is not an exact multiple
/// of the block size; a partial tail block is never produced.
pub fn segment(buffer: &[u8], total_length: usize, block_size: usize) -> Result<Vec<ContentHash>> {
    check_segmentation(buffer, total_length, block_size)?;
    Ok(buffer[..total_length]
        .chunks_exact(block_size)
        .map(hash)
        .collect())
}

/// Same contract as [`segment`], with blocks hashed on the rayon pool.
pub fn segment_parallel(
    buffer: &[u8],
    total_length: usize,
    block_size: usize,
) -> Result<Vec<ContentHash>> {
    check_segmentation(buffer, total_length, block_size)?;
    // par_chunks_exact is indexed, so collect() keeps position order
    Ok(buffer[..total_length]
        .par_chunks_exact(block_size)
        .map(hash)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_hash_is_blake3() {
        let digest = hash(b"hello world");
        assert_eq!(
            digest.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_equal_bytes_equal_hash() {
        assert_eq!(hash(b"AAAA"), hash(b"AAAA"));
        assert_ne!(hash(b"AAAA"), hash(b"AAAB"));
    }

    #[test]
    fn test_segment_orders_blocks() -> Result<()> {
        let hashes = segment(b"AAAABBBBAAAA", 12, 4)?;
        assert_eq!(hashes, vec![hash(b"AAAA"), hash(b"BBBB"), hash(b"AAAA")]);
        Ok(())
    }

    #[test]
    fn test_segment_rejects_partial_tail() {
        let result = segment(b"AAAABB", 6, 4);
        assert!(matches!(result, Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_segment_rejects_zero_block_size() {
        assert!(matches!(segment(b"", 0, 0), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_segment_rejects_short_buffer() {
        assert!(matches!(segment(b"AAAA", 8, 4), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_segment_empty() -> Result<()> {
        assert!(segment(b"", 0, 4)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_parallel_matches_sequential() -> Result<()> {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            segment(&data, data.len(), 512)?,
            segment_parallel(&data, data.len(), 512)?
        );
        Ok(())
    }

    #[test]
    fn test_fingerprint_reads_prefix() {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0] = 0x01;
        bytes[7] = 0x80;
        let digest = ContentHash(bytes);
        assert_eq!(digest.fingerprint(), 0x8000_0000_0000_0001);

        let mut hasher = FingerprintHasher::default();
        digest.hash(&mut hasher);
        assert_eq!(hasher.finish(), digest.fingerprint());
    }

    #[test]
    fn test_fingerprint_map_lookup() {
        let mut map: HashMap<ContentHash, u32, BuildFingerprintHasher> = HashMap::default();
        map.insert(hash(b"one"), 1);
        map.insert(hash(b"two"), 2);
        assert_eq!(map.get(&hash(b"one")), Some(&1));
        assert_eq!(map.get(&hash(b"two")), Some(&2));
        assert_eq!(map.get(&hash(b"three")), None);
    }
}
