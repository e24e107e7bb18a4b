use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};

use crate::firestore::remote::watch_change::BloomFilterPayload;

/// Rejected Bloom filter parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterError(String);

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BloomFilterError {}

/// Probabilistic set of document names sent with an existence filter.
///
/// Membership uses double hashing over the MD5 digest of the name: the two
/// little-endian 64-bit halves `h1` and `h2` give bit `i` as
/// `(h1 + i * h2) mod bit_count` in wrapping unsigned arithmetic.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if !(0..8).contains(&padding) {
            return Err(BloomFilterError(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(BloomFilterError(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count).all(|index| self.is_bit_set(bit_index(h1, h2, index, self.bit_count)))
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

/// Encodes `names` the way the backend does for an existence filter.
pub fn build_payload(names: &[String], bitmap_len: usize, hash_count: u32) -> BloomFilterPayload {
    let mut bitmap = vec![0u8; bitmap_len];
    let bit_count = bitmap_len as u64 * 8;
    if bit_count > 0 {
        for name in names {
            let (h1, h2) = hash_halves(name);
            for index in 0..hash_count {
                let bit = bit_index(h1, h2, index, bit_count);
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
    }
    BloomFilterPayload {
        bitmap,
        padding: 0,
        hash_count: hash_count as i32,
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}

fn bit_index(h1: u64, h2: u64, hash_index: u32, bit_count: u64) -> u64 {
    h1.wrapping_add(h2.wrapping_mul(u64::from(hash_index))) % bit_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(values: &[&str], bytes: usize, padding: i32, hash_count: i32) -> BloomFilter {
        let bit_count = (bytes * 8) as u64 - padding as u64;
        let mut bitmap = vec![0u8; bytes];
        for value in values {
            let (h1, h2) = hash_halves(value);
            for index in 0..hash_count as u32 {
                let bit = bit_index(h1, h2, index, bit_count);
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        BloomFilter::new(bitmap, padding, hash_count).unwrap()
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(vec![0], 0, -1).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain("projects/p/databases/d/documents/c/a"));
    }

    #[test]
    fn inserted_names_are_reported() {
        let names = [
            "projects/p/databases/(default)/documents/rooms/a",
            "projects/p/databases/(default)/documents/rooms/b",
        ];
        let filter = filter_with(&names, 16, 3, 7);
        assert_eq!(filter.bit_count(), 125);
        for name in names {
            assert!(filter.might_contain(name));
        }
    }

    #[test]
    fn built_payloads_contain_their_names() {
        let names: Vec<String> = (0..20).map(|i| format!("projects/p/databases/d/documents/c/{i}")).collect();
        let payload = build_payload(&names, 64, 5);
        let filter = BloomFilter::new(payload.bitmap, payload.padding, payload.hash_count).unwrap();
        assert!(names.iter().all(|name| filter.might_contain(name)));
    }

    #[test]
    fn hash_halves_are_little_endian() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let (h1, h2) = hash_halves("");
        assert_eq!(h1, 0x04b2_008f_d98c_1dd4);
        assert_eq!(h2, 0x7e42_f8ec_9809_80e9);
    }
}
