//! Filter policies for fast negative membership checks.
//!
//! A policy condenses a set of keys into a compact filter; readers probe the
//! filter before touching a data block. A negative answer is definitive, a
//! positive answer only probable.

use crate::hash::hash32;

/// A filter construction/probing scheme. Names are persisted in the table
/// meta-index, so changing a policy's behavior requires changing its name.
pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Appends a filter summarizing `keys` to `dst`. Keys may repeat.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Returns whether `key` may be in the set `filter` was built from.
    /// Must return `true` for every key passed to `create_filter`; should
    /// usually return `false` for keys that were not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

const BLOOM_HASH_SEED: u32 = 0xbc9f1d34;

fn bloom_hash(key: &[u8]) -> u32 {
    hash32(key, BLOOM_HASH_SEED)
}

/// A bloom filter with a configurable bits-per-key budget.
///
/// Rather than `k` independent hashes, probes are derived from a single hash
/// by repeated rotation (double hashing); the loss in false-positive rate is
/// negligible. Each filter stores its probe count in its final byte so old
/// filters keep working after the budget changes.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2) minimizes the false-positive rate.
        let k = (bits_per_key as f64 * 0.69) as usize;
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "emberdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Round up tiny filters: a very short array has a high false
        // positive rate no budget can fix.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        dst.push(self.k as u8);

        let array = &mut dst[init_size..init_size + bytes];
        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit_pos = (h % bits as u32) as usize;
                array[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }

        let array = &filter[..len - 1];
        let bits = array.len() * 8;

        let k = filter[len - 1];
        if k > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit_pos = (h % bits as u32) as usize;
            if array[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(policy: &BloomFilterPolicy, keys: &[&[u8]]) -> Vec<u8> {
        let mut filter = Vec::new();
        policy.create_filter(keys, &mut filter);
        filter
    }

    #[test]
    fn test_empty_filter() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, &[]);
        assert!(!policy.key_may_match(b"hello", &filter));
        assert!(!policy.key_may_match(b"world", &filter));
    }

    #[test]
    fn test_small() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, &[b"hello", b"world"]);
        assert!(policy.key_may_match(b"hello", &filter));
        assert!(policy.key_may_match(b"world", &filter));
        assert!(!policy.key_may_match(b"x", &filter));
        assert!(!policy.key_may_match(b"foo", &filter));
    }

    fn key_for(i: u32) -> [u8; 4] {
        i.to_le_bytes()
    }

    #[test]
    fn test_no_false_negatives_varying_lengths() {
        let policy = BloomFilterPolicy::new(10);
        let mut length = 1;
        while length <= 10_000 {
            let owned: Vec<[u8; 4]> = (0..length).map(key_for).collect();
            let keys: Vec<&[u8]> = owned.iter().map(|k| &k[..]).collect();
            let filter = build(&policy, &keys);

            // Filter size stays proportional to the key count.
            assert!(
                filter.len() <= (length as usize * 10 / 8) + 40,
                "filter oversized at length {length}"
            );
            for key in &keys {
                assert!(
                    policy.key_may_match(key, &filter),
                    "false negative at length {length}"
                );
            }
            length = if length < 10 { length + 1 } else { length * 5 };
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let policy = BloomFilterPolicy::new(10);
        let owned: Vec<[u8; 4]> = (0..10_000).map(key_for).collect();
        let keys: Vec<&[u8]> = owned.iter().map(|k| &k[..]).collect();
        let filter = build(&policy, &keys);

        let mut hits = 0;
        for i in 0..10_000u32 {
            if policy.key_may_match(&key_for(i + 1_000_000_000), &filter) {
                hits += 1;
            }
        }
        // 10 bits/key targets ~1%; allow generous slack.
        assert!(hits < 300, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn test_truncated_filter_matches_nothing() {
        let policy = BloomFilterPolicy::new(10);
        assert!(!policy.key_may_match(b"any", b""));
        assert!(!policy.key_may_match(b"any", b"\x01"));
    }
}
