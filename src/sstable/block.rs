//! Block construction and iteration.
//!
//! A block is a sequence of entries followed by an array of restart offsets
//! and the restart count:
//!
//! ```text
//! +-----------------------------------------------+
//! | entry 0 | entry 1 | ... | entry N-1           |
//! +-----------------------------------------------+
//! | restart[0] | ... | restart[R-1] | R : fixed32 |
//! +-----------------------------------------------+
//! ```
//!
//! Each entry stores how many leading bytes it shares with its predecessor:
//!
//! ```text
//! +-------------+---------------+-------------+------------------+-------+
//! | shared: var | unshared: var | val_len:var | key[unshared]    | value |
//! +-------------+---------------+-------------+------------------+-------+
//! ```
//!
//! At every restart point `shared == 0`, so the key there is materialized in
//! full and a seek can binary-search the restart array before scanning at
//! most one restart interval linearly.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::iterator::StorageIterator;

/// Builds the serialized form of a single block.
///
/// Keys must be added in strictly increasing order. A builder is reusable:
/// `reset` returns it to its initial state after `finish`.
pub struct BlockBuilder {
    block_restart_interval: usize,
    comparator: Arc<dyn Comparator>,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(block_restart_interval: usize, comparator: Arc<dyn Comparator>) -> Self {
        assert!(block_restart_interval >= 1);
        BlockBuilder {
            block_restart_interval,
            comparator,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Appends an entry.
    ///
    /// # Panics
    ///
    /// Panics if called after `finish` or if `key` is not strictly greater
    /// than every previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished);
        assert!(self.counter <= self.block_restart_interval);
        assert!(
            self.buffer.is_empty() || self.comparator.compare(key, &self.last_key) == Ordering::Greater,
            "keys must be added in strictly increasing order"
        );

        let shared = if self.counter < self.block_restart_interval {
            // Length of the prefix shared with the previous key.
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            // Restart compression from here.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the completed payload.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Size of the payload `finish` would currently produce.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The most recently added key.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

/// A parsed, immutable block.
pub struct Block {
    data: Vec<u8>,
    // Offset of the restart array within `data`.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Takes ownership of a block payload and validates its restart array.
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return corruption!("bad block contents: {} bytes", data.len());
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        let max_restarts_allowed = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts_allowed {
            // The size is too small to hold the restart array it declares.
            return corruption!("bad block contents: restart count {num_restarts}");
        }
        let restart_offset = data.len() - 4 * (num_restarts as usize + 1);
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// Bytes of payload, used as the cache charge.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIter {
        let (current, restart_index) = (self.restart_offset, self.num_restarts as usize);
        BlockIter {
            block: self,
            comparator,
            current,
            restart_index,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            err: None,
        }
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts as usize);
        decode_fixed32(&self.data[self.restart_offset + 4 * index..]) as usize
    }
}

/// Decodes the entry header at `offset`. Returns
/// `(shared, non_shared, value_len, key_offset)` or `None` on malformed
/// varints or lengths overrunning the payload.
fn decode_entry(
    data: &[u8],
    limit: usize,
    offset: usize,
) -> Option<(usize, usize, usize, usize)> {
    if offset >= limit {
        return None;
    }
    let mut input = &data[offset..limit];
    let shared = get_varint32(&mut input)? as usize;
    let non_shared = get_varint32(&mut input)? as usize;
    let value_len = get_varint32(&mut input)? as usize;
    let key_offset = limit - input.len();
    if non_shared + value_len > limit - key_offset {
        return None;
    }
    Some((shared, non_shared, value_len, key_offset))
}

/// Iterator over the entries of one block.
///
/// Keys are synthesized into an owned buffer as prefixes are reapplied;
/// values alias the block's storage.
pub struct BlockIter {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
    // Offset of the current entry in the payload; restart_offset means the
    // iterator is invalid.
    current: usize,
    // Index of the restart region containing `current`.
    restart_index: usize,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    err: Option<Error>,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn seek_to_restart_point(&mut self, restart_index: usize) {
        self.key.clear();
        self.restart_index = restart_index;
        // Leave a zero-length "value" at the restart offset so the next
        // parse starts there.
        self.value_offset = self.block.restart_point(restart_index);
        self.value_len = 0;
        self.current = self.value_offset;
    }

    // Invalid without error: the end of the entry area.
    fn mark_exhausted(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts as usize;
        self.key.clear();
        self.value_offset = 0;
        self.value_len = 0;
    }

    fn corruption(&mut self) {
        self.mark_exhausted();
        if self.err.is_none() {
            self.err = Some(Error::Corruption("bad entry in block".into()));
        }
    }

    /// Decodes the entry at `next_entry_offset`, leaving the iterator
    /// positioned on it. Returns false at the end of the entry area or on
    /// corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            // No more entries.
            self.mark_exhausted();
            return false;
        }

        match decode_entry(&self.block.data, self.block.restart_offset, self.current) {
            Some((shared, non_shared, value_len, key_offset)) if shared <= self.key.len() => {
                self.key.truncate(shared);
                self.key
                    .extend_from_slice(&self.block.data[key_offset..key_offset + non_shared]);
                self.value_offset = key_offset + non_shared;
                self.value_len = value_len;
                while self.restart_index + 1 < self.block.num_restarts as usize
                    && self.block.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            _ => {
                self.corruption();
                false
            }
        }
    }

    /// Reads the full key stored at a restart point, where `shared == 0`.
    fn key_at_restart(&self, restart_index: usize) -> Option<&[u8]> {
        let offset = self.block.restart_point(restart_index);
        let (shared, non_shared, _, key_offset) =
            decode_entry(&self.block.data, self.block.restart_offset, offset)?;
        if shared != 0 {
            return None;
        }
        Some(&self.block.data[key_offset..key_offset + non_shared])
    }
}

impl StorageIterator for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.mark_exhausted();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            self.mark_exhausted();
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts as usize - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
            // Keep scanning to the last entry.
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            self.mark_exhausted();
            return;
        }
        // Binary search over restart points for the last one with a key
        // < target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts as usize - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.key_at_restart(mid) {
                Some(mid_key) => {
                    if self.comparator.compare(mid_key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                None => {
                    self.corruption();
                    return;
                }
            }
        }

        // Linear scan inside the chosen restart region.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        assert!(self.valid());

        // Step back to the last restart point before the current entry,
        // then scan forward until just before it.
        let original = self.current;
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No entry precedes the first one.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts as usize;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {
            // Loop until the entry just before `original`.
        }
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.err {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn comparator() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn build_block(restart_interval: usize, entries: &[(&[u8], &[u8])]) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval, comparator());
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish().to_vec()).expect("built block must parse"))
    }

    fn collect_forward(iter: &mut BlockIter) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        iter.status().expect("iteration failed");
        out
    }

    const SAMPLE: &[(&[u8], &[u8])] = &[
        (b"a", b"1"),
        (b"aa", b"2"),
        (b"ab", b"3"),
        (b"abc", b"4"),
        (b"b", b"5"),
    ];

    #[test]
    fn test_empty_block_iterates_nothing() {
        let mut builder = BlockBuilder::new(16, comparator());
        let block = Arc::new(Block::new(builder.finish().to_vec()).expect("parse"));
        let mut iter = block.iter(comparator());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        iter.status().expect("empty block is not an error");
    }

    #[test]
    fn test_forward_iteration_roundtrip() {
        let block = build_block(3, SAMPLE);
        let mut iter = block.iter(comparator());
        let got = collect_forward(&mut iter);
        let want: Vec<(Vec<u8>, Vec<u8>)> = SAMPLE
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_seek_between_keys() {
        let block = build_block(3, SAMPLE);
        let mut iter = block.iter(comparator());

        iter.seek(b"aaz");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"ab");
        assert_eq!(iter.value(), b"3");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"aa");
        assert_eq!(iter.value(), b"2");

        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"b");
        assert_eq!(iter.value(), b"5");
    }

    #[test]
    fn test_seek_exact_and_past_end() {
        let block = build_block(2, SAMPLE);
        let mut iter = block.iter(comparator());

        iter.seek(b"abc");
        assert_eq!(iter.key(), b"abc");

        iter.seek(b"a");
        assert_eq!(iter.key(), b"a");

        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_walks_to_front() {
        let block = build_block(3, SAMPLE);
        let mut iter = block.iter(comparator());
        iter.seek_to_last();

        let mut reversed = Vec::new();
        while iter.valid() {
            reversed.push(iter.key().to_vec());
            iter.prev();
        }
        let mut forward: Vec<Vec<u8>> = SAMPLE.iter().map(|(k, _)| k.to_vec()).collect();
        forward.reverse();
        assert_eq!(reversed, forward);
    }

    #[test]
    fn test_every_restart_interval_yields_same_sequence() {
        // Restart placement is an encoding detail; the decoded sequence
        // must not depend on it.
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key{i:04}").into_bytes(),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();

        let mut reference = None;
        for interval in [1usize, 2, 3, 16, 100] {
            let block = build_block(interval, &borrowed);
            let mut iter = block.iter(comparator());
            let got = collect_forward(&mut iter);
            match &reference {
                None => reference = Some(got),
                Some(want) => assert_eq!(&got, want, "interval {interval}"),
            }
        }
    }

    #[test]
    fn test_restart_anchor_reconstructs_sequential_keys() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| (format!("prefix/{i:03}").into_bytes(), vec![i as u8]))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(4, &borrowed);

        // Seeking to each key must land exactly on it, whichever restart
        // region anchors the scan.
        let mut iter = block.iter(comparator());
        for (key, value) in &entries {
            iter.seek(key);
            assert!(iter.valid());
            assert_eq!(iter.key(), &key[..]);
            assert_eq!(iter.value(), &value[..]);
        }
    }

    #[test]
    fn test_current_size_estimate_tracks_finish() {
        let mut builder = BlockBuilder::new(16, comparator());
        for (key, value) in SAMPLE {
            builder.add(key, value);
        }
        let estimate = builder.current_size_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn test_out_of_order_add_panics() {
        let mut builder = BlockBuilder::new(16, comparator());
        builder.add(b"b", b"");
        builder.add(b"a", b"");
    }

    #[test]
    fn test_truncated_contents_rejected() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![0, 0, 0]).is_err());
        // Declares more restarts than the payload can hold.
        assert!(Block::new(vec![0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_corrupt_entry_sets_status() {
        let mut builder = BlockBuilder::new(16, comparator());
        builder.add(b"aaaa", b"v1");
        builder.add(b"aaab", b"v2");
        let mut data = builder.finish().to_vec();
        // Inflate the second entry's shared-prefix length beyond the
        // previous key's length.
        // Entry 0: shared=0 non_shared=4 val=2 "aaaa" "v1" -> 9 bytes.
        data[9] = 60;
        let block = Arc::new(Block::new(data).expect("restart array intact"));
        let mut iter = block.iter(comparator());
        iter.seek_to_first();
        assert!(iter.valid(), "first entry is untouched");
        iter.next();
        assert!(!iter.valid());
        assert!(iter.status().is_err(), "corruption must surface in status");
    }

    #[test]
    fn test_reset_reuses_builder() {
        let mut builder = BlockBuilder::new(16, comparator());
        builder.add(b"k", b"v");
        builder.finish();
        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"a", b"b");
        let block = Arc::new(Block::new(builder.finish().to_vec()).expect("parse"));
        let mut iter = block.iter(comparator());
        iter.seek_to_first();
        assert_eq!(iter.key(), b"a");
    }
}
