//! Filter blocks: one filter per 2 KiB window of data-block output, indexed
//! by data-block offset.
//!
//! ```text
//! +--------------------------------------------+
//! | filter 0 | filter 1 | ... | filter M-1     |
//! +--------------------------------------------+
//! | offset[0] | ... | offset[M-1]   (fixed32)  |
//! +--------------------------------------------+
//! | offset array start : fixed32 | base_lg: u8 |
//! +--------------------------------------------+
//! ```
//!
//! A reader maps a data block starting at offset `o` to filter
//! `o >> base_lg`; with the 2 KiB base, a block starting anywhere inside a
//! window is covered by that window's filter.

use std::sync::Arc;

use crate::coding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;

/// log2 of the data-offset window each filter covers.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates keys and emits the filter block for one table.
///
/// Calls must follow the table build sequence:
/// `(start_block add_key*)* finish`.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    // Key bytes, flattened, with per-key start offsets.
    keys: Vec<u8>,
    start: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Rotates filters so the one under construction covers the data block
    /// beginning at `block_offset`.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            // No keys since the last rotation: an empty filter slot.
            return;
        }

        self.start.push(self.keys.len()); // simplifies length computation
        let keys: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();
        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

/// Probes a serialized filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    // Offset of the offset array; num entries; window size.
    offset_start: usize,
    num: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Wraps `contents`; a malformed block degrades to matching everything.
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Vec<u8>) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: Vec::new(),
            offset_start: 0,
            num: 0,
            base_lg: 0,
        };
        let n = contents.len();
        if n < 5 {
            // 1 byte base_lg + 4 bytes array offset are mandatory.
            return reader;
        }
        let base_lg = contents[n - 1];
        let last_word = decode_fixed32(&contents[n - 5..]) as usize;
        if last_word > n - 5 {
            return reader;
        }
        reader.base_lg = base_lg;
        reader.offset_start = last_word;
        reader.num = (n - 5 - last_word) / 4;
        reader.data = contents;
        reader
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num {
            // Out of range on this reader: err on the side of a match.
            return true;
        }

        let start = decode_fixed32(&self.data[self.offset_start + index * 4..]) as usize;
        let limit = decode_fixed32(&self.data[self.offset_start + index * 4 + 4..]) as usize;
        if start == limit {
            // Empty filters hold no keys.
            return false;
        }
        if start < limit && limit <= self.offset_start {
            let filter = &self.data[start..limit];
            return self.policy.key_may_match(key, filter);
        }
        true
    }
}
