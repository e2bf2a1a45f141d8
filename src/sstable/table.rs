//! Opening and reading immutable tables.
//!
//! A table keeps its index block resident for its whole lifetime; data
//! blocks are fetched on demand, by way of the block cache when one is
//! configured. Iteration is two-level: an outer cursor walks index entries,
//! an inner cursor walks the data block the current index entry points at.

use std::sync::Arc;

use crate::coding::put_fixed64;
use crate::comparator::BytewiseComparator;
use crate::env::RandomAccessFile;
use crate::error::{Error, Result};
use crate::iterator::StorageIterator;
use crate::options::{Options, ReadOptions};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::format::{read_block, BlockHandle, Footer, FOOTER_ENCODED_LENGTH};

/// An open, immutable table. Freely shareable across reader threads.
pub struct Table {
    options: Options,
    file: Arc<dyn RandomAccessFile>,
    // Distinguishes this table's blocks in the shared block cache.
    cache_id: u64,
    filter: Option<FilterBlockReader>,
    index_block: Arc<Block>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").finish_non_exhaustive()
    }
}

impl Table {
    /// Opens the table stored in the first `size` bytes of `file`.
    pub fn open(options: Options, file: Arc<dyn RandomAccessFile>, size: u64) -> Result<Table> {
        if size < FOOTER_ENCODED_LENGTH as u64 {
            return corruption!("file is too short to be an sstable");
        }

        let mut footer_buf = vec![0u8; FOOTER_ENCODED_LENGTH];
        let read = file.read(size - FOOTER_ENCODED_LENGTH as u64, &mut footer_buf)?;
        if read < footer_buf.len() {
            return corruption!("truncated table footer");
        }
        let footer = Footer::decode_from(&footer_buf)?;

        let read_options = ReadOptions {
            verify_checksums: options.paranoid_checks,
            fill_cache: false,
        };
        let index_contents = read_block(file.as_ref(), &read_options, &footer.index_handle)?;
        let index_block = Arc::new(Block::new(index_contents.data)?);

        let cache_id = options
            .block_cache
            .as_ref()
            .map(|cache| cache.new_id())
            .unwrap_or(0);

        let mut table = Table {
            options,
            file,
            cache_id,
            filter: None,
            index_block,
        };
        table.read_meta(&footer);
        Ok(table)
    }

    // A missing or unreadable filter only costs lookup speed, so metadata
    // problems are swallowed here unless the caller asked to be paranoid;
    // open has already succeeded by the time this runs.
    fn read_meta(&mut self, footer: &Footer) {
        let Some(policy) = self.options.filter_policy.clone() else {
            return;
        };
        let read_options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
        };
        let Ok(contents) = read_block(self.file.as_ref(), &read_options, &footer.metaindex_handle)
        else {
            tracing::debug!("meta-index block unreadable, continuing without filter");
            return;
        };
        let Ok(meta) = Block::new(contents.data) else {
            tracing::debug!("meta-index block unparsable, continuing without filter");
            return;
        };

        // Meta-index keys are plain strings, ordered bytewise.
        let meta = Arc::new(meta);
        let mut iter = meta.iter(Arc::new(BytewiseComparator));
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if iter.valid() && iter.key() == key.as_bytes() {
            let mut input = iter.value();
            let Ok(handle) = BlockHandle::decode_from(&mut input) else {
                return;
            };
            let Ok(filter_contents) = read_block(self.file.as_ref(), &read_options, &handle)
            else {
                return;
            };
            self.filter = Some(FilterBlockReader::new(policy, filter_contents.data));
        }
    }

    /// Resolves an index-block value (an encoded handle) into an iterator
    /// over the referenced data block, consulting the block cache.
    fn block_reader(&self, options: &ReadOptions, index_value: &[u8]) -> Result<BlockIter> {
        let mut input = index_value;
        let handle = BlockHandle::decode_from(&mut input)?;

        let block: Arc<Block> = match &self.options.block_cache {
            Some(cache) => {
                let mut cache_key = Vec::with_capacity(16);
                put_fixed64(&mut cache_key, self.cache_id);
                put_fixed64(&mut cache_key, handle.offset);
                match cache.lookup(&cache_key) {
                    Some(cached) => cached.value_arc(),
                    None => {
                        let contents = read_block(self.file.as_ref(), options, &handle)?;
                        let cachable = contents.cachable;
                        let block = Block::new(contents.data)?;
                        if cachable && options.fill_cache {
                            let charge = block.size();
                            cache.insert(&cache_key, block, charge).value_arc()
                        } else {
                            Arc::new(block)
                        }
                    }
                }
            }
            None => {
                let contents = read_block(self.file.as_ref(), options, &handle)?;
                Arc::new(Block::new(contents.data)?)
            }
        };
        Ok(block.iter(self.options.comparator.clone()))
    }

    /// Two-level iterator over every entry in the table.
    pub fn iter(self: Arc<Self>, options: ReadOptions) -> TableIterator {
        let index_iter = self
            .index_block
            .clone()
            .iter(self.options.comparator.clone());
        TableIterator {
            table: self,
            options,
            index_iter,
            data_iter: None,
            data_block_handle: Vec::new(),
            err: None,
        }
    }

    /// Point lookup. Seeks to `key` and, when positioned at an entry,
    /// passes it to `found`. The filter block may prove the key absent
    /// without touching a data block.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        key: &[u8],
        found: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let mut index_iter = self
            .index_block
            .clone()
            .iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            let index_value = index_iter.value().to_vec();
            let mut handle_input = index_value.as_slice();
            let rejected = match (&self.filter, BlockHandle::decode_from(&mut handle_input)) {
                (Some(filter), Ok(handle)) => !filter.key_may_match(handle.offset, key),
                _ => false,
            };
            if !rejected {
                let mut block_iter = self.block_reader(options, &index_value)?;
                block_iter.seek(key);
                if block_iter.valid() {
                    found(block_iter.key(), block_iter.value());
                }
                block_iter.status()?;
            }
        }
        index_iter.status()
    }

    #[cfg(test)]
    fn index_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = self
            .index_block
            .clone()
            .iter(self.options.comparator.clone());
        let mut entries = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            entries.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        entries
    }
}

/// Iterator over a whole table: an index cursor plus the data-block cursor
/// for its current position. `data_iter` is `None` whenever the index
/// cursor is invalid.
pub struct TableIterator {
    table: Arc<Table>,
    options: ReadOptions,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    // The handle bytes `data_iter` was built from, to skip rebuilding when
    // the index cursor lands on the same block.
    data_block_handle: Vec<u8>,
    err: Option<Error>,
}

impl TableIterator {
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_block_handle == handle {
            // Already positioned in this block.
            return;
        }
        let handle = handle.to_vec();
        match self.table.block_reader(&self.options, &handle) {
            Ok(iter) => {
                self.data_block_handle = handle;
                self.data_iter = Some(iter);
            }
            Err(err) => {
                if self.err.is_none() {
                    self.err = Some(err);
                }
                self.data_iter = None;
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_to_last();
            }
        }
    }
}

impl StorageIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |it| it.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        // The index key for a block is >= every key inside it, so the first
        // index entry at or past the target names the candidate block.
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.data_iter.as_mut().expect("valid implies data iter").next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        self.data_iter.as_mut().expect("valid implies data iter").prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid implies data iter").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid implies data iter").value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }
        match &self.err {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }
}
