//! Assembles a sorted key/value stream into a table file.

use std::cmp::Ordering;

use crate::coding::put_fixed32;
use crate::crc32c;
use crate::env::WritableFile;
use crate::error::{Error, Result};
use crate::options::{CompressionType, Options};
use crate::sstable::block::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::format::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};

/// Builder lifecycle. Only `Building` accepts writes; the first error is
/// sticky and replayed by every later call.
enum BuilderState {
    Building,
    Errored(Error),
    Finished,
    Abandoned,
}

/// Builds one table file from entries added in strictly increasing key
/// order. Single-use: exactly one of `finish` or `abandon` must be called.
pub struct TableBuilder {
    options: Options,
    file: Box<dyn WritableFile>,
    state: BuilderState,
    // Current file length; every block handle is minted from it.
    offset: u64,
    num_entries: u64,
    data_block: BlockBuilder,
    // Restart interval 1: index entries are accessed by binary search only,
    // so prefix compression would just slow the restarts down.
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    filter_block: Option<FilterBlockBuilder>,
    // The index entry for a finished data block is withheld until the next
    // block's first key arrives, allowing a shortened separator key.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    compressed_output: Vec<u8>,
}

impl TableBuilder {
    pub fn new(options: Options, file: Box<dyn WritableFile>) -> Self {
        let data_block = BlockBuilder::new(options.block_restart_interval, options.comparator.clone());
        let index_block = BlockBuilder::new(1, options.comparator.clone());
        let mut filter_block = options
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        if let Some(filter) = filter_block.as_mut() {
            filter.start_block(0);
        }
        TableBuilder {
            options,
            file,
            state: BuilderState::Building,
            offset: 0,
            num_entries: 0,
            data_block,
            index_block,
            last_key: Vec::new(),
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            compressed_output: Vec::new(),
        }
    }

    /// Appends an entry.
    ///
    /// # Panics
    ///
    /// Panics after `finish`/`abandon`, and if `key` is not strictly greater
    /// than every previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_building()?;
        if self.num_entries > 0 {
            assert!(
                self.options.comparator.compare(key, &self.last_key) == Ordering::Greater,
                "keys must be added in strictly increasing order"
            );
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(filter) = self.filter_block.as_mut() {
            filter.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Forces the buffered data block out to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.check_building()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        match self.write_data_block() {
            Ok(handle) => {
                self.pending_handle = handle;
                self.pending_index_entry = true;
                if let Err(err) = self.file.flush() {
                    return Err(self.fail(err));
                }
            }
            Err(err) => return Err(self.fail(err)),
        }
        if let Some(filter) = self.filter_block.as_mut() {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes the trailing blocks and footer. After a successful return,
    /// `num_entries` and `file_size` are final.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        self.check_building()?;
        self.state = BuilderState::Finished;

        // Filter block, stored uncompressed: it is probed in place.
        let mut filter_block_handle = None;
        if let Some(mut filter) = self.filter_block.take() {
            let contents = filter.finish().to_vec();
            match emit_block(
                self.file.as_mut(),
                &mut self.offset,
                &contents,
                CompressionType::None,
                &mut self.compressed_output,
            ) {
                Ok(handle) => filter_block_handle = Some(handle),
                Err(err) => return Err(self.fail(err)),
            }
        }

        // Meta-index block: one entry mapping the filter's name to its
        // handle, when a filter exists.
        let mut meta_index_block = BlockBuilder::new(
            self.options.block_restart_interval,
            self.options.comparator.clone(),
        );
        if let (Some(handle), Some(policy)) = (filter_block_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            let mut handle_encoding = Vec::new();
            handle.encode_to(&mut handle_encoding);
            meta_index_block.add(key.as_bytes(), &handle_encoding);
        }
        let metaindex_handle = {
            let raw = meta_index_block.finish();
            match emit_block(
                self.file.as_mut(),
                &mut self.offset,
                raw,
                self.options.compression,
                &mut self.compressed_output,
            ) {
                Ok(handle) => handle,
                Err(err) => return Err(self.fail(err)),
            }
        };

        // Index block. The final data block has no successor to shorten its
        // separator against, so use a short successor of its last key.
        if self.pending_index_entry {
            self.options
                .comparator
                .find_short_successor(&mut self.last_key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }
        let index_handle = {
            let raw = self.index_block.finish();
            match emit_block(
                self.file.as_mut(),
                &mut self.offset,
                raw,
                self.options.compression,
                &mut self.compressed_output,
            ) {
                Ok(handle) => handle,
                Err(err) => return Err(self.fail(err)),
            }
        };

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut footer_encoding = Vec::new();
        footer.encode_to(&mut footer_encoding);
        if let Err(err) = self.file.append(&footer_encoding) {
            return Err(self.fail(err));
        }
        self.offset += footer_encoding.len() as u64;
        Ok(())
    }

    /// Marks the builder closed without writing the footer. The file
    /// contents written so far are left as-is.
    pub fn abandon(&mut self) {
        match self.state {
            BuilderState::Building | BuilderState::Errored(_) => {
                self.state = BuilderState::Abandoned;
            }
            _ => panic!("abandon called on a closed builder"),
        }
    }

    /// The first error this builder hit, if any.
    pub fn status(&self) -> Result<()> {
        match &self.state {
            BuilderState::Errored(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Current file length; final once `finish` has returned.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn check_building(&self) -> Result<()> {
        match &self.state {
            BuilderState::Building => Ok(()),
            BuilderState::Errored(err) => Err(err.clone()),
            BuilderState::Finished | BuilderState::Abandoned => {
                panic!("table builder used after finish/abandon")
            }
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = BuilderState::Errored(err.clone());
        err
    }

    fn write_data_block(&mut self) -> Result<BlockHandle> {
        let raw = self.data_block.finish();
        let handle = emit_block(
            self.file.as_mut(),
            &mut self.offset,
            raw,
            self.options.compression,
            &mut self.compressed_output,
        )?;
        self.data_block.reset();
        Ok(handle)
    }
}

/// Appends one block plus its trailer to `file`, choosing the stored form.
/// Compression is kept only when it saves at least 12.5%.
fn emit_block(
    file: &mut dyn WritableFile,
    offset: &mut u64,
    raw: &[u8],
    compression: CompressionType,
    compressed_scratch: &mut Vec<u8>,
) -> Result<BlockHandle> {
    let (contents, block_type): (&[u8], CompressionType) = match compression {
        CompressionType::None => (raw, CompressionType::None),
        CompressionType::Snappy => {
            compressed_scratch.clear();
            let mut encoder = snap::raw::Encoder::new();
            match encoder.compress_vec(raw) {
                Ok(compressed) if compressed.len() < raw.len() - raw.len() / 8 => {
                    *compressed_scratch = compressed;
                    (compressed_scratch.as_slice(), CompressionType::Snappy)
                }
                // Compression failed or saved too little: store raw.
                _ => (raw, CompressionType::None),
            }
        }
    };

    let handle = BlockHandle::new(*offset, contents.len() as u64);
    file.append(contents)?;

    let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
    trailer.push(block_type as u8);
    let crc = crc32c::value2(contents, &trailer[..1]);
    put_fixed32(&mut trailer, crc32c::mask(crc));
    file.append(&trailer)?;

    *offset += contents.len() as u64 + BLOCK_TRAILER_SIZE as u64;
    Ok(handle)
}
