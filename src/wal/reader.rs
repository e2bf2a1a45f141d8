//! Log reader: reassembles user records and resynchronizes past damage.
//!
//! Corruption is never fatal. Damaged bytes are reported to an injectable
//! [`Reporter`] with an approximate count, the rest of the current block is
//! dropped, and reading resumes at the next block boundary. An end of file
//! in the middle of a fragmented record is silently ignored; it is what a
//! writer crash mid-record leaves behind.

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::coding::decode_fixed32;
use crate::crc32c;
use crate::env::SequentialFile;
use crate::error::Error;

/// Receives notice of bytes the reader had to drop.
pub trait Reporter {
    fn corruption(&mut self, bytes: usize, reason: &Error);
}

/// Reporter that records drops in the trace log.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn corruption(&mut self, bytes: usize, reason: &Error) {
        tracing::warn!(bytes, %reason, "dropping corrupt log region");
    }
}

// Internal codes returned alongside the real record types.
const EOF_SENTINEL: u8 = MAX_RECORD_TYPE + 1;
const BAD_RECORD: u8 = MAX_RECORD_TYPE + 2;

pub struct Reader {
    file: Box<dyn SequentialFile>,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,
    // The current block, refilled wholesale; buf_start marks the consumed
    // prefix.
    backing: Vec<u8>,
    buf_start: usize,
    eof: bool,
    // File offset of the start of the last record returned.
    last_record_offset: u64,
    // File offset one past the end of `backing`.
    end_of_buffer_offset: u64,
    initial_offset: u64,
    // Dropping fragment tails until the next record boundary, after an
    // initial offset landed mid-record.
    resyncing: bool,
    scratch: Vec<u8>,
}

impl Reader {
    /// Starts reading records at the first one whose physical position is at
    /// or past `initial_offset`. Checksums are verified when `checksum` is
    /// set; `reporter` (optional) hears about dropped bytes.
    pub fn new(
        file: Box<dyn SequentialFile>,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Reader {
            file,
            reporter,
            checksum,
            backing: Vec::with_capacity(BLOCK_SIZE),
            buf_start: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
            scratch: Vec::new(),
        }
    }

    /// File offset of the start of the last record returned by
    /// `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Returns the next user record, or `None` at end of file. The slice is
    /// valid until the next call.
    pub fn read_record(&mut self) -> Option<&[u8]> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        self.scratch.clear();
        let mut in_fragmented_record = false;
        // Where the logical record currently being assembled began.
        let mut prospective_record_offset = 0u64;

        loop {
            let (record_type, frag_start, frag_len) = self.read_physical_record();
            // Offset of the fragment just read; meaningful only for real
            // record types.
            let physical_record_offset = self
                .end_of_buffer_offset
                .wrapping_sub(self.buffer_len() as u64)
                .wrapping_sub(HEADER_SIZE as u64)
                .wrapping_sub(frag_len as u64);

            if self.resyncing {
                if record_type == RecordType::Middle as u8 {
                    continue;
                } else if record_type == RecordType::Last as u8 {
                    self.resyncing = false;
                    continue;
                } else {
                    self.resyncing = false;
                }
            }

            match record_type {
                t if t == RecordType::Full as u8 => {
                    if in_fragmented_record {
                        // An early-writer bug could leave an empty First at
                        // a block tail; only non-empty partials are errors.
                        if self.scratch.is_empty() {
                            in_fragmented_record = false;
                        } else {
                            let bytes = self.scratch.len() as u64;
                            self.report_corruption(bytes, "partial record without end(1)");
                        }
                    }
                    self.scratch.clear();
                    self.last_record_offset = physical_record_offset;
                    return Some(&self.backing[frag_start..frag_start + frag_len]);
                }
                t if t == RecordType::First as u8 => {
                    if in_fragmented_record {
                        if self.scratch.is_empty() {
                            in_fragmented_record = false;
                        } else {
                            let bytes = self.scratch.len() as u64;
                            self.report_corruption(bytes, "partial record without end(2)");
                        }
                    }
                    prospective_record_offset = physical_record_offset;
                    self.scratch.clear();
                    self.scratch
                        .extend_from_slice(&self.backing[frag_start..frag_start + frag_len]);
                    in_fragmented_record = true;
                }
                t if t == RecordType::Middle as u8 => {
                    if !in_fragmented_record {
                        self.report_corruption(
                            frag_len as u64,
                            "missing start of fragmented record(1)",
                        );
                    } else {
                        self.scratch
                            .extend_from_slice(&self.backing[frag_start..frag_start + frag_len]);
                    }
                }
                t if t == RecordType::Last as u8 => {
                    if !in_fragmented_record {
                        self.report_corruption(
                            frag_len as u64,
                            "missing start of fragmented record(2)",
                        );
                    } else {
                        self.scratch
                            .extend_from_slice(&self.backing[frag_start..frag_start + frag_len]);
                        self.last_record_offset = prospective_record_offset;
                        return Some(self.scratch.as_slice());
                    }
                }
                EOF_SENTINEL => {
                    if in_fragmented_record {
                        // The writer died after a First/Middle without
                        // completing the record: ignore the fragment.
                        self.scratch.clear();
                    }
                    return None;
                }
                BAD_RECORD => {
                    if in_fragmented_record {
                        let bytes = self.scratch.len() as u64;
                        self.report_corruption(bytes, "error in middle of record");
                        in_fragmented_record = false;
                        self.scratch.clear();
                    }
                }
                unknown => {
                    let bytes = frag_len as u64
                        + if in_fragmented_record {
                            self.scratch.len() as u64
                        } else {
                            0
                        };
                    self.report_corruption(bytes, &format!("unknown record type {unknown}"));
                    in_fragmented_record = false;
                    self.scratch.clear();
                }
            }
        }
    }

    fn buffer_len(&self) -> usize {
        self.backing.len() - self.buf_start
    }

    /// Positions the underlying file at the first block that can contain
    /// `initial_offset`. Returns false when even that skip fails.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start_location = self.initial_offset - offset_in_block;

        // An initial offset inside a block's zero-filled tail belongs to the
        // next block.
        if offset_in_block > BLOCK_SIZE as u64 - 6 {
            block_start_location += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start_location;

        if block_start_location > 0 {
            if let Err(err) = self.file.skip(block_start_location) {
                self.report_drop(block_start_location, err);
                return false;
            }
        }
        true
    }

    /// Reads the next physical record, refilling the block buffer as
    /// needed. Returns `(type, fragment_start, fragment_len)` with the
    /// fragment indices pointing into `backing`; EOF_SENTINEL and
    /// BAD_RECORD carry no fragment.
    fn read_physical_record(&mut self) -> (u8, usize, usize) {
        loop {
            if self.buffer_len() < HEADER_SIZE {
                if !self.eof {
                    // The last read was a full block, so the remainder is
                    // the zero-filled trailer; refill.
                    self.buf_start = 0;
                    self.backing.resize(BLOCK_SIZE, 0);
                    match self.file.read(&mut self.backing) {
                        Ok(n) => {
                            self.backing.truncate(n);
                            self.end_of_buffer_offset += n as u64;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(err) => {
                            self.backing.clear();
                            self.report_drop(BLOCK_SIZE as u64, err);
                            self.eof = true;
                            return (EOF_SENTINEL, 0, 0);
                        }
                    }
                    continue;
                } else {
                    // A leftover partial header is a mid-write crash, not
                    // corruption.
                    self.backing.clear();
                    self.buf_start = 0;
                    return (EOF_SENTINEL, 0, 0);
                }
            }

            let header_start = self.buf_start;
            let record_type = self.backing[header_start + 6];
            let length = self.backing[header_start + 4] as usize
                | (self.backing[header_start + 5] as usize) << 8;

            if HEADER_SIZE + length > self.buffer_len() {
                let drop_size = self.buffer_len() as u64;
                self.backing.clear();
                self.buf_start = 0;
                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return (BAD_RECORD, 0, 0);
                }
                // The writer died before finishing this record's payload.
                return (EOF_SENTINEL, 0, 0);
            }

            if record_type == RecordType::Zero as u8 && length == 0 {
                // Zero-filled region from file preallocation; skip the rest
                // of the block without reporting.
                self.backing.clear();
                self.buf_start = 0;
                return (BAD_RECORD, 0, 0);
            }

            if self.checksum {
                let expected_crc =
                    crc32c::unmask(decode_fixed32(&self.backing[header_start..]));
                let actual_crc =
                    crc32c::value(&self.backing[header_start + 6..header_start + 7 + length]);
                if actual_crc != expected_crc {
                    // The length field itself may be lying, so everything
                    // left in the block is suspect.
                    let drop_size = self.buffer_len() as u64;
                    self.backing.clear();
                    self.buf_start = 0;
                    self.report_corruption(drop_size, "checksum mismatch");
                    return (BAD_RECORD, 0, 0);
                }
            }

            let frag_start = header_start + HEADER_SIZE;
            self.buf_start += HEADER_SIZE + length;

            // Physical records that began before the initial offset are
            // skipped without reporting.
            if self
                .end_of_buffer_offset
                .wrapping_sub(self.buffer_len() as u64)
                .wrapping_sub(HEADER_SIZE as u64)
                .wrapping_sub(length as u64)
                < self.initial_offset
            {
                return (BAD_RECORD, 0, 0);
            }

            return (record_type, frag_start, length);
        }
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, Error::Corruption(reason.into()));
    }

    fn report_drop(&mut self, bytes: u64, reason: Error) {
        // Only drops at or past the initial offset concern the caller.
        let drop_start = self
            .end_of_buffer_offset
            .wrapping_sub(self.buffer_len() as u64)
            .wrapping_sub(bytes);
        if let Some(reporter) = self.reporter.as_mut() {
            if drop_start >= self.initial_offset {
                reporter.corruption(bytes as usize, &reason);
            }
        }
    }
}
