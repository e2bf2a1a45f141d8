//! Log writer: frames user records into checksummed physical records.

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::coding::put_fixed32;
use crate::crc32c;
use crate::env::WritableFile;
use crate::error::Result;

pub struct Writer {
    dest: Box<dyn WritableFile>,
    // Offset within the current block, in 0..BLOCK_SIZE.
    block_offset: usize,
}

impl Writer {
    /// Starts a log at the beginning of an empty file.
    pub fn new(dest: Box<dyn WritableFile>) -> Self {
        Writer {
            dest,
            block_offset: 0,
        }
    }

    /// Continues a log in a file that already holds `dest_length` bytes of
    /// records written by an earlier incarnation.
    pub fn with_dest_length(dest: Box<dyn WritableFile>, dest_length: u64) -> Self {
        Writer {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one user record, fragmenting it across blocks as needed.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too little room for even an empty record; zero-fill and
                // move to a fresh block.
                if leftover > 0 {
                    const ZEROES: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];
                    self.dest.append(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(available);
            let end = fragment_length == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };
            self.emit_physical_record(record_type, &left[..fragment_length])?;

            left = &left[fragment_length..];
            begin = false;
            if left.is_empty() {
                // Zero-length records still emit one Full fragment.
                return Ok(());
            }
        }
    }

    /// Pushes buffered frames to stable media.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let type_byte = record_type as u8;
        let mut header = Vec::with_capacity(HEADER_SIZE);
        let crc = crc32c::value2(&[type_byte], data);
        put_fixed32(&mut header, crc32c::mask(crc));
        header.push((data.len() & 0xff) as u8);
        header.push((data.len() >> 8) as u8);
        header.push(type_byte);

        self.dest.append(&header)?;
        self.dest.append(data)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }
}
