//! Write-ahead log framing.
//!
//! A log file is a sequence of fixed 32 KiB blocks, each holding physical
//! records back to back:
//!
//! ```text
//! +---------------------------------------------------+
//! | Block 0 (32 KiB)                                  |
//! |  +----------+----------+----------+----+          |
//! |  | record   | record   | record   |pad |          |
//! |  +----------+----------+----------+----+          |
//! +---------------------------------------------------+
//! | Block 1 (32 KiB)                                  |
//! |  ...                                              |
//! +---------------------------------------------------+
//! ```
//!
//! Each physical record carries a 7-byte header:
//!
//! ```text
//! +------------------------+---------------+---------+------------+
//! | crc32c (masked): fixed32 | length: u16 | type:u8 | data[len]  |
//! +------------------------+---------------+---------+------------+
//! ```
//!
//! A user record that does not fit in the current block is fragmented:
//! `First` then zero or more `Middle`s then `Last`, with `Full` standing
//! alone. When fewer than 7 bytes remain in a block the writer zero-fills
//! them and begins a fresh block, so a reader can locate record boundaries
//! from any block-aligned position.

pub mod reader;
pub mod writer;

pub use reader::{Reader, Reporter};
pub use writer::Writer;

/// Fixed physical block size.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// crc (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

/// Physical record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated (zero-filled) file regions.
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, PosixEnv};
    use tempfile::tempdir;

    fn roundtrip(records: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wal");
        let env = PosixEnv::new();

        let mut writer = Writer::new(env.new_writable_file(&path).expect("create log"));
        for record in records {
            writer.add_record(record).expect("add_record");
        }
        writer.sync().expect("sync");
        drop(writer);

        let mut reader = Reader::new(
            env.new_sequential_file(&path).expect("open log"),
            None,
            true,
            0,
        );
        let mut out = Vec::new();
        while let Some(record) = reader.read_record() {
            out.push(record.to_vec());
        }
        out
    }

    #[test]
    fn test_empty_log() {
        assert!(roundtrip(&[]).is_empty());
    }

    #[test]
    fn test_small_records() {
        let records = vec![b"foo".to_vec(), b"bar".to_vec(), b"".to_vec(), b"xxxx".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_records_spanning_blocks() {
        // One record of 3 blocks minus 5 bytes, then two short ones.
        let records = vec![
            vec![b'a'; 3 * BLOCK_SIZE - 5],
            vec![b'b'; 10],
            vec![b'c'; 7],
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_write_batches_survive_replay() {
        use crate::batch::{BatchOp, WriteBatch};

        let mut b1 = WriteBatch::new();
        b1.put(b"k1", b"v1");
        b1.put(b"k2", b"v2");
        b1.set_sequence(10);
        let mut b2 = WriteBatch::new();
        b2.delete(b"k1");
        b2.set_sequence(12);

        let framed = roundtrip(&[b1.contents().to_vec(), b2.contents().to_vec()]);
        assert_eq!(framed.len(), 2);

        let mut recovered = WriteBatch::new();
        recovered.set_contents(&framed[1]).expect("set_contents");
        assert_eq!(recovered.sequence(), 12);
        let ops: Vec<_> = recovered
            .iterate()
            .expect("iterate")
            .collect::<crate::error::Result<_>>()
            .expect("well-formed batch");
        assert_eq!(ops, vec![BatchOp::Delete { key: b"k1" }]);
    }

    #[test]
    fn test_many_sizes() {
        let records: Vec<Vec<u8>> = (0..60u32)
            .map(|i| {
                let len = (i as usize * 1021) % (2 * BLOCK_SIZE);
                let mut data = Vec::with_capacity(len);
                for j in 0..len {
                    data.push((i as usize + j) as u8);
                }
                data
            })
            .collect();
        assert_eq!(roundtrip(&records), records);
    }
}
