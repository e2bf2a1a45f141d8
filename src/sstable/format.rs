//! On-disk framing shared by the table builder and reader: block handles,
//! the file footer, and checksummed block reads.

use crate::coding::{decode_fixed32, decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::crc32c;
use crate::env::RandomAccessFile;
use crate::error::Result;
use crate::options::{CompressionType, ReadOptions};

/// Maximum serialized length of a [`BlockHandle`]: two varint64s.
pub const MAX_ENCODED_HANDLE_LENGTH: usize = 10 + 10;

/// Serialized footer length. The two handles are zero-padded to their
/// maximum length so the footer can always be found at `file_size - 48`.
pub const FOOTER_ENCODED_LENGTH: usize = 2 * MAX_ENCODED_HANDLE_LENGTH + 8;

/// Every block payload is followed by a type byte and a masked CRC-32C.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// The footer's terminating magic number.
pub const TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;

/// Points at a block within a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    /// Decodes a handle from the front of `input`, advancing it.
    pub fn decode_from(input: &mut &[u8]) -> Result<BlockHandle> {
        match (get_varint64(input), get_varint64(input)) {
            (Some(offset), Some(size)) => Ok(BlockHandle { offset, size }),
            _ => corruption!("bad block handle"),
        }
    }
}

/// The fixed-size table footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let original_size = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(original_size + 2 * MAX_ENCODED_HANDLE_LENGTH, 0);
        put_fixed64(dst, TABLE_MAGIC_NUMBER);
        debug_assert_eq!(dst.len(), original_size + FOOTER_ENCODED_LENGTH);
    }

    pub fn decode_from(input: &[u8]) -> Result<Footer> {
        if input.len() < FOOTER_ENCODED_LENGTH {
            return corruption!("truncated table footer");
        }
        let magic = decode_fixed64(&input[FOOTER_ENCODED_LENGTH - 8..]);
        if magic != TABLE_MAGIC_NUMBER {
            return corruption!("not an sstable (bad magic number)");
        }
        let mut handles = &input[..2 * MAX_ENCODED_HANDLE_LENGTH];
        let metaindex_handle = BlockHandle::decode_from(&mut handles)?;
        let index_handle = BlockHandle::decode_from(&mut handles)?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

/// A block payload read off disk, decompressed and stripped of its trailer.
pub struct BlockContents {
    pub data: Vec<u8>,
    /// Whether the block may be inserted into the block cache.
    pub cachable: bool,
}

/// Reads the block at `handle`, verifies its trailer, and undoes its
/// compression.
pub fn read_block(
    file: &dyn RandomAccessFile,
    options: &ReadOptions,
    handle: &BlockHandle,
) -> Result<BlockContents> {
    let n = handle.size as usize;
    let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
    let read = file.read(handle.offset, &mut buf)?;
    if read < buf.len() {
        return corruption!("truncated block read");
    }

    if options.verify_checksums {
        let expected = crc32c::unmask(decode_fixed32(&buf[n + 1..]));
        let actual = crc32c::value(&buf[..n + 1]);
        if actual != expected {
            return corruption!("block checksum mismatch");
        }
    }

    match CompressionType::from_u8(buf[n]) {
        Some(CompressionType::None) => {
            buf.truncate(n);
            Ok(BlockContents {
                data: buf,
                cachable: true,
            })
        }
        Some(CompressionType::Snappy) => {
            let mut decoder = snap::raw::Decoder::new();
            let data = decoder
                .decompress_vec(&buf[..n])
                .map_err(|_| crate::error::Error::Corruption("corrupted compressed block contents".into()))?;
            Ok(BlockContents {
                data,
                cachable: true,
            })
        }
        None => corruption!("bad block type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::put_fixed32;
    use crate::env::{Env, PosixEnv};

    #[test]
    fn test_block_handle_roundtrip() {
        for (offset, size) in [(0u64, 0u64), (1, 2), (u64::MAX, u64::MAX >> 1)] {
            let handle = BlockHandle::new(offset, size);
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            assert!(encoded.len() <= MAX_ENCODED_HANDLE_LENGTH);
            let mut input = encoded.as_slice();
            assert_eq!(BlockHandle::decode_from(&mut input).expect("decode"), handle);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn test_block_handle_truncated() {
        let handle = BlockHandle::new(1 << 40, 77);
        let mut encoded = Vec::new();
        handle.encode_to(&mut encoded);
        let mut input = &encoded[..2];
        assert!(BlockHandle::decode_from(&mut input).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(123, 456),
            index_handle: BlockHandle::new(789, 1011),
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        assert_eq!(encoded.len(), FOOTER_ENCODED_LENGTH);
        assert_eq!(Footer::decode_from(&encoded).expect("decode"), footer);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(1, 2),
            index_handle: BlockHandle::new(3, 4),
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Footer::decode_from(&encoded).is_err());
    }

    fn write_framed_block(payload: &[u8], type_byte: u8) -> Vec<u8> {
        let mut file = payload.to_vec();
        file.push(type_byte);
        let crc = crc32c::value2(payload, &[type_byte]);
        put_fixed32(&mut file, crc32c::mask(crc));
        file
    }

    #[test]
    fn test_read_block_verifies_crc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("block");
        let env = PosixEnv::new();

        let payload = b"some block payload".to_vec();
        let framed = write_framed_block(&payload, CompressionType::None as u8);
        let mut writable = env.new_writable_file(&path).expect("create");
        writable.append(&framed).expect("append");
        writable.close().expect("close");
        drop(writable);

        let file = env.new_random_access_file(&path).expect("open");
        let options = ReadOptions::default().verify_checksums(true);
        let handle = BlockHandle::new(0, payload.len() as u64);
        let contents = read_block(file.as_ref(), &options, &handle).expect("read");
        assert_eq!(contents.data, payload);
        assert!(contents.cachable);
    }

    #[test]
    fn test_read_block_detects_flip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("block");
        let env = PosixEnv::new();

        let payload = b"some block payload".to_vec();
        let mut framed = write_framed_block(&payload, CompressionType::None as u8);
        framed[3] ^= 0x01;
        let mut writable = env.new_writable_file(&path).expect("create");
        writable.append(&framed).expect("append");
        writable.close().expect("close");
        drop(writable);

        let file = env.new_random_access_file(&path).expect("open");
        let handle = BlockHandle::new(0, payload.len() as u64);

        let verifying = ReadOptions::default().verify_checksums(true);
        assert!(read_block(file.as_ref(), &verifying, &handle).is_err());

        // With verification off the flip goes unnoticed here.
        let lenient = ReadOptions::default();
        assert!(read_block(file.as_ref(), &lenient, &handle).is_ok());
    }

    #[test]
    fn test_read_block_snappy_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("block");
        let env = PosixEnv::new();

        let payload: Vec<u8> = b"compressible ".repeat(100);
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&payload)
            .expect("compress");
        let framed = write_framed_block(&compressed, CompressionType::Snappy as u8);
        let mut writable = env.new_writable_file(&path).expect("create");
        writable.append(&framed).expect("append");
        writable.close().expect("close");
        drop(writable);

        let file = env.new_random_access_file(&path).expect("open");
        let options = ReadOptions::default().verify_checksums(true);
        let handle = BlockHandle::new(0, compressed.len() as u64);
        let contents = read_block(file.as_ref(), &options, &handle).expect("read");
        assert_eq!(contents.data, payload);
    }

    #[test]
    fn test_read_block_bad_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("block");
        let env = PosixEnv::new();

        let framed = write_framed_block(b"payload", 9);
        let mut writable = env.new_writable_file(&path).expect("create");
        writable.append(&framed).expect("append");
        writable.close().expect("close");
        drop(writable);

        let file = env.new_random_access_file(&path).expect("open");
        let handle = BlockHandle::new(0, 7);
        assert!(read_block(file.as_ref(), &ReadOptions::default(), &handle).is_err());
    }
}
