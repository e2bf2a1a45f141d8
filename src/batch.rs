//! Atomic multi-operation write batches.
//!
//! A batch holds its wire representation directly; appending it to the log
//! and replaying it from the log use the same bytes:
//!
//! ```text
//! +-------------------+---------------+------------------+
//! | sequence: fixed64 | count: fixed32| records[count]   |
//! +-------------------+---------------+------------------+
//! ```
//!
//! Each record is a one-byte value-type tag followed by length-prefixed
//! strings: a put carries key and value, a deletion only the key.

use crate::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_fixed32, put_fixed64,
    put_length_prefixed_slice,
};
use crate::error::{Error, Result};
use crate::ikey::{SequenceNumber, ValueType};

/// Byte count of the sequence number plus the record count.
pub const BATCH_HEADER_SIZE: usize = 12;

/// An ordered set of updates applied atomically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

/// A decoded batch record.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    /// Queues a key/value store.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Queues a key deletion.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Discards all queued updates.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Number of queued updates.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    pub fn set_count(&mut self, count: u32) {
        let mut buf = Vec::with_capacity(4);
        put_fixed32(&mut buf, count);
        self.rep[8..12].copy_from_slice(&buf);
    }

    /// Sequence number the write pipeline stamped onto this batch.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[..8])
    }

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        let mut buf = Vec::with_capacity(8);
        put_fixed64(&mut buf, sequence);
        self.rep[..8].copy_from_slice(&buf);
    }

    /// The wire representation, ready to frame into the log.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Replaces this batch with a representation recovered from the log.
    pub fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < BATCH_HEADER_SIZE {
            return corruption!("malformed WriteBatch (too small)");
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        Ok(())
    }

    /// Size in bytes of the wire representation.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Appends the updates of `other` after this batch's updates.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Decodes the queued updates in order. The count stamped into the
    /// header is validated against the records actually present.
    pub fn iterate(&self) -> Result<BatchIter> {
        if self.rep.len() < BATCH_HEADER_SIZE {
            return corruption!("malformed WriteBatch (too small)");
        }
        Ok(BatchIter {
            input: &self.rep[BATCH_HEADER_SIZE..],
            expected: self.count(),
            found: 0,
            done: false,
        })
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a batch's records; checks structural integrity as it goes.
pub struct BatchIter<'a> {
    input: &'a [u8],
    expected: u32,
    found: u32,
    done: bool,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.input.is_empty() {
            self.done = true;
            if self.found != self.expected {
                return Some(corruption!("WriteBatch has wrong count"));
            }
            return None;
        }

        self.found += 1;
        let tag = self.input[0];
        self.input = &self.input[1..];
        match ValueType::from_u8(tag) {
            Some(ValueType::Value) => {
                let key = get_length_prefixed_slice(&mut self.input);
                let value = get_length_prefixed_slice(&mut self.input);
                match (key, value) {
                    (Some(key), Some(value)) => Some(Ok(BatchOp::Put { key, value })),
                    _ => {
                        self.done = true;
                        Some(corruption!("bad WriteBatch Put"))
                    }
                }
            }
            Some(ValueType::Deletion) => match get_length_prefixed_slice(&mut self.input) {
                Some(key) => Some(Ok(BatchOp::Delete { key })),
                None => {
                    self.done = true;
                    Some(corruption!("bad WriteBatch Delete"))
                }
            },
            None => {
                self.done = true;
                Some(Err(Error::Corruption("unknown WriteBatch tag".into())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(batch: &WriteBatch) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        batch
            .iterate()
            .expect("iterate failed")
            .map(|op| match op.expect("bad record") {
                BatchOp::Put { key, value } => (key.to_vec(), Some(value.to_vec())),
                BatchOp::Delete { key } => (key.to_vec(), None),
            })
            .collect()
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.sequence(), 0);
        assert!(ops(&batch).is_empty());
    }

    #[test]
    fn test_multiple_ops() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        batch.delete(b"box");
        batch.put(b"baz", b"boo");
        batch.set_sequence(100);

        assert_eq!(batch.count(), 3);
        assert_eq!(batch.sequence(), 100);
        assert_eq!(
            ops(&batch),
            vec![
                (b"foo".to_vec(), Some(b"bar".to_vec())),
                (b"box".to_vec(), None),
                (b"baz".to_vec(), Some(b"boo".to_vec())),
            ]
        );
    }

    #[test]
    fn test_roundtrip_through_contents() {
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.delete(b"k2");
        batch.set_sequence(7);

        let mut restored = WriteBatch::new();
        restored
            .set_contents(batch.contents())
            .expect("set_contents failed");
        assert_eq!(restored, batch);
        assert_eq!(restored.sequence(), 7);
        assert_eq!(ops(&restored), ops(&batch));
    }

    #[test]
    fn test_append() {
        let mut b1 = WriteBatch::new();
        let mut b2 = WriteBatch::new();
        b1.put(b"a", b"va");
        b2.put(b"b", b"vb");
        b2.delete(b"a");

        b1.append(&b2);
        assert_eq!(b1.count(), 3);
        assert_eq!(
            ops(&b1),
            vec![
                (b"a".to_vec(), Some(b"va".to_vec())),
                (b"b".to_vec(), Some(b"vb".to_vec())),
                (b"a".to_vec(), None),
            ]
        );
    }

    #[test]
    fn test_clear() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"b");
        batch.clear();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.approximate_size(), BATCH_HEADER_SIZE);
    }

    #[test]
    fn test_wrong_count_detected() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"b");
        batch.set_count(2);
        let err = batch
            .iterate()
            .expect("header is well-formed")
            .last()
            .expect("must yield at least the count error");
        assert_eq!(err, Err(Error::Corruption("WriteBatch has wrong count".into())));
    }

    #[test]
    fn test_truncated_record_detected() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut bytes = batch.contents().to_vec();
        bytes.truncate(bytes.len() - 2);

        let mut truncated = WriteBatch::new();
        truncated.set_contents(&bytes).expect("header intact");
        let results: Vec<_> = truncated.iterate().expect("header intact").collect();
        assert!(matches!(
            results.last(),
            Some(Err(Error::Corruption(msg))) if msg == "bad WriteBatch Put"
        ));
    }

    #[test]
    fn test_unknown_tag_detected() {
        let mut bytes = vec![0; BATCH_HEADER_SIZE];
        bytes[8] = 1; // count = 1
        bytes.push(0x7f); // no such tag
        let mut batch = WriteBatch::new();
        batch.set_contents(&bytes).expect("header intact");
        let results: Vec<_> = batch.iterate().expect("header intact").collect();
        assert_eq!(
            results,
            vec![Err(Error::Corruption("unknown WriteBatch tag".into()))]
        );
    }

    #[test]
    fn test_set_contents_too_small() {
        let mut batch = WriteBatch::new();
        assert!(batch.set_contents(b"tiny").is_err());
    }
}
