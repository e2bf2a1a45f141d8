//! Engine options.

use std::sync::Arc;

use crate::cache::ShardedCache;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;
use crate::sstable::block::Block;

/// On-disk block compression codecs. The discriminant is the type byte in
/// each block trailer and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(byte: u8) -> Option<CompressionType> {
        match byte {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Options controlling table construction and access.
#[derive(Clone)]
pub struct Options {
    /// Comparator defining the key order. Must be consistent across every
    /// writer and reader of the same table.
    pub comparator: Arc<dyn Comparator>,

    /// Treat recoverable metadata problems as hard errors (default: false).
    pub paranoid_checks: bool,

    /// Approximate uncompressed size of each data block (default: 4KB).
    pub block_size: usize,

    /// Entries between restart points inside a block (default: 16).
    pub block_restart_interval: usize,

    /// Block compression (default: Snappy).
    pub compression: CompressionType,

    /// Cache of decoded data blocks shared across tables (default: none).
    pub block_cache: Option<Arc<ShardedCache<Block>>>,

    /// Filter policy for negative-lookup short-circuiting (default: none).
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            paranoid_checks: false,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: CompressionType::Snappy,
            block_cache: None,
            filter_policy: None,
        }
    }
}

impl Options {
    /// Set the comparator
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Enable paranoid checks
    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    /// Set the data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the restart interval for data blocks
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Set the block compression codec
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Share a block cache
    pub fn block_cache(mut self, cache: Arc<ShardedCache<Block>>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    /// Set a filter policy
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }
}

/// Options controlling reads.
#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Verify block checksums on every read (default: false).
    pub verify_checksums: bool,

    /// Insert blocks read for this operation into the block cache
    /// (default: true).
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}

impl ReadOptions {
    /// Verify checksums on reads
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Control block cache population
    pub fn fill_cache(mut self, enabled: bool) -> Self {
        self.fill_cache = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(!options.paranoid_checks);
        assert_eq!(options.block_size, 4096);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.compression, CompressionType::Snappy);
        assert!(options.block_cache.is_none());
        assert!(options.filter_policy.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let options = Options::default()
            .block_size(1024)
            .block_restart_interval(4)
            .compression(CompressionType::None)
            .paranoid_checks(true);
        assert_eq!(options.block_size, 1024);
        assert_eq!(options.block_restart_interval, 4);
        assert_eq!(options.compression, CompressionType::None);
        assert!(options.paranoid_checks);
    }

    #[test]
    fn test_compression_type_from_u8() {
        assert_eq!(CompressionType::from_u8(0), Some(CompressionType::None));
        assert_eq!(CompressionType::from_u8(1), Some(CompressionType::Snappy));
        assert_eq!(CompressionType::from_u8(2), None);
    }
}
