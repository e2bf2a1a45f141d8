//! Storage core of an embedded, ordered key/value engine.
//!
//! This crate provides the durable half of a log-structured merge-tree: the
//! immutable sorted table (SST) format with its builder, reader, and caches,
//! and the write-ahead log that makes updates durable before they reach any
//! in-memory structure.
//!
//! # Data flow
//!
//! ```text
//!           write path                        read path
//!
//!  WriteBatch ──► wal::Writer            TableCache ──► Table
//!       │            │                        │           │ index block
//!       ▼            ▼                        ▼           ▼
//!  (memtable,    log file             ShardedCache ◄── data blocks
//!   external)        │                 (block cache)      │
//!       │            ▼                                    ▼
//!       ▼        wal::Reader (recovery)              BlockIter
//!  TableBuilder ──► .ldb file
//! ```
//!
//! Sorted streams flushed from an external memtable are assembled by
//! [`TableBuilder`] into self-describing files: prefix-compressed data
//! blocks, an optional filter block, a meta-index, an index, and a footer,
//! every block individually checksummed. [`Table`] opens such a file and
//! serves point lookups and ordered scans through a two-level iterator,
//! with decoded blocks shared process-wide through the sharded LRU cache.
//!
//! All keys and values are arbitrary byte strings; ordering is defined by a
//! pluggable [`Comparator`](comparator::Comparator).

#[macro_use]
pub mod error;

pub mod arena;
pub mod batch;
pub mod cache;
pub mod coding;
pub mod comparator;
pub mod crc32c;
pub mod env;
pub mod filter;
pub mod hash;
pub mod ikey;
pub mod iterator;
pub mod options;
pub mod sstable;
pub mod table_cache;
pub mod wal;

pub use batch::WriteBatch;
pub use cache::ShardedCache;
pub use comparator::{BytewiseComparator, Comparator};
pub use error::{Error, Result};
pub use filter::BloomFilterPolicy;
pub use iterator::StorageIterator;
pub use options::{CompressionType, Options, ReadOptions};
pub use sstable::{Table, TableBuilder};
pub use table_cache::TableCache;
