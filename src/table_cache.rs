//! Cache of open tables, keyed by file number.
//!
//! Opening a table costs a file handle, a footer read, and an index-block
//! parse, so open tables are kept in an LRU cache. The cached value owns
//! both the parsed table and its file; dropping it (on eviction, once no
//! reader pins it) closes both.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheHandle, ShardedCache};
use crate::coding::put_fixed64;
use crate::env::{Env, RandomAccessFile};
use crate::error::Result;
use crate::iterator::StorageIterator;
use crate::options::{Options, ReadOptions};
use crate::sstable::table::{Table, TableIterator};

fn table_file_name(dbname: &Path, file_number: u64) -> PathBuf {
    dbname.join(format!("{file_number:06}.ldb"))
}

// Tables written before the .ldb extension existed.
fn sst_table_file_name(dbname: &Path, file_number: u64) -> PathBuf {
    dbname.join(format!("{file_number:06}.sst"))
}

pub struct TableCache {
    env: Arc<dyn Env>,
    dbname: PathBuf,
    options: Options,
    cache: ShardedCache<Table>,
}

impl TableCache {
    /// Creates a cache holding at most `entries` open tables for the
    /// database at `dbname`.
    pub fn new(env: Arc<dyn Env>, dbname: impl Into<PathBuf>, options: Options, entries: usize) -> Self {
        TableCache {
            env,
            dbname: dbname.into(),
            options,
            cache: ShardedCache::new(entries),
        }
    }

    /// Returns a pinned handle to the open table for `file_number`,
    /// opening and caching it on a miss.
    fn find_table(&self, file_number: u64, file_size: u64) -> Result<CacheHandle<Table>> {
        let mut key = Vec::with_capacity(8);
        put_fixed64(&mut key, file_number);
        if let Some(handle) = self.cache.lookup(&key) {
            return Ok(handle);
        }

        let fname = table_file_name(&self.dbname, file_number);
        let file: Box<dyn RandomAccessFile> = match self.env.new_random_access_file(&fname) {
            Ok(file) => file,
            Err(open_err) => {
                let old_fname = sst_table_file_name(&self.dbname, file_number);
                match self.env.new_random_access_file(&old_fname) {
                    Ok(file) => file,
                    // Report the error for the current name.
                    Err(_) => return Err(open_err),
                }
            }
        };
        let table = Table::open(self.options.clone(), Arc::from(file), file_size)?;
        tracing::debug!(file_number, file_size, "opened table");

        // Open errors are not cached: a transient failure or a repaired
        // file recovers by itself on the next find.
        Ok(self.cache.insert(&key, table, 1))
    }

    /// Iterator over the table for `file_number`. The cache entry stays
    /// pinned until the iterator is dropped.
    pub fn new_iterator(
        &self,
        options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableCacheIterator> {
        let handle = self.find_table(file_number, file_size)?;
        let table = handle.value_arc();
        Ok(TableCacheIterator {
            inner: table.iter(options),
            _handle: handle,
        })
    }

    /// Point lookup in the table for `file_number`; see
    /// [`Table::internal_get`].
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        key: &[u8],
        found: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let handle = self.find_table(file_number, file_size)?;
        handle.value().internal_get(options, key, found)
    }

    /// Drops the cache entry for `file_number`, typically after the file is
    /// deleted by compaction.
    pub fn evict(&self, file_number: u64) {
        let mut key = Vec::with_capacity(8);
        put_fixed64(&mut key, file_number);
        self.cache.erase(&key);
        tracing::debug!(file_number, "evicted table");
    }
}

/// A table iterator that keeps its table's cache entry pinned.
pub struct TableCacheIterator {
    inner: TableIterator,
    _handle: CacheHandle<Table>,
}

impl std::fmt::Debug for TableCacheIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCacheIterator").finish_non_exhaustive()
    }
}

impl StorageIterator for TableCacheIterator {
    fn valid(&self) -> bool {
        self.inner.valid()
    }
    fn seek_to_first(&mut self) {
        self.inner.seek_to_first()
    }
    fn seek_to_last(&mut self) {
        self.inner.seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target)
    }
    fn next(&mut self) {
        self.inner.next()
    }
    fn prev(&mut self) {
        self.inner.prev()
    }
    fn key(&self) -> &[u8] {
        self.inner.key()
    }
    fn value(&self) -> &[u8] {
        self.inner.value()
    }
    fn status(&self) -> Result<()> {
        self.inner.status()
    }
}
