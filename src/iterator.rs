//! The seekable iterator capability set shared by block, table, and merged
//! iterators.

use crate::error::Result;

/// A cursor over a sorted sequence of key/value entries.
///
/// An iterator starts out invalid; one of the seek operations must run before
/// `key`/`value` may be called. `key` and `value` borrow from the iterator
/// and are invalidated by the next repositioning call.
pub trait StorageIterator {
    /// Whether the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// Positions at the first entry, if any.
    fn seek_to_first(&mut self);

    /// Positions at the last entry, if any.
    fn seek_to_last(&mut self);

    /// Positions at the first entry whose key is `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Advances to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Moves to the previous entry; invalid after the first entry.
    /// Requires `valid()`.
    fn prev(&mut self);

    /// The key at the current entry. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// The value at the current entry. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// The first error the iterator encountered, if any.
    fn status(&self) -> Result<()>;
}
