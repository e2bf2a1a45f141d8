//! The sorted table (SST): an immutable on-disk file of sorted key/value
//! entries with an index and an optional filter.
//!
//! ## File layout
//!
//! ```text
//! +----------------------+
//! | Data Block 1         |
//! +----------------------+
//! | Data Block 2         |
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | Data Block N         |
//! +----------------------+
//! | Filter Block         |  (optional)
//! +----------------------+
//! | Meta-index Block     |
//! +----------------------+
//! | Index Block          |
//! +----------------------+
//! | Footer (48 bytes)    |
//! +----------------------+
//! ```
//!
//! Every block is followed on disk by a 5-byte trailer: a compression-type
//! byte and a masked CRC-32C of the payload plus that byte. The footer holds
//! handles to the meta-index and index blocks and ends in a fixed magic
//! number, so a table is opened by reading its last 48 bytes.
//!
//! Within a data block, keys are prefix-compressed against their predecessor
//! and the prefix counter resets at periodic restart points; the restart
//! array at the block tail allows binary search. The index block maps
//! shortened separator keys to data-block handles; point lookups consult the
//! filter block, when present, before touching a data block.

pub mod block;
pub mod builder;
pub mod filter_block;
pub mod format;
pub mod table;

pub use block::{Block, BlockBuilder, BlockIter};
pub use builder::TableBuilder;
pub use table::Table;
