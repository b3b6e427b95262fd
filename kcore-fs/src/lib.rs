//! Multilevel on-disk inode layer: sparse direct/indirect/doubly-indirect
//! addressing, an open-inode registry that deduplicates by sector, and
//! deny-write coordination (§4.2).
//!
//! Sits directly on top of [`kcore_cache::BufferCache`]; every sector this
//! crate touches — inode headers, indirect blocks, data sectors — goes
//! through the cache rather than the block device directly.

pub mod disk;
pub mod freemap;
pub mod inode;

pub use disk::{InodeType, MAX_FILE_SIZE};
pub use freemap::FreeMap;
pub use inode::{Filesystem, Inode};
