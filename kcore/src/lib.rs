//! Core addressing types, synchronization vocabulary, error taxonomy, and
//! external-collaborator traits shared by the block cache, inode, and VM
//! crates.
//!
//! This crate plays the role the teacher's `keos` base crate plays for its
//! per-project crates: it carries nothing project-specific, only the
//! plumbing every other crate in the workspace depends on.

pub mod addressing;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod sync;
pub mod traits;

pub use addressing::{Pa, Sector, Va, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
pub use bitmap::Bitmap;
pub use config::{CacheConfig, VmConfig};
pub use error::{KernelError, Result};
pub use traits::{BlockDevice, FileSource, PageTable, PhysicalAllocator};
