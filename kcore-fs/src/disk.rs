//! On-disk inode layout (§3, §6 "On-disk inode format").
//!
//! One inode occupies exactly one 512-byte sector: 125 little-endian u32
//! sector pointers, a type tag, a length, and a magic number. Indices
//! `0..DIRECT_COUNT` are direct data sectors, `DIRECT_COUNT` is a singly
//! indirect block, `DIRECT_COUNT + 1` is a doubly indirect block.
//!
//! Unlike the teacher's `ffs::disk_layout`, which casts a `#[repr(C, packed)]`
//! struct directly onto a raw disk buffer, this module packs and unpacks
//! through explicit little-endian byte slices. There's no hardware MMU or
//! alignment story to inherit here, and doing it this way sidesteps the
//! teacher's `unsafe` raw-pointer casts entirely.

use kcore::KernelError;

pub const POINTERS_PER_SECTOR: usize = 128;
pub const DIRECT_COUNT: usize = 123;
pub const TOTAL_POINTERS: usize = DIRECT_COUNT + 2;
pub const INODE_MAGIC: u32 = 0x494e_4f44;

pub const MAX_FILE_SIZE: u64 =
    (DIRECT_COUNT as u64 + POINTERS_PER_SECTOR as u64 + (POINTERS_PER_SECTOR * POINTERS_PER_SECTOR) as u64)
        * kcore::SECTOR_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InodeType {
    File = 0,
    Directory = 1,
}

impl InodeType {
    fn from_u32(v: u32) -> Result<Self, KernelError> {
        match v {
            0 => Ok(InodeType::File),
            1 => Ok(InodeType::Directory),
            _ => Err(KernelError::FilesystemCorrupted("unknown inode type")),
        }
    }
}

/// The exact bytes stored at an inode's sector.
#[derive(Clone, Copy)]
pub struct RawInode {
    pub pointers: [u32; TOTAL_POINTERS],
    pub file_type: InodeType,
    pub length: u32,
}

impl RawInode {
    pub fn new(file_type: InodeType) -> Self {
        Self {
            pointers: [0; TOTAL_POINTERS],
            file_type,
            length: 0,
        }
    }

    pub fn indirect_index() -> usize {
        DIRECT_COUNT
    }

    pub fn double_indirect_index() -> usize {
        DIRECT_COUNT + 1
    }

    pub fn to_bytes(&self) -> [u8; 512] {
        let mut out = [0u8; 512];
        for (i, p) in self.pointers.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
        }
        let base = TOTAL_POINTERS * 4;
        out[base..base + 4].copy_from_slice(&(self.file_type as u32).to_le_bytes());
        out[base + 4..base + 8].copy_from_slice(&self.length.to_le_bytes());
        out[base + 8..base + 12].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; 512]) -> Result<Self, KernelError> {
        let base = TOTAL_POINTERS * 4;
        let magic = u32::from_le_bytes(buf[base + 8..base + 12].try_into().unwrap());
        if magic != INODE_MAGIC {
            return Err(KernelError::FilesystemCorrupted("bad inode magic"));
        }
        let mut pointers = [0u32; TOTAL_POINTERS];
        for (i, p) in pointers.iter_mut().enumerate() {
            *p = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let file_type = InodeType::from_u32(u32::from_le_bytes(
            buf[base..base + 4].try_into().unwrap(),
        ))?;
        let length = u32::from_le_bytes(buf[base + 4..base + 8].try_into().unwrap());
        Ok(Self {
            pointers,
            file_type,
            length,
        })
    }
}

/// One step in the path from an inode's pointer array down to a data sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPath {
    /// Direct pointer at `pointers[i]`.
    Direct(usize),
    /// Indirect block `pointers[DIRECT_COUNT]`, offset `i` within it.
    Indirect(usize),
    /// Double-indirect block `pointers[DIRECT_COUNT+1]`, outer index `outer`,
    /// inner offset `inner`.
    DoubleIndirect(usize, usize),
}

/// Computes the index path for logical data-sector index `i` (§4.2 "Sparse
/// indirect addressing").
pub fn index_path(i: usize) -> Option<IndexPath> {
    if i < DIRECT_COUNT {
        return Some(IndexPath::Direct(i));
    }
    let i = i - DIRECT_COUNT;
    if i < POINTERS_PER_SECTOR {
        return Some(IndexPath::Indirect(i));
    }
    let i = i - POINTERS_PER_SECTOR;
    let max = POINTERS_PER_SECTOR * POINTERS_PER_SECTOR;
    if i < max {
        return Some(IndexPath::DoubleIndirect(
            i / POINTERS_PER_SECTOR,
            i % POINTERS_PER_SECTOR,
        ));
    }
    None
}

/// Unpacks a 512-byte indirect block into its 128 little-endian u32 pointers.
pub fn read_pointer_block(buf: &[u8; 512]) -> [u32; POINTERS_PER_SECTOR] {
    let mut out = [0u32; POINTERS_PER_SECTOR];
    for (i, p) in out.iter_mut().enumerate() {
        *p = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    }
    out
}

pub fn write_pointer(buf: &mut [u8; 512], idx: usize, value: u32) {
    buf[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
}
