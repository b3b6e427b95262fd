//! Free-sector allocation for the data and indirect sectors an inode grows
//! into. The spec treats this as "the free map" without pinning down its own
//! on-disk representation (that's PintOS's `free-map.c`, out of this core's
//! scope per §1's non-goals); here it's an in-memory [`kcore::Bitmap`] sized
//! to the device, with sector 0 reserved (used as the root directory's inode
//! sector, mirroring the convention the spec's inode layer assumes).

use kcore::{BlockDevice, Bitmap, KernelError, Result, Sector};

pub struct FreeMap {
    bits: Bitmap,
}

impl FreeMap {
    /// Builds a free map for `device`, with `reserved` sectors (typically the
    /// inodes already `inode_create`d before the map was built) pre-marked in
    /// use.
    pub fn new<D: BlockDevice>(device: &D, reserved: impl IntoIterator<Item = Sector>) -> Self {
        let bits = Bitmap::new(device.len_sectors() as usize);
        for s in reserved {
            bits.set(s.0 as usize, true);
        }
        Self { bits }
    }

    pub fn alloc(&self) -> Result<Sector> {
        self.bits
            .find_and_set()
            .map(|idx| Sector(idx as u32))
            .ok_or(KernelError::NoSpace)
    }

    pub fn release(&self, sector: Sector) {
        self.bits.set(sector.0 as usize, false);
    }
}
