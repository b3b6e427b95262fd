//! The swap device: a contiguous sector range partitioned into 8-sector
//! slots, one per anonymous/evicted page, tracked by a bitmap (§4.4, §6
//! "Swap layout").

use kcore::{fatal, BlockDevice, Sector, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use kcore::Bitmap;

pub struct SwapDevice<D: BlockDevice> {
    device: D,
    bitmap: Bitmap,
}

impl<D: BlockDevice> SwapDevice<D> {
    pub fn new(device: D) -> Self {
        let slots = device.len_sectors() as usize / SECTORS_PER_PAGE;
        Self {
            device,
            bitmap: Bitmap::new(slots),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.len()
    }

    /// Number of slots currently occupied — used to check §8 invariant 7
    /// (swap bitmap population equals the count of non-resident SWAP SPT
    /// entries).
    pub fn used_slots(&self) -> usize {
        self.bitmap.count_set()
    }

    /// Writes one page (`PAGE_SIZE` bytes) to a freshly allocated slot.
    /// Panics if the device is full — the spec declares swap exhaustion
    /// fatal, not a recoverable error.
    pub fn dump(&self, frame: &[u8; PAGE_SIZE]) -> usize {
        let slot = self
            .bitmap
            .find_and_set()
            .unwrap_or_else(|| fatal!("swap device exhausted"));
        for i in 0..SECTORS_PER_PAGE {
            let sector = Sector((slot * SECTORS_PER_PAGE + i) as u32);
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&frame[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            if let Err(e) = self.device.write(sector, &buf) {
                fatal!("swap write to slot {slot} failed: {e}");
            }
        }
        slot
    }

    /// Reads a page back from `slot` and frees it. Panics if `slot` is not
    /// currently occupied — the spec treats loading a free slot as a bug.
    pub fn load(&self, slot: usize, frame: &mut [u8; PAGE_SIZE]) {
        if !self.bitmap.is_set(slot) {
            fatal!("swap_load: slot {slot} is not allocated");
        }
        for i in 0..SECTORS_PER_PAGE {
            let sector = Sector((slot * SECTORS_PER_PAGE + i) as u32);
            let mut buf = [0u8; SECTOR_SIZE];
            if let Err(e) = self.device.read(sector, &mut buf) {
                fatal!("swap read from slot {slot} failed: {e}");
            }
            frame[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        self.bitmap.set(slot, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcore_testkit::MemBlockDevice;

    #[test]
    fn dump_then_load_round_trips() {
        let swap = SwapDevice::new(MemBlockDevice::new(SECTORS_PER_PAGE as u32 * 4));
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 7;
        page[PAGE_SIZE - 1] = 9;
        let slot = swap.dump(&page);
        assert_eq!(swap.used_slots(), 1);
        let mut out = [0u8; PAGE_SIZE];
        swap.load(slot, &mut out);
        assert_eq!(out, page);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn loading_a_free_slot_panics() {
        let swap = SwapDevice::new(MemBlockDevice::new(SECTORS_PER_PAGE as u32 * 2));
        let mut out = [0u8; PAGE_SIZE];
        swap.load(0, &mut out);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn full_swap_panics() {
        let swap = SwapDevice::new(MemBlockDevice::new(SECTORS_PER_PAGE as u32));
        swap.dump(&[0u8; PAGE_SIZE]);
        swap.dump(&[0u8; PAGE_SIZE]);
    }
}
