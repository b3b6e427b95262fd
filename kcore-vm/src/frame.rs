//! The frame table: process-wide bookkeeping of which physical frame backs
//! which (process, virtual page), with two-revolution second-chance
//! eviction (§4.3, §5 point 4: "the frame-table lock wraps both the
//! eviction scan and the allocation, but is released before the victim's
//! disk I/O").

use crate::spt::Spt;
use crate::swap::SwapDevice;
use kcore::sync::Mutex;
use kcore::{fatal, BlockDevice, Pa, PageTable, PhysicalAllocator, Va, PAGE_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

struct FrameEntry<PT: PageTable> {
    pa: Pa,
    spt: Arc<Spt<PT>>,
    va: Va,
}

struct Inner<PT: PageTable> {
    entries: HashMap<usize, FrameEntry<PT>>,
    /// Physical frame numbers in clock order. The hand walks this; removing
    /// an entry shifts everything after it, which is fine at the frame
    /// counts this kernel deals with.
    order: Vec<usize>,
    hand: usize,
}

impl<PT: PageTable> Inner<PT> {
    fn remove_at(&mut self, pos: usize) -> FrameEntry<PT> {
        let pfn = self.order.remove(pos);
        if pos < self.hand && self.hand > 0 {
            self.hand -= 1;
        }
        if self.hand >= self.order.len() {
            self.hand = 0;
        }
        self.entries.remove(&pfn).expect("order/entries out of sync")
    }
}

struct Victim<PT: PageTable> {
    entry: FrameEntry<PT>,
    dirty: bool,
}

/// Owns the physical allocator and the swap device, and hands out frames to
/// any number of per-process [`Spt`]s.
pub struct FrameTable<PT: PageTable, A: PhysicalAllocator, D: BlockDevice> {
    allocator: Arc<A>,
    swap: Arc<SwapDevice<D>>,
    inner: Mutex<Inner<PT>>,
}

impl<PT: PageTable, A: PhysicalAllocator, D: BlockDevice> FrameTable<PT, A, D> {
    pub fn new(allocator: Arc<A>, swap: Arc<SwapDevice<D>>) -> Self {
        Self {
            allocator,
            swap,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                hand: 0,
            }),
        }
    }

    pub fn allocator(&self) -> &Arc<A> {
        &self.allocator
    }

    pub fn swap(&self) -> &Arc<SwapDevice<D>> {
        &self.swap
    }

    /// Obtains a physical frame for `va` within `spt`, evicting a victim if
    /// the allocator is exhausted. On return the frame is bound into the
    /// table but not yet installed into hardware — the caller (`Spt::load`)
    /// fills its contents and calls `pagetable.set_page` itself.
    pub fn get(&self, spt: &Arc<Spt<PT>>, va: Va, zero: bool) -> Pa {
        let va = va.round_down();
        loop {
            let mut g = self.inner.lock();
            if let Some(pa) = self.allocator.get_page(zero) {
                let pfn = pa.pfn();
                g.entries.insert(
                    pfn,
                    FrameEntry {
                        pa,
                        spt: spt.clone(),
                        va,
                    },
                );
                g.order.push(pfn);
                trace!(?va, pfn, "frame allocated");
                return pa;
            }
            let victim = self.find_victim(&mut g);
            drop(g);
            self.writeback_and_release(victim);
        }
    }

    /// Explicitly releases the frame backing `va` in `spt` (munmap, or
    /// process teardown) without paging it out.
    pub fn free(&self, spt: &Arc<Spt<PT>>, va: Va) {
        let va = va.round_down();
        let Some(pa) = spt.pagetable().translate(va) else {
            return;
        };
        let mut g = self.inner.lock();
        if let Some(pos) = g.order.iter().position(|&pfn| pfn == pa.pfn()) {
            g.remove_at(pos);
        }
        drop(g);
        spt.pagetable().clear_page(va);
        self.allocator.free_page(pa);
    }

    /// Like [`free`](Self::free), but writes the page back first if it is
    /// dirty — the path `munmap` uses, as opposed to process teardown which
    /// just discards everything.
    pub fn unmap(&self, spt: &Arc<Spt<PT>>, va: Va) {
        let va = va.round_down();
        let Some(pa) = spt.pagetable().translate(va) else {
            return;
        };
        let dirty = spt.pagetable().is_dirty(va);
        let mut frame = [0u8; PAGE_SIZE];
        self.allocator.read_frame(pa, &mut frame);
        spt.handle_eviction(va, frame, dirty, self.swap.as_ref());
        self.free(spt, va);
    }

    /// Scans for a victim using the two-revolution second-chance rule:
    /// pinned frames are always skipped, an accessed-but-unpinned frame
    /// gets its accessed bit cleared and a second look, and anything left
    /// unaccessed after that is evicted. Fatal if nothing is evictable
    /// after two full sweeps — every frame pinned means the kernel asked
    /// for more memory than it is willing to give up, which is a bug.
    fn find_victim(&self, g: &mut Inner<PT>) -> Victim<PT> {
        let len = g.order.len();
        if len == 0 {
            fatal!("frame table eviction requested with no frames resident");
        }
        for _ in 0..(2 * len) {
            let pos = g.hand;
            g.hand = (g.hand + 1) % len;
            let pfn = g.order[pos];
            let (va, pinned, accessed) = {
                let entry = g.entries.get(&pfn).expect("order/entries out of sync");
                (
                    entry.va,
                    entry.spt.is_pinned(entry.va),
                    entry.spt.pagetable().is_accessed(entry.va),
                )
            };
            if pinned {
                continue;
            }
            if accessed {
                g.entries
                    .get(&pfn)
                    .unwrap()
                    .spt
                    .pagetable()
                    .set_accessed(va, false);
                continue;
            }
            let dirty = g.entries.get(&pfn).unwrap().spt.pagetable().is_dirty(va);
            let entry = g.remove_at(pos);
            return Victim { entry, dirty };
        }
        fatal!("frame table eviction found no unpinned victim after two sweeps");
    }

    /// Writes the victim's contents out (delegating to its `Spt` for the
    /// ELF/MMAP/SWAP dispatch), clears its hardware mapping, and returns the
    /// physical frame to the allocator. Runs with the table lock released.
    fn writeback_and_release(&self, victim: Victim<PT>) {
        let Victim { entry, dirty } = victim;
        let mut frame = [0u8; PAGE_SIZE];
        self.allocator.read_frame(entry.pa, &mut frame);
        entry
            .spt
            .handle_eviction(entry.va, frame, dirty, self.swap.as_ref());
        entry.spt.pagetable().clear_page(entry.va);
        self.allocator.free_page(entry.pa);
        debug!(va = ?entry.va, "frame evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spt::Spt;
    use kcore::VmConfig;
    use kcore_testkit::{MemAllocator, MemBlockDevice, MemFileSource, MemPageTable};

    fn table(
        frames: usize,
    ) -> FrameTable<MemPageTable, MemAllocator, MemBlockDevice> {
        FrameTable::new(
            Arc::new(MemAllocator::new(frames)),
            Arc::new(SwapDevice::new(MemBlockDevice::new(64))),
        )
    }

    #[test]
    fn allocates_until_exhausted_then_evicts() {
        let ft = table(2);
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt.clone(), VmConfig::default());
        let file = Arc::new(MemFileSource::new(vec![0; PAGE_SIZE]));

        for i in 0..3u64 {
            let va = Va(0x1000 * (i + 1));
            spt.link_mmap(va, file.clone(), 0, PAGE_SIZE as u32, 0)
                .unwrap();
            spt.load(&ft, ft.allocator(), ft.swap(), va).unwrap();
        }
        assert!(pt.translate(Va(0x1000)).is_some() || pt.translate(Va(0x2000)).is_some());
    }

    #[test]
    fn pinned_frame_is_never_chosen_as_victim() {
        let ft = table(1);
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt.clone(), VmConfig::default());
        let file = Arc::new(MemFileSource::new(vec![0; PAGE_SIZE]));

        spt.link_mmap(Va(0x1000), file.clone(), 0, PAGE_SIZE as u32, 0)
            .unwrap();
        spt.load(&ft, ft.allocator(), ft.swap(), Va(0x1000)).unwrap();
        spt.set_pinned(Va(0x1000), true);

        spt.link_mmap(Va(0x2000), file, 0, PAGE_SIZE as u32, 0)
            .unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            spt.load(&ft, ft.allocator(), ft.swap(), Va(0x2000)).unwrap();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn free_returns_frame_to_allocator() {
        let ft = table(1);
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt.clone(), VmConfig::default());
        let file = Arc::new(MemFileSource::new(vec![0; PAGE_SIZE]));
        spt.link_mmap(Va(0x1000), file.clone(), 0, PAGE_SIZE as u32, 0)
            .unwrap();
        spt.load(&ft, ft.allocator(), ft.swap(), Va(0x1000)).unwrap();
        ft.free(&spt, Va(0x1000));
        assert!(pt.translate(Va(0x1000)).is_none());

        spt.link_mmap(Va(0x2000), file, 0, PAGE_SIZE as u32, 0)
            .unwrap();
        spt.load(&ft, ft.allocator(), ft.swap(), Va(0x2000)).unwrap();
        assert!(pt.translate(Va(0x2000)).is_some());
    }
}
