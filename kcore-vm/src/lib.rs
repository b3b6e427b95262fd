//! Demand-paged virtual memory: a frame table shared by every process, a
//! per-process supplemental page table describing how to refill a page that
//! isn't resident, and a swap device backing pages with no other home.
//!
//! Mirrors the shape of `kcore-fs`: traits from `kcore` stand in for the
//! hardware (`PageTable`, `PhysicalAllocator`) and the swap disk
//! (`BlockDevice`), so the eviction and fault-handling logic is exercised by
//! ordinary `#[test]`s instead of a running kernel.

pub mod frame;
pub mod pin;
pub mod spt;
pub mod swap;

pub use frame::FrameTable;
pub use pin::{check_and_pin_addr, pin_range, unpin};
pub use spt::{Spt, SptEntry, Variant};
pub use swap::SwapDevice;

#[cfg(test)]
mod tests {
    use crate::{FrameTable, Spt, SwapDevice};
    use kcore::{FileSource, Va, VmConfig, PAGE_SIZE};
    use kcore_testkit::{MemAllocator, MemBlockDevice, MemFileSource, MemPageTable};
    use std::sync::Arc;

    fn harness(
        frames: usize,
    ) -> (
        Arc<FrameTable<MemPageTable, MemAllocator, MemBlockDevice>>,
        Arc<Spt<MemPageTable>>,
        Arc<MemPageTable>,
    ) {
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt.clone(), VmConfig::default());
        let alloc = Arc::new(MemAllocator::new(frames));
        let swap = Arc::new(SwapDevice::new(MemBlockDevice::new(256)));
        let ft = Arc::new(FrameTable::new(alloc, swap));
        (ft, spt, pt)
    }

    /// Scenario 4: allocate pages until the allocator is empty, touch one
    /// more anonymous page, and confirm the evicted page reloads intact.
    #[test]
    fn scenario_4_eviction_round_trips_anonymous_page() {
        let (ft, spt, pt) = harness(1);
        let phys_base = Va(0x8000_0000);
        let esp = Va(phys_base.0 - 3 * PAGE_SIZE as u64);
        let page_a = Va(phys_base.0 - PAGE_SIZE as u64);
        let page_b = Va(phys_base.0 - 2 * PAGE_SIZE as u64);

        assert!(spt.try_stack_growth(phys_base, esp, page_a).unwrap());
        spt.load(&ft, ft.allocator(), ft.swap(), page_a).unwrap();

        let pattern = [0x5A; PAGE_SIZE];
        let pa_a = pt.translate(page_a).unwrap();
        ft.allocator().write_frame(pa_a, &pattern);
        pt.simulate_write(page_a);

        assert!(spt.try_stack_growth(phys_base, esp, page_b).unwrap());
        spt.load(&ft, ft.allocator(), ft.swap(), page_b).unwrap();

        // page_a was the sole resident, unpinned, non-accessed-after-clear
        // frame, so it must have been the victim.
        assert!(!spt.is_present(page_a));
        assert!(pt.translate(page_a).is_none());
        assert_eq!(ft.swap().used_slots(), 1);

        // Touching it again reloads identical bytes (evicts page_b in turn).
        spt.load(&ft, ft.allocator(), ft.swap(), page_a).unwrap();
        assert!(spt.is_present(page_a));
        let pa_a2 = pt.translate(page_a).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        ft.allocator().read_frame(pa_a2, &mut out);
        assert_eq!(out, pattern);
    }

    /// Invariant 7: the swap bitmap's set-bit count equals the number of
    /// SPT entries currently in the SWAP state but not resident.
    #[test]
    fn invariant_7_swap_occupancy_matches_non_resident_swap_entries() {
        let (ft, spt, _pt) = harness(1);
        let phys_base = Va(0x8000_0000);
        let esp = Va(phys_base.0 - 4 * PAGE_SIZE as u64);
        let pages: Vec<Va> = (1..=3)
            .map(|i| Va(phys_base.0 - i * PAGE_SIZE as u64))
            .collect();

        for &va in &pages {
            spt.try_stack_growth(phys_base, esp, va).unwrap();
            spt.load(&ft, ft.allocator(), ft.swap(), va).unwrap();
        }

        let non_resident = pages.iter().filter(|&&va| !spt.is_present(va)).count();
        assert_eq!(non_resident, 2);
        assert_eq!(ft.swap().used_slots(), non_resident);
        assert!(spt.is_present(pages[2]));
    }

    /// Scenario 5: mmap a file, dirty every page, munmap, and confirm the
    /// on-disk contents match what was written.
    #[test]
    fn scenario_5_munmap_writes_back_dirty_pages() {
        let (ft, spt, pt) = harness(4);
        let file = Arc::new(MemFileSource::new(vec![0u8; 3 * PAGE_SIZE]));
        let base = Va(0x1000_0000);

        for i in 0..3u64 {
            let va = Va(base.0 + i * PAGE_SIZE as u64);
            spt.link_mmap(va, file.clone(), i * PAGE_SIZE as u64, PAGE_SIZE as u32, 0)
                .unwrap();
            spt.load(&ft, ft.allocator(), ft.swap(), va).unwrap();
        }

        let mut pattern = vec![0u8; 3 * PAGE_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        for i in 0..3u64 {
            let va = Va(base.0 + i * PAGE_SIZE as u64);
            let pa = pt.translate(va).unwrap();
            let mut page = [0u8; PAGE_SIZE];
            page.copy_from_slice(&pattern[i as usize * PAGE_SIZE..(i as usize + 1) * PAGE_SIZE]);
            ft.allocator().write_frame(pa, &page);
            pt.simulate_write(va);
        }

        for i in 0..3u64 {
            let va = Va(base.0 + i * PAGE_SIZE as u64);
            ft.unmap(&spt, va);
            spt.remove(va);
        }

        let mut on_disk = vec![0u8; 3 * PAGE_SIZE];
        file.read_at(&mut on_disk, 0).unwrap();
        assert_eq!(on_disk, pattern);
    }

    /// Boundary: a stack touch just inside the growth window succeeds, one
    /// just outside it does not (caller is expected to kill the process).
    #[test]
    fn boundary_stack_growth_window_edge() {
        let (_ft, spt, _pt) = harness(4);
        let phys_base = Va(0x8000_0000);
        // Deep enough that both candidate faults sit above esp, so only the
        // 8 MiB window decides the outcome.
        let esp = Va(phys_base.0 - 16 * 1024 * 1024);
        let just_inside = Va(phys_base.0 - 8 * 1024 * 1024 + 1);
        let just_outside = Va(phys_base.0 - 8 * 1024 * 1024 - 1);
        assert!(spt.try_stack_growth(phys_base, esp, just_inside).unwrap());
        assert!(!spt.try_stack_growth(phys_base, esp, just_outside).unwrap());
    }
}
