//! Supplemental page table: a per-process map from user virtual page to
//! residency metadata (§4.5, §9 "Lazy page types as sum type").

use crate::frame::FrameTable;
use crate::swap::SwapDevice;
use kcore::sync::Mutex;
use kcore::{BlockDevice, FileSource, KernelError, PageTable, PhysicalAllocator, Result, Va, VmConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// The per-entry payload, tagged by how the page is backed (§9: "a tagged
/// variant with three cases, each carrying its specific payload").
pub enum Variant {
    Elf {
        file: Arc<dyn FileSource>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        /// Set once the page is written to; on eviction an untouched ELF
        /// page is simply dropped, a dirtied one is promoted to `Swap`.
        dirtied_ever: bool,
    },
    Mmap {
        file: Arc<dyn FileSource>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
    },
    Swap {
        slot: Option<usize>,
    },
}

pub struct SptEntry {
    pub va: Va,
    pub writable: bool,
    pub is_present: bool,
    pub pinned: bool,
    pub variant: Variant,
}

/// Per-process supplemental page table. Generic only over the hardware page
/// table type — the frame table is passed in at call sites that need it
/// rather than stored here, so a `Spt` never needs to outlive or outlast a
/// particular `FrameTable` instance.
pub struct Spt<PT: PageTable> {
    pagetable: Arc<PT>,
    entries: Mutex<HashMap<Va, SptEntry>>,
    config: VmConfig,
}

impl<PT: PageTable> Spt<PT> {
    pub fn new(pagetable: Arc<PT>, config: VmConfig) -> Arc<Self> {
        Arc::new(Self {
            pagetable,
            entries: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn pagetable(&self) -> &Arc<PT> {
        &self.pagetable
    }

    /// Registers a lazy, file-backed ELF segment page (§4.5 `spt_link_elf`).
    pub fn link_elf(
        &self,
        va: Va,
        file: Arc<dyn FileSource>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<()> {
        self.link(
            va,
            writable,
            Variant::Elf {
                file,
                offset,
                read_bytes,
                zero_bytes,
                dirtied_ever: false,
            },
        )
    }

    /// Registers a lazy, file-backed memory-mapped page (§4.5
    /// `spt_link_mmap`). Always writable — `munmap` writes back whatever
    /// was dirtied.
    pub fn link_mmap(
        &self,
        va: Va,
        file: Arc<dyn FileSource>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
    ) -> Result<()> {
        self.link(
            va,
            true,
            Variant::Mmap {
                file,
                offset,
                read_bytes,
                zero_bytes,
            },
        )
    }

    fn link(&self, va: Va, writable: bool, variant: Variant) -> Result<()> {
        if !va.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let mut g = self.entries.lock();
        if g.contains_key(&va) {
            return Err(KernelError::InvalidArgument);
        }
        g.insert(
            va,
            SptEntry {
                va,
                writable,
                is_present: false,
                pinned: false,
                variant,
            },
        );
        Ok(())
    }

    /// Unlinks an entry (munmap, or process exit cleanup). Does not write
    /// anything back — callers that need write-back-on-unmap semantics
    /// (munmap) must do that before calling this.
    pub fn remove(&self, va: Va) {
        self.entries.lock().remove(&va.round_down());
    }

    pub fn contains(&self, va: Va) -> bool {
        self.entries.lock().contains_key(&va.round_down())
    }

    pub fn is_present(&self, va: Va) -> bool {
        self.entries
            .lock()
            .get(&va.round_down())
            .map(|e| e.is_present)
            .unwrap_or(false)
    }

    pub fn is_pinned(&self, va: Va) -> bool {
        self.entries
            .lock()
            .get(&va.round_down())
            .map(|e| e.pinned)
            .unwrap_or(true)
    }

    pub fn set_pinned(&self, va: Va, pinned: bool) {
        if let Some(e) = self.entries.lock().get_mut(&va.round_down()) {
            e.pinned = pinned;
        }
    }

    pub fn is_writable(&self, va: Va) -> bool {
        self.entries
            .lock()
            .get(&va.round_down())
            .map(|e| e.writable)
            .unwrap_or(false)
    }

    /// Brings the page at `va` resident, obtaining a frame from
    /// `frames` (which may itself evict) and installing it into the
    /// hardware page table (§4.5 "Loading").
    pub fn load<A: PhysicalAllocator, D: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameTable<PT, A, D>,
        allocator: &A,
        swap: &SwapDevice<D>,
        va: Va,
    ) -> Result<()> {
        let va = va.round_down();
        enum Action {
            ReadFile {
                file: Arc<dyn FileSource>,
                offset: u64,
                read_bytes: u32,
            },
            LoadSwap {
                slot: usize,
            },
            ZeroFill,
        }
        let (writable, action) = {
            let g = self.entries.lock();
            let e = g.get(&va).ok_or(KernelError::InvalidArgument)?;
            if e.is_present {
                return Ok(());
            }
            let action = match &e.variant {
                Variant::Elf {
                    file,
                    offset,
                    read_bytes,
                    ..
                }
                | Variant::Mmap {
                    file,
                    offset,
                    read_bytes,
                    ..
                } => Action::ReadFile {
                    file: file.clone(),
                    offset: *offset,
                    read_bytes: *read_bytes,
                },
                // `None` means this page has never been resident before — a
                // fresh anonymous (stack-growth) page, zero-filled rather
                // than read from a slot that doesn't exist yet.
                Variant::Swap { slot: None } => Action::ZeroFill,
                Variant::Swap { slot: Some(slot) } => Action::LoadSwap { slot: *slot },
            };
            (e.writable, action)
        };

        let pa = match &action {
            Action::ReadFile { read_bytes, .. } => frames.get(self, va, *read_bytes == 0),
            Action::LoadSwap { .. } => frames.get(self, va, false),
            Action::ZeroFill => frames.get(self, va, true),
        };

        match action {
            Action::ReadFile {
                file,
                offset,
                read_bytes,
            } => {
                if read_bytes > 0 {
                    let mut page = [0u8; kcore::PAGE_SIZE];
                    let n = file.read_at(&mut page[..read_bytes as usize], offset)?;
                    if (n as u32) < read_bytes {
                        page[n..read_bytes as usize].fill(0);
                    }
                    allocator.write_frame(pa, &page);
                }
            }
            Action::LoadSwap { slot } => {
                let mut page = [0u8; kcore::PAGE_SIZE];
                swap.load(slot, &mut page);
                allocator.write_frame(pa, &page);
                if let Some(e) = self.entries.lock().get_mut(&va) {
                    if let Variant::Swap { slot } = &mut e.variant {
                        *slot = None;
                    }
                }
            }
            Action::ZeroFill => {}
        }

        self.pagetable.set_page(va, pa, writable);
        if let Some(e) = self.entries.lock().get_mut(&va) {
            e.is_present = true;
        }
        trace!(?va, "page loaded");
        Ok(())
    }

    /// Grows the stack by one page if `fault_va` falls within the
    /// stack-growth window relative to `esp` (§4.5 "Stack growth policy").
    pub fn try_stack_growth(
        self: &Arc<Self>,
        phys_base: Va,
        esp: Va,
        fault_va: Va,
    ) -> Result<bool> {
        let page = fault_va.round_down();
        let within_window = (phys_base - page) as u64 <= self.config.stack_growth_window;
        let close_to_esp = fault_va - esp >= -(self.config.stack_growth_slack as i64);
        if !within_window || !close_to_esp {
            return Ok(false);
        }
        self.link(page, true, Variant::Swap { slot: None })?;
        if let Some(e) = self.entries.lock().get_mut(&page) {
            e.is_present = false;
        }
        Ok(true)
    }

    /// Called by the frame table when it evicts the frame backing `va`.
    /// Dispatches by variant: writes MMAP pages back to file if dirty,
    /// always dumps SWAP pages, and promotes dirtied ELF pages to SWAP
    /// before dumping (§4.3 "Victim handling").
    pub fn handle_eviction<D: BlockDevice>(
        &self,
        va: Va,
        frame: [u8; kcore::PAGE_SIZE],
        dirty: bool,
        swap: &SwapDevice<D>,
    ) {
        let mut g = self.entries.lock();
        let Some(e) = g.get_mut(&va) else { return };
        match &mut e.variant {
            Variant::Mmap { file, offset, .. } => {
                if dirty {
                    if let Err(err) = file.write_at(&frame, *offset) {
                        tracing::warn!(?va, %err, "mmap writeback failed");
                    }
                }
            }
            Variant::Swap { slot } => {
                *slot = Some(swap.dump(&frame));
            }
            Variant::Elf { dirtied_ever, .. } => {
                if dirty {
                    *dirtied_ever = true;
                }
                if *dirtied_ever {
                    let new_slot = swap.dump(&frame);
                    e.variant = Variant::Swap {
                        slot: Some(new_slot),
                    };
                }
            }
        }
        e.is_present = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTable;
    use kcore_testkit::{MemAllocator, MemBlockDevice, MemFileSource, MemPageTable};

    #[test]
    fn link_elf_then_load_zero_fills_tail() {
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt.clone(), VmConfig::default());
        let alloc = Arc::new(MemAllocator::new(4));
        let swap = Arc::new(SwapDevice::new(MemBlockDevice::new(64)));
        let frames = FrameTable::new(alloc.clone(), swap.clone());
        let file = Arc::new(MemFileSource::new(vec![1, 2, 3, 4]));
        spt.link_elf(Va(0x1000), file, 0, 4, (kcore::PAGE_SIZE - 4) as u32, true)
            .unwrap();
        spt.load(&frames, &alloc, &swap, Va(0x1000)).unwrap();
        assert!(spt.is_present(Va(0x1000)));
        let pa = pt.translate(Va(0x1000)).unwrap();
        let mut page = [0u8; kcore::PAGE_SIZE];
        alloc.read_frame(pa, &mut page);
        assert_eq!(&page[..4], &[1, 2, 3, 4]);
        assert!(page[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stack_growth_within_window_succeeds() {
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt, VmConfig::default());
        let phys_base = Va(0x8000_0000);
        let esp = Va(phys_base.0 - 4096);
        let fault = Va(phys_base.0 - 4096 - 8);
        assert!(spt.try_stack_growth(phys_base, esp, fault).unwrap());
        assert!(spt.contains(fault));
    }

    #[test]
    fn stack_growth_outside_window_fails() {
        let pt = Arc::new(MemPageTable::new());
        let spt = Spt::new(pt, VmConfig::default());
        let phys_base = Va(0x8000_0000);
        let esp = Va(phys_base.0 - 4096);
        let fault = Va(phys_base.0 - 16 * 1024 * 1024);
        assert!(!spt.try_stack_growth(phys_base, esp, fault).unwrap());
    }
}
