//! In-memory inode, open-inode registry, and reader/writer/deny-write
//! coordination (§4.2, §5 point 3, §8 invariants 4 and 5).
//!
//! The open-inode registry is a `DashMap<Sector, Weak<OpenInode>>`: entries
//! are looked up, upgraded, or inserted through `DashMap::entry`, which holds
//! the shard lock for the whole match arm. `Inode::close` goes through the
//! same `entry` call on the same sector, so an open racing a close on the
//! same sector always serializes through that one shard lock — this is the
//! Rust shape of the "open-registry lock wraps it when mutating open-counts"
//! rule in the concurrency model.

use crate::disk::{self, IndexPath, InodeType, RawInode};
use crate::freemap::FreeMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kcore::sync::{ConditionVariable, Mutex, MutexGuard};
use kcore::{fatal, BlockDevice, CacheConfig, KernelError, Result, Sector, SECTOR_SIZE};
use kcore_cache::{BufferCache, LockMode};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct DenyState {
    write_cnt: u32,
    deny_write_cnt: u32,
}

struct OpenInode {
    sector: Sector,
    open_cnt: Mutex<usize>,
    removed: Mutex<bool>,
    deny: Mutex<DenyState>,
    no_write: ConditionVariable,
    extension_lock: Mutex<()>,
    content_lock: Mutex<()>,
}

/// The process-wide filesystem: a buffer cache, a free-sector map, and the
/// open-inode registry that deduplicates handles by sector (§8 invariant 5).
pub struct Filesystem<D: BlockDevice> {
    cache: BufferCache<D>,
    freemap: FreeMap,
    registry: DashMap<Sector, Weak<OpenInode>>,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Builds a fresh filesystem over `device`. `reserved` marks sectors
    /// that are already inodes (or otherwise spoken for) before this
    /// filesystem's free map is constructed — typically empty for a disk
    /// formatted from scratch.
    pub fn new(
        device: D,
        cache_config: CacheConfig,
        reserved: impl IntoIterator<Item = Sector>,
    ) -> Arc<Self> {
        let cache = BufferCache::new(device, cache_config);
        let freemap = FreeMap::new(cache.device(), reserved);
        Arc::new(Self {
            cache,
            freemap,
            registry: DashMap::new(),
        })
    }

    pub fn cache(&self) -> &BufferCache<D> {
        &self.cache
    }

    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Allocates a fresh sector, writes a zeroed inode to it, and opens it.
    pub fn create(self: &Arc<Self>, file_type: InodeType) -> Result<Inode<D>> {
        let sector = self.freemap.alloc()?;
        let h = self.cache.lock(sector, LockMode::Exclusive);
        h.write(&RawInode::new(file_type).to_bytes());
        h.unlock();
        debug!(%sector, "inode created");
        self.open(sector)
    }

    /// Returns the unique handle for `sector`, constructing it if this is
    /// the first open since the last close (or ever).
    pub fn open(self: &Arc<Self>, sector: Sector) -> Result<Inode<D>> {
        let inner = match self.registry.entry(sector) {
            Entry::Occupied(mut e) => {
                if let Some(arc) = e.get().upgrade() {
                    *arc.open_cnt.lock() += 1;
                    arc
                } else {
                    let arc = self.construct(sector)?;
                    e.insert(Arc::downgrade(&arc));
                    arc
                }
            }
            Entry::Vacant(e) => {
                let arc = self.construct(sector)?;
                e.insert(Arc::downgrade(&arc));
                arc
            }
        };
        Ok(Inode {
            fs: self.clone(),
            inner,
            denied: false,
            closed: false,
        })
    }

    fn construct(&self, sector: Sector) -> Result<Arc<OpenInode>> {
        let h = self.cache.lock(sector, LockMode::Shared);
        let _ = RawInode::from_bytes(&h.read())?;
        h.unlock();
        Ok(Arc::new(OpenInode {
            sector,
            open_cnt: Mutex::new(1),
            removed: Mutex::new(false),
            deny: Mutex::new(DenyState {
                write_cnt: 0,
                deny_write_cnt: 0,
            }),
            no_write: ConditionVariable::new(),
            extension_lock: Mutex::new(()),
            content_lock: Mutex::new(()),
        }))
    }

    /// Recursively frees every allocated data/indirect sector belonging to
    /// `sector`'s inode, then the inode sector itself (§4.2 "Recursive
    /// erase"). Called only once the last reference to a `removed` inode
    /// closes.
    fn erase(&self, sector: Sector) {
        let h = self.cache.lock(sector, LockMode::Shared);
        let raw = RawInode::from_bytes(&h.read())
            .unwrap_or_else(|e| fatal!("erase: corrupted inode at {sector}: {e}"));
        h.unlock();

        for i in 0..disk::DIRECT_COUNT {
            self.free_tree(raw.pointers[i], 0);
        }
        self.free_tree(raw.pointers[RawInode::indirect_index()], 1);
        self.free_tree(raw.pointers[RawInode::double_indirect_index()], 2);

        self.freemap.release(sector);
        self.cache.free(sector);
        debug!(%sector, "inode erased");
    }

    fn free_tree(&self, ptr: u32, depth: u8) {
        if ptr == 0 {
            return;
        }
        let sector = Sector(ptr);
        if depth > 0 {
            let h = self.cache.lock(sector, LockMode::Shared);
            let block = disk::read_pointer_block(&h.read());
            h.unlock();
            for child in block {
                self.free_tree(child, depth - 1);
            }
        }
        self.freemap.release(sector);
        self.cache.free(sector);
    }

    /// Looks up (allocating on demand iff `allocate`) the sector backing the
    /// inode's `idx`-th direct pointer, reacquiring the header exclusively
    /// and rechecking before allocating (§4.2: "re-lock the parent
    /// exclusive and re-check; another writer may have filled it").
    fn ensure_header_pointer(&self, sector: Sector, idx: usize, allocate: bool) -> Result<Option<Sector>> {
        let h = self.cache.lock(sector, LockMode::Shared);
        let existing = RawInode::from_bytes(&h.read())?.pointers[idx];
        h.unlock();
        if existing != 0 {
            return Ok(Some(Sector(existing)));
        }
        if !allocate {
            return Ok(None);
        }
        let h = self.cache.lock(sector, LockMode::Exclusive);
        let mut raw = RawInode::from_bytes(&h.read())?;
        let existing = raw.pointers[idx];
        let target = if existing != 0 {
            Sector(existing)
        } else {
            let s = self.freemap.alloc()?;
            raw.pointers[idx] = s.0;
            h.write(&raw.to_bytes());
            s
        };
        h.unlock();
        if existing == 0 {
            let z = self.cache.lock(target, LockMode::Exclusive);
            z.set_zero();
            z.unlock();
        }
        Ok(Some(target))
    }

    /// Same as [`Filesystem::ensure_header_pointer`], but for a plain
    /// 128-pointer indirect/double-indirect block rather than the header.
    fn ensure_block_pointer(&self, block: Sector, idx: usize, allocate: bool) -> Result<Option<Sector>> {
        let h = self.cache.lock(block, LockMode::Shared);
        let existing = disk::read_pointer_block(&h.read())[idx];
        h.unlock();
        if existing != 0 {
            return Ok(Some(Sector(existing)));
        }
        if !allocate {
            return Ok(None);
        }
        let h = self.cache.lock(block, LockMode::Exclusive);
        let mut buf = h.read();
        let existing = disk::read_pointer_block(&buf)[idx];
        let target = if existing != 0 {
            Sector(existing)
        } else {
            let s = self.freemap.alloc()?;
            disk::write_pointer(&mut buf, idx, s.0);
            h.write(&buf);
            s
        };
        h.unlock();
        if existing == 0 {
            let z = self.cache.lock(target, LockMode::Exclusive);
            z.set_zero();
            z.unlock();
        }
        Ok(Some(target))
    }

    fn locate(&self, header: Sector, logical_idx: usize, allocate: bool) -> Result<Option<Sector>> {
        let path = disk::index_path(logical_idx).ok_or(KernelError::NoSpace)?;
        match path {
            IndexPath::Direct(i) => self.ensure_header_pointer(header, i, allocate),
            IndexPath::Indirect(i) => {
                match self.ensure_header_pointer(header, RawInode::indirect_index(), allocate)? {
                    Some(ind) => self.ensure_block_pointer(ind, i, allocate),
                    None => Ok(None),
                }
            }
            IndexPath::DoubleIndirect(outer, inner) => {
                match self.ensure_header_pointer(header, RawInode::double_indirect_index(), allocate)? {
                    Some(dind) => match self.ensure_block_pointer(dind, outer, allocate)? {
                        Some(ind) => self.ensure_block_pointer(ind, inner, allocate),
                        None => Ok(None),
                    },
                    None => Ok(None),
                }
            }
        }
    }
}

/// A handle on an open inode. Two `Inode`s that came from [`Filesystem::open`]
/// on the same sector (directly or via [`Inode::reopen`]) share the same
/// underlying [`OpenInode`] and therefore the same deny-write/length state.
pub struct Inode<D: BlockDevice> {
    fs: Arc<Filesystem<D>>,
    inner: Arc<OpenInode>,
    /// Whether *this* handle currently holds a `deny_write` — each opener
    /// may deny/allow at most once (§4.2 invariant).
    denied: bool,
    closed: bool,
}

impl<D: BlockDevice> Inode<D> {
    pub fn sector(&self) -> Sector {
        self.inner.sector
    }

    fn read_header(&self) -> RawInode {
        let h = self.fs.cache.lock(self.inner.sector, LockMode::Shared);
        let raw = RawInode::from_bytes(&h.read())
            .unwrap_or_else(|e| fatal!("inode {}: corrupted header: {e}", self.inner.sector));
        h.unlock();
        raw
    }

    pub fn length(&self) -> u64 {
        self.read_header().length as u64
    }

    pub fn file_type(&self) -> InodeType {
        self.read_header().file_type
    }

    /// Reopens this inode, returning an independent handle that shares the
    /// same underlying state and counts as one more open reference.
    pub fn reopen(&self) -> Inode<D> {
        *self.inner.open_cnt.lock() += 1;
        Inode {
            fs: self.fs.clone(),
            inner: self.inner.clone(),
            denied: false,
            closed: false,
        }
    }

    /// Marks the inode for deletion: its sectors are freed when the last
    /// open reference closes.
    pub fn mark_removed(&self) {
        *self.inner.removed.lock() = true;
    }

    pub fn is_removed(&self) -> bool {
        *self.inner.removed.lock()
    }

    /// A whole-inode content lock for callers layered above this crate
    /// (e.g. a directory implementation serializing entry add/remove); the
    /// inode layer itself never takes it.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.content_lock.lock()
    }

    /// Blocks until no writer is active, then refuses further writers.
    /// Panics if this handle already holds the deny (each opener denies at
    /// most once, per §4.2).
    pub fn deny_write(&mut self) {
        assert!(!self.denied, "deny_write called twice by the same opener");
        let mut g = self.inner.deny.lock();
        g = self.inner.no_write.wait_while(g, |d| d.write_cnt != 0);
        g.deny_write_cnt += 1;
        self.denied = true;
    }

    pub fn allow_write(&mut self) {
        assert!(self.denied, "allow_write without a matching deny_write");
        let mut g = self.inner.deny.lock();
        g.deny_write_cnt -= 1;
        self.denied = false;
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, zero-filling
    /// holes, and stopping at the current length.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let length = self.length();
        if offset >= length {
            return Ok(0);
        }
        let mut to_read = (buf.len() as u64).min(length - offset) as usize;
        let mut pos = offset;
        let mut done = 0usize;
        while to_read > 0 {
            let logical = (pos / SECTOR_SIZE as u64) as usize;
            let sector_off = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = to_read.min(SECTOR_SIZE - sector_off);
            match self.fs.locate(self.inner.sector, logical, false)? {
                Some(sector) => {
                    let h = self.fs.cache.lock(sector, LockMode::Shared);
                    let data = h.read();
                    h.unlock();
                    buf[done..done + chunk].copy_from_slice(&data[sector_off..sector_off + chunk]);
                }
                None => buf[done..done + chunk].fill(0),
            }
            pos += chunk as u64;
            done += chunk;
            to_read -= chunk;
        }
        Ok(done)
    }

    /// Writes `data` at `offset`, growing the file (sparsely) as needed.
    /// Returns `Ok(0)` without writing if another opener currently denies
    /// writes (§8 boundary: "subsequent writes return 0").
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        {
            let mut deny = self.inner.deny.lock();
            if deny.deny_write_cnt > 0 {
                return Ok(0);
            }
            deny.write_cnt += 1;
        }
        let result = self.write_at_inner(data, offset);
        {
            let mut deny = self.inner.deny.lock();
            deny.write_cnt -= 1;
            if deny.write_cnt == 0 {
                self.inner.no_write.broadcast(deny);
            }
        }
        result
    }

    fn write_at_inner(&self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(KernelError::NoSpace)?;
        if end > disk::MAX_FILE_SIZE {
            return Err(KernelError::NoSpace);
        }
        let mut pos = offset;
        let mut done = 0usize;
        let mut remaining = data.len();
        while remaining > 0 {
            let logical = (pos / SECTOR_SIZE as u64) as usize;
            let sector_off = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = remaining.min(SECTOR_SIZE - sector_off);
            let sector = self
                .fs
                .locate(self.inner.sector, logical, true)?
                .expect("allocate=true always resolves a sector");
            let h = self.fs.cache.lock(sector, LockMode::Exclusive);
            let mut buf = h.read();
            buf[sector_off..sector_off + chunk].copy_from_slice(&data[done..done + chunk]);
            h.write(&buf);
            h.unlock();
            pos += chunk as u64;
            done += chunk;
            remaining -= chunk;
        }
        self.publish_length(end)?;
        Ok(done)
    }

    /// Publishes a new length only after the data has landed, and only if
    /// it grows the file — never shrinks it implicitly (§4.2 "Length
    /// publication").
    fn publish_length(&self, new_end: u64) -> Result<()> {
        let _ext = self.inner.extension_lock.lock();
        let h = self.fs.cache.lock(self.inner.sector, LockMode::Exclusive);
        let mut raw = RawInode::from_bytes(&h.read())?;
        if new_end > raw.length as u64 {
            raw.length = new_end as u32;
            h.write(&raw.to_bytes());
        }
        h.unlock();
        Ok(())
    }

    pub fn close(mut self) {
        self.do_close();
    }

    fn do_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.denied {
            warn!(sector = %self.inner.sector, "inode dropped with an outstanding deny_write; releasing it");
            self.allow_write();
        }
        let sector = self.inner.sector;
        let (last, removed) = match self.fs.registry.entry(sector) {
            Entry::Occupied(e) => {
                let last = {
                    let mut cnt = self.inner.open_cnt.lock();
                    *cnt -= 1;
                    *cnt == 0
                };
                if last {
                    e.remove();
                }
                (last, *self.inner.removed.lock())
            }
            Entry::Vacant(_) => (false, false),
        };
        if last && removed {
            self.fs.erase(sector);
        }
    }
}

impl<D: BlockDevice> Drop for Inode<D> {
    fn drop(&mut self) {
        self.do_close();
    }
}

/// Lets the VM triad load ELF segments and memory-mapped pages, and write
/// them back, without depending on this crate directly.
impl<D: BlockDevice> kcore::FileSource for Inode<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Inode::read_at(self, buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        Inode::write_at(self, data, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcore_testkit::MemBlockDevice;

    fn fs(sectors: u32) -> Arc<Filesystem<MemBlockDevice>> {
        Filesystem::new(MemBlockDevice::new(sectors), CacheConfig::default(), [])
    }

    #[test]
    fn scenario_1_small_write_then_read() {
        let fs = fs(64);
        let inode = fs.create(InodeType::File).unwrap();
        let payload = vec![b'A'; 5000];
        assert_eq!(inode.write_at(&payload, 0).unwrap(), 5000);
        let mut out = vec![0u8; 5000];
        assert_eq!(inode.read_at(&mut out, 0).unwrap(), 5000);
        assert_eq!(out, payload);
        assert_eq!(inode.length(), 5000);
    }

    #[test]
    fn scenario_2_sparse_write_creates_hole() {
        // 1_000_001 bytes needs ceil(1_000_001/512) ~= 1954 data sectors plus
        // indirect/double-indirect bookkeeping sectors and the header.
        let fs = fs(4096);
        let inode = fs.create(InodeType::File).unwrap();
        inode.write_at(&[0x42], 1_000_000).unwrap();
        let mut zeros = [0xFFu8; 512];
        assert_eq!(inode.read_at(&mut zeros, 0).unwrap(), 512);
        assert_eq!(zeros, [0u8; 512]);
        let mut one = [0u8; 1];
        assert_eq!(inode.read_at(&mut one, 1_000_000).unwrap(), 1);
        assert_eq!(one[0], 0x42);
        assert_eq!(inode.length(), 1_000_001);
    }

    #[test]
    fn scenario_3_deny_write_blocks_other_writers() {
        let fs = fs(64);
        let mut a = fs.create(InodeType::File).unwrap();
        let b = fs.open(a.sector()).unwrap();
        a.deny_write();
        assert_eq!(b.write_at(b"x", 0).unwrap(), 0);
        a.allow_write();
        assert_eq!(b.write_at(b"x", 0).unwrap(), 1);
    }

    #[test]
    fn boundary_write_past_max_size_fails() {
        let fs = fs(20000);
        let inode = fs.create(InodeType::File).unwrap();
        assert!(inode
            .write_at(&[0u8; 1], disk::MAX_FILE_SIZE)
            .is_err());
    }

    #[test]
    fn invariant_open_registry_deduplicates() {
        let fs = fs(64);
        let a = fs.create(InodeType::File).unwrap();
        let b = fs.open(a.sector()).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn remove_erases_sectors_on_last_close() {
        let fs = fs(64);
        let inode = fs.create(InodeType::File).unwrap();
        let sector = inode.sector();
        inode.write_at(&[1u8; 512], 0).unwrap();
        inode.mark_removed();
        inode.close();
        // sector is free again
        let reused = fs.create(InodeType::File).unwrap();
        assert_eq!(reused.sector(), sector);
    }

    #[test]
    fn scenario_6_concurrent_disjoint_writes() {
        use std::thread;
        let fs = fs(1024);
        let inode = Arc::new(fs.create(InodeType::File).unwrap());
        let a = inode.clone();
        let b = inode.clone();
        let t1 = thread::spawn(move || a.write_at(&vec![b'a'; 50_000], 0).unwrap());
        let t2 = thread::spawn(move || b.write_at(&vec![b'b'; 50_000], 50_000).unwrap());
        t1.join().unwrap();
        t2.join().unwrap();
        assert_eq!(inode.length(), 100_000);
        let mut buf = vec![0u8; 100_000];
        inode.read_at(&mut buf, 0).unwrap();
        assert!(buf[..50_000].iter().all(|&b| b == b'a'));
        assert!(buf[50_000..].iter().all(|&b| b == b'b'));
    }
}
