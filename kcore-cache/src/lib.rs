//! # Block cache
//!
//! A fixed-size, sector-indexed buffer pool serving all filesystem and swap
//! reads/writes. Every buffer has its own reader/writer lock (built from
//! explicit counters rather than a library rwlock, because the fairness
//! policy — new readers defer to a *waiting* writer, not just a *holding*
//! one — isn't something a generic `RwLock` exposes) plus a separate data
//! lock that serializes the one disk read needed to populate it.
//!
//! This is the lowest layer in the storage/VM core: the inode layer and the
//! swap manager both go through [`BufferCache::lock`] for every sector they
//! touch, and never see a disk device directly.
use kcore::sync::{ConditionVariable, Mutex, MutexGuard};
use kcore::{fatal, BlockDevice, CacheConfig, Sector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Whether a caller wants shared (read-only) or exclusive (read-write)
/// access to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Per-entry counters, protected by [`Buffer::state`] (the "entry lock").
struct EntryState {
    sector: Sector,
    read_cnt: u32,
    write_cnt: u32,
    read_wait_cnt: u32,
    write_wait_cnt: u32,
    up_to_date: bool,
    dirty: bool,
}

impl EntryState {
    fn free() -> Self {
        Self {
            sector: Sector::INVALID,
            read_cnt: 0,
            write_cnt: 0,
            read_wait_cnt: 0,
            write_wait_cnt: 0,
            up_to_date: false,
            dirty: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.read_cnt == 0 && self.write_cnt == 0 && self.read_wait_cnt == 0 && self.write_wait_cnt == 0
    }
}

struct Buffer {
    state: Mutex<EntryState>,
    /// Readers wait here while a writer holds or is waiting.
    no_writers: ConditionVariable,
    /// Writers wait here while anyone holds or is waiting.
    no_need: ConditionVariable,
    /// Serializes the actual disk read that populates the buffer, so two
    /// concurrent readers of a not-yet-loaded buffer don't both issue I/O.
    data_lock: Mutex<()>,
    payload: Mutex<[u8; 512]>,
}

impl Buffer {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::free()),
            no_writers: ConditionVariable::new(),
            no_need: ConditionVariable::new(),
            data_lock: Mutex::new(()),
            payload: Mutex::new([0u8; 512]),
        }
    }

    fn acquire(&self, mode: LockMode) {
        let mut g = self.state.lock();
        match mode {
            LockMode::Shared => {
                if g.write_cnt > 0 || g.write_wait_cnt > 0 {
                    g.read_wait_cnt += 1;
                    g = self.no_writers.wait_while(g, |s| s.write_cnt > 0);
                    g.read_wait_cnt -= 1;
                }
                g.read_cnt += 1;
            }
            LockMode::Exclusive => {
                if g.read_cnt > 0 || g.write_cnt > 0 {
                    g.write_wait_cnt += 1;
                    g = self
                        .no_need
                        .wait_while(g, |s| s.read_cnt > 0 || s.write_cnt > 0);
                    g.write_wait_cnt -= 1;
                }
                g.write_cnt = 1;
            }
        }
    }

    fn release(&self, mode: LockMode) {
        let mut g = self.state.lock();
        match mode {
            LockMode::Shared => {
                g.read_cnt -= 1;
                if g.read_cnt == 0 {
                    self.no_need.signal(g);
                }
            }
            LockMode::Exclusive => {
                g.write_cnt = 0;
                if g.read_wait_cnt > 0 {
                    self.no_writers.broadcast(g);
                } else {
                    self.no_need.signal(g);
                }
            }
        }
    }

    /// Non-blocking attempt to seize this buffer exclusively. Used by the
    /// clock sweep, which only wants buffers with zero holders and waiters.
    fn try_seize_idle(&self) -> bool {
        let mut g = self.state.lock();
        if g.is_idle() {
            g.write_cnt = 1;
            true
        } else {
            false
        }
    }
}

/// A locked buffer, returned by [`BufferCache::lock`]. Must be released with
/// [`CacheHandle::unlock`].
pub struct CacheHandle<'a, D: BlockDevice> {
    cache: &'a BufferCache<D>,
    idx: usize,
    mode: LockMode,
    unlocked: bool,
}

impl<'a, D: BlockDevice> CacheHandle<'a, D> {
    fn buf(&self) -> &'a Buffer {
        &self.cache.entries[self.idx]
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn sector(&self) -> Sector {
        self.buf().state.lock().sector
    }

    /// Reads the buffer's payload, lazily fetching from disk on first touch.
    pub fn read(&self) -> [u8; 512] {
        let buf = self.buf();
        let _d = buf.data_lock.lock();
        let needs_load = !buf.state.lock().up_to_date;
        if needs_load {
            let sector = buf.state.lock().sector;
            let mut tmp = [0u8; 512];
            if let Err(e) = self.cache.device.read(sector, &mut tmp) {
                fatal!("block cache: disk read of {sector} failed: {e}");
            }
            *buf.payload.lock() = tmp;
            buf.state.lock().up_to_date = true;
            trace!(%sector, "cache miss: loaded from disk");
        }
        *buf.payload.lock()
    }

    /// Zeroes the buffer and marks it up-to-date and dirty, for freshly
    /// allocated sectors that don't need a disk read first.
    pub fn set_zero(&self) {
        debug_assert_eq!(self.mode, LockMode::Exclusive, "set_zero requires EX lock");
        let buf = self.buf();
        *buf.payload.lock() = [0u8; 512];
        let mut g = buf.state.lock();
        g.up_to_date = true;
        g.dirty = true;
    }

    /// Overwrites the buffer contents and marks it dirty.
    pub fn write(&self, data: &[u8; 512]) {
        debug_assert_eq!(self.mode, LockMode::Exclusive, "write requires EX lock");
        let buf = self.buf();
        *buf.payload.lock() = *data;
        let mut g = buf.state.lock();
        g.up_to_date = true;
        g.dirty = true;
    }

    /// Marks the buffer dirty without changing its contents (used after an
    /// in-place mutation made through [`CacheHandle::read`]'s returned copy
    /// followed by a partial [`CacheHandle::write`]).
    pub fn mark_dirty(&self) {
        debug_assert_eq!(self.mode, LockMode::Exclusive, "mark_dirty requires EX lock");
        self.buf().state.lock().dirty = true;
    }

    pub fn unlock(mut self) {
        self.cache.entries[self.idx].release(self.mode);
        self.unlocked = true;
    }
}

impl<D: BlockDevice> Drop for CacheHandle<'_, D> {
    fn drop(&mut self) {
        if !self.unlocked {
            self.cache.entries[self.idx].release(self.mode);
        }
    }
}

enum EvictOutcome {
    /// Freed entry `idx`, ready to be rebound to a new sector.
    Bound(usize),
    /// A racing waiter grabbed this candidate first; retry from scratch.
    Retry,
    /// A whole revolution found no victim; back off and retry.
    Backoff,
}

/// The fixed-size sector cache itself.
pub struct BufferCache<D: BlockDevice> {
    device: D,
    entries: Vec<Buffer>,
    /// Global lock serializing the "does this sector already have an entry /
    /// is there a free entry" scan. Always released before blocking on a
    /// per-entry lock, and never held across disk I/O.
    cache_sync: Mutex<()>,
    clock_hand: AtomicUsize,
    config: CacheConfig,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(device: D, config: CacheConfig) -> Self {
        let entries = (0..config.capacity).map(|_| Buffer::new()).collect();
        Self {
            device,
            entries,
            cache_sync: Mutex::new(()),
            clock_hand: AtomicUsize::new(0),
            config,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn find_sector(&self, sector: Sector) -> Option<usize> {
        self.entries
            .iter()
            .position(|b| b.state.lock().sector == sector)
    }

    fn find_free(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|b| b.state.lock().sector.is_invalid())
    }

    /// Runs one clock sweep looking for an evictable buffer, writes it back
    /// if dirty, and rebinds it to `wanted` — unless new waiters showed up on
    /// the candidate while we were writing it back, in which case we hand it
    /// to them and ask the caller to retry from scratch.
    ///
    /// Takes `cache_sync` already held by the caller and keeps it held across
    /// the sweep-and-seize: two callers both missing `wanted` must not be
    /// able to seize two different idle buffers and bind both to it, which
    /// would put `wanted` in two cache buffers at once (§4.1, invariant 3).
    /// `cache_sync` is released for the victim's writeback I/O and
    /// re-acquired only to re-check for a racing winner before committing
    /// the rebind.
    fn evict_one(&self, wanted: Sector, sync: MutexGuard<'_, ()>) -> EvictOutcome {
        let n = self.entries.len();
        for _ in 0..n {
            let idx = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
            let buf = &self.entries[idx];
            if !buf.try_seize_idle() {
                continue;
            }
            // Seized while idle, still under cache_sync. Release it before
            // the (possibly slow) writeback.
            drop(sync);
            let (sector, dirty) = {
                let g = buf.state.lock();
                (g.sector, g.dirty)
            };
            if dirty {
                let data = *buf.payload.lock();
                if let Err(e) = self.device.write(sector, &data) {
                    fatal!("block cache: writeback of {sector} failed: {e}");
                }
                debug!(%sector, "evicted dirty buffer written back");
            }
            let resync = self.cache_sync.lock();
            {
                let mut g = buf.state.lock();
                if g.read_wait_cnt > 0 || g.write_wait_cnt > 0 {
                    // Someone queued up while we wrote back; hand the buffer
                    // to them instead of unbinding it out from under them.
                    g.write_cnt = 0;
                    if g.read_wait_cnt > 0 {
                        buf.no_writers.broadcast(g);
                    } else {
                        buf.no_need.signal(g);
                    }
                    drop(resync);
                    return EvictOutcome::Retry;
                }
            }
            // Re-check for a racing evictor that bound `wanted` to a
            // different buffer while cache_sync was released for our
            // writeback. If so, free this buffer back up and retry.
            if self.find_sector(wanted).is_some() {
                let mut g = buf.state.lock();
                g.sector = Sector::INVALID;
                g.up_to_date = false;
                g.dirty = false;
                g.write_cnt = 0;
                buf.no_need.signal(g);
                drop(resync);
                return EvictOutcome::Retry;
            }
            let mut g = buf.state.lock();
            g.sector = wanted;
            g.up_to_date = false;
            g.dirty = false;
            // Keep EX held — the caller (lock()) already has write_cnt=1 on
            // this entry and will downgrade/release per the requested mode.
            g.write_cnt = 0;
            drop(g);
            drop(resync);
            return EvictOutcome::Bound(idx);
        }
        EvictOutcome::Backoff
    }

    /// Returns a buffer holding `sector`, locked in `mode`. Never returns
    /// with a weaker lock than requested.
    pub fn lock(&self, sector: Sector, mode: LockMode) -> CacheHandle<'_, D> {
        loop {
            let idx = {
                let sync = self.cache_sync.lock();
                if let Some(i) = self.find_sector(sector) {
                    i
                } else if let Some(i) = self.find_free() {
                    let mut g = self.entries[i].state.lock();
                    // Claim it provisionally so a concurrent scan under
                    // cache_sync doesn't also claim it as free.
                    g.sector = sector;
                    i
                } else {
                    // evict_one takes cache_sync with it and is responsible
                    // for releasing it at the right point (see its doc).
                    match self.evict_one(sector, sync) {
                        EvictOutcome::Bound(i) => i,
                        EvictOutcome::Retry => continue,
                        EvictOutcome::Backoff => {
                            warn!("block cache: full revolution found no victim, backing off");
                            std::thread::sleep(self.config.eviction_backoff);
                            continue;
                        }
                    }
                }
            };
            self.entries[idx].acquire(mode);
            // The sector may have been rebound out from under a provisional
            // claim only by eviction, which already matches `sector`; a
            // plain find_sector hit is already correct. Re-check to be safe
            // against the rare race where two threads both provisionally
            // claimed before either acquired rights.
            if self.entries[idx].state.lock().sector != sector {
                self.entries[idx].release(mode);
                continue;
            }
            return CacheHandle {
                cache: self,
                idx,
                mode,
                unlocked: false,
            };
        }
    }

    /// Releases the binding for `sector` if no one holds or waits on it.
    /// Returns whether it was freed.
    pub fn free(&self, sector: Sector) -> bool {
        let _sync = self.cache_sync.lock();
        let Some(idx) = self.find_sector(sector) else {
            return true;
        };
        let mut g = self.entries[idx].state.lock();
        if g.is_idle() {
            g.sector = Sector::INVALID;
            g.up_to_date = false;
            g.dirty = false;
            true
        } else {
            false
        }
    }

    /// Writes every dirty, up-to-date buffer back to disk.
    pub fn flush(&self) {
        for buf in &self.entries {
            let (sector, dirty, up_to_date) = {
                let g = buf.state.lock();
                (g.sector, g.dirty, g.up_to_date)
            };
            if sector.is_invalid() || !dirty || !up_to_date {
                continue;
            }
            if !buf.try_seize_idle() {
                continue;
            }
            let data = *buf.payload.lock();
            if let Err(e) = self.device.write(sector, &data) {
                fatal!("block cache: flush of {sector} failed: {e}");
            }
            let mut g = buf.state.lock();
            g.dirty = false;
            g.write_cnt = 0;
            // Mirror release(Exclusive): a reader that queued up during the
            // brief seize is parked on no_writers, not no_need, and must be
            // woken the same way or it sleeps until an unrelated writer
            // broadcasts.
            if g.read_wait_cnt > 0 {
                buf.no_writers.broadcast(g);
            } else {
                buf.no_need.signal(g);
            }
        }
    }
}

impl<D: BlockDevice + 'static> BufferCache<D> {
    /// Spawns a background thread that calls [`BufferCache::flush`]
    /// periodically. Opt-in, per §9's resolution of the background-daemon
    /// open question: never started implicitly by [`BufferCache::new`].
    pub fn spawn_flush_daemon(
        self: std::sync::Arc<Self>,
        interval: Duration,
    ) -> FlushDaemonHandle {
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = stop.clone();
        let cache = self.clone();
        let join = std::thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                cache.flush();
            }
        });
        FlushDaemonHandle {
            stop,
            join: Some(join),
        }
    }
}

/// Handle to the background flush thread; stops and joins it on drop.
pub struct FlushDaemonHandle {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Drop for FlushDaemonHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcore_testkit::MemBlockDevice;
    use std::sync::Arc;

    fn cache(capacity: usize, dev_sectors: u32) -> BufferCache<MemBlockDevice> {
        BufferCache::new(
            MemBlockDevice::new(dev_sectors),
            CacheConfig {
                capacity,
                eviction_backoff: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn invariant_dirty_implies_up_to_date() {
        let c = cache(4, 16);
        let h = c.lock(Sector(0), LockMode::Exclusive);
        h.set_zero();
        assert!(h.read() == [0u8; 512]);
        h.unlock();
    }

    #[test]
    fn write_then_read_round_trips() {
        let c = cache(4, 16);
        let mut data = [0u8; 512];
        data[0] = 42;
        let h = c.lock(Sector(1), LockMode::Exclusive);
        h.write(&data);
        h.unlock();

        let h = c.lock(Sector(1), LockMode::Shared);
        assert_eq!(h.read(), data);
        h.unlock();
    }

    #[test]
    fn eviction_writes_back_dirty_buffer() {
        let c = cache(1, 16);
        let mut data = [0u8; 512];
        data[10] = 7;
        let h = c.lock(Sector(0), LockMode::Exclusive);
        h.write(&data);
        h.unlock();

        // Only one slot: locking a different sector forces eviction of
        // sector 0, which must be written back since it was dirty.
        let h2 = c.lock(Sector(1), LockMode::Exclusive);
        h2.set_zero();
        h2.unlock();

        let mut out = [0u8; 512];
        c.device().read(Sector(0), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn at_most_one_buffer_per_sector() {
        let c = Arc::new(cache(8, 16));
        let mut handles = vec![];
        for _ in 0..8 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                let h = c.lock(Sector(5), LockMode::Shared);
                h.read();
                h.unlock();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let matches = c
            .entries
            .iter()
            .filter(|b| b.state.lock().sector == Sector(5))
            .count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn readers_do_not_starve_a_waiting_writer_indefinitely() {
        let c = Arc::new(cache(4, 16));
        let h = c.lock(Sector(0), LockMode::Shared);
        let c2 = c.clone();
        let writer = std::thread::spawn(move || {
            let h = c2.lock(Sector(0), LockMode::Exclusive);
            h.write(&[9u8; 512]);
            h.unlock();
        });
        std::thread::sleep(Duration::from_millis(20));
        h.unlock();
        writer.join().unwrap();
        let h = c.lock(Sector(0), LockMode::Shared);
        assert_eq!(h.read(), [9u8; 512]);
        h.unlock();
    }

    #[test]
    fn free_releases_unheld_binding() {
        let c = cache(2, 16);
        let h = c.lock(Sector(0), LockMode::Exclusive);
        h.set_zero();
        h.unlock();
        assert!(c.free(Sector(0)));
        assert!(c.entries[0].state.lock().sector.is_invalid() || c.find_sector(Sector(0)).is_none());
    }

    #[test]
    fn flush_clears_dirty_bits() {
        let c = cache(2, 16);
        let h = c.lock(Sector(0), LockMode::Exclusive);
        h.write(&[1u8; 512]);
        h.unlock();
        c.flush();
        assert!(!c.entries[0].state.lock().dirty);
    }
}
