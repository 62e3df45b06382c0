//! One buffer-pool instance: descriptor arena, frame pool, page hash, LRU,
//! buddy allocator and flush list bundled behind the pool's lock
//! discipline.
//!
//! Locks, coarse to fine: the structural mutex (`core`) guards LRU/free/
//! buddy membership; the flush mutex guards flush-list membership and the
//! hazard slot; per-bucket hash latches guard identity; per-page content
//! latches guard bytes. A thread never holds more than one of the two big
//! mutexes across anything slower than pointer fixups, and never acquires
//! the structural mutex while holding an unrelated page's content latch.

use parking_lot::{Condvar, Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use crate::flush::{self, workers::FlushWorkers, FlushClass, FlushList, FlushOutcome};
use crate::io::{IoCommand, IoKind, IoPool, IoStatus, PageCodec, PageSource};
use crate::page_id::PageId;

pub mod buddy;
pub mod descriptor;
pub mod frames;
pub mod hash;
pub mod list;
pub mod lru;
pub mod stats;

use buddy::Buddy;
use descriptor::{IoFix, PageDescriptor, PageState, Registry, ZipBlock};
use frames::{FramePool, FrameRef};
use hash::PageHash;
use lru::LruCache;
use stats::Stats;

/// Tuning knobs for one instance. Assembled by [`crate::Options`].
pub(crate) struct PoolConfig {
    pub frame_size: usize,
    pub pool_frames: usize,
    pub old_ratio: u32,
    pub old_tolerance: usize,
    pub old_min_len: usize,
    /// Bounded LRU tail scan on the first eviction attempt.
    pub scan_threshold: usize,
    /// Max pages examined per LRU flush batch.
    pub lru_scan_depth: usize,
    pub neighbor_flushing: bool,
    pub read_ahead: bool,
    pub random_read_ahead: bool,
    pub read_ahead_area: u32,
    /// Sequential-access strictness for linear read-ahead, out of 64.
    pub linear_threshold: u32,
    pub io_to_unzip_factor: u64,
    /// Background flush is signaled when the free list drops below this.
    pub free_low_water: usize,
    /// Pages per starvation-triggered LRU flush batch.
    pub lru_flush_min: usize,
    pub buddy_skip_threshold: usize,
}

/// Structural state: everything the structural mutex guards.
pub(crate) struct PoolCore {
    pub lru: LruCache,
    pub free_frames: Vec<FrameRef>,
    pub buddy: Buddy,
}

/// How a fetch should behave on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Read the page from disk if absent.
    Normal,
    /// Only return the page if it is already resident.
    PeekIfResident,
    /// The caller will overwrite the whole page: allocate a zeroed frame
    /// without reading.
    AllocateForWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    /// Peek miss: the page is not resident.
    NotResident,
    /// The read failed validation or the space vanished; the page was
    /// force-evicted.
    Io { id: PageId, status: IoStatus },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::NotResident => write!(f, "page not resident"),
            FetchError::Io { id, status } => write!(f, "read of page {id} failed: {status:?}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Free-frame acquisition flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetFreeMode {
    /// Block (evicting, flushing, waiting) until a frame is available.
    Block,
    /// One eviction attempt, then `None`. Used by read-ahead, which must
    /// never stall a foreground request for speculative pages.
    Soft,
}

/// Result of publishing a new page in the pool.
pub(crate) enum Install {
    Installed(Arc<PageDescriptor>),
    /// Another thread installed this identity first.
    Raced,
    /// No frame (or compressed block) could be produced without blocking.
    NoMemory,
}

// Starvation diagnostics cadence for blocked free-frame waiters.
const FREE_WAIT_STEP: Duration = Duration::from_millis(50);
const FREE_WAIT_WARN_ROUNDS: u32 = 40;
const FREE_WAIT_FATAL_ROUNDS: u32 = 4000;

pub struct PoolInstance {
    pub(crate) index: usize,
    pub(crate) config: Arc<PoolConfig>,
    pub(crate) registry: Registry,
    pub(crate) hash: PageHash,
    pub(crate) frames: FramePool,
    pub(crate) core: Mutex<PoolCore>,
    pub(crate) flush: Mutex<FlushList>,
    flush_active: [AtomicBool; 2],
    pub(crate) stats: Stats,
    pub(crate) source: Arc<dyn PageSource>,
    pub(crate) codec: Arc<dyn PageCodec>,
    pub(crate) io: Arc<IoPool>,
    pub(crate) staging: Option<flush::staging::StagingBuffer>,

    /// Set once the worker pool exists; free-frame starvation pokes it.
    pub(crate) workers: Mutex<Weak<FlushWorkers>>,
    /// Shared handle whose completions the background completer thread
    /// drains; read-ahead submits on it. Set at pool wiring time.
    pub(crate) bg_io: Mutex<Option<crate::io::IoHandle>>,

    access_clock: AtomicU64,
    pub(crate) pending_reads: AtomicUsize,

    free_wait_mu: Mutex<()>,
    free_wait: Condvar,
    read_wait_mu: Mutex<()>,
    read_wait: Condvar,
    flush_wait_mu: Mutex<()>,
    flush_wait: Condvar,
}

impl PoolInstance {
    pub(crate) fn new(
        index: usize,
        config: Arc<PoolConfig>,
        source: Arc<dyn PageSource>,
        codec: Arc<dyn PageCodec>,
        io: Arc<IoPool>,
        staging: Option<flush::staging::StagingBuffer>,
    ) -> Arc<PoolInstance> {
        let frames = FramePool::new(config.frame_size, config.pool_frames);
        let core = PoolCore {
            lru: LruCache::new(config.old_ratio, config.old_tolerance, config.old_min_len),
            free_frames: Vec::new(),
            buddy: Buddy::new(frames.clone(), config.buddy_skip_threshold),
        };
        Arc::new(PoolInstance {
            index,
            hash: PageHash::new(config.pool_frames * 2),
            registry: Registry::new(),
            frames,
            core: Mutex::new(core),
            flush: Mutex::new(FlushList::new()),
            flush_active: [AtomicBool::new(false), AtomicBool::new(false)],
            stats: Stats::new(),
            source,
            codec,
            io,
            staging,
            workers: Mutex::new(Weak::new()),
            bg_io: Mutex::new(None),
            access_clock: AtomicU64::new(1),
            pending_reads: AtomicUsize::new(0),
            free_wait_mu: Mutex::new(()),
            free_wait: Condvar::new(),
            read_wait_mu: Mutex::new(()),
            read_wait: Condvar::new(),
            flush_wait_mu: Mutex::new(()),
            flush_wait: Condvar::new(),
            config,
        })
    }

    // ---- fetch paths -----------------------------------------------------

    pub fn fetch(
        self: &Arc<Self>,
        id: PageId,
        mode: FetchMode,
    ) -> Result<PageHandle, FetchError> {
        loop {
            // fast path: lookup and pin under the bucket read latch, which
            // excludes concurrent eviction of this identity.
            let hit = {
                let bucket = self.hash.read_bucket(&id);
                match bucket.get(&id).and_then(|r| self.registry.get(r)) {
                    Some(desc) => {
                        desc.pin();
                        Some(desc)
                    }
                    None => None,
                }
            };

            if let Some(desc) = hit {
                match self.wait_page_usable(&desc) {
                    Ok(()) => {}
                    Err(err) => {
                        desc.unpin();
                        self.notify_free_waiters();
                        match err {
                            // mid-removal or identity changed: start over.
                            None => continue,
                            Some(status) => return Err(FetchError::Io { id, status }),
                        }
                    }
                }
                // the descriptor is Resident and pinned.
                if desc.frame().is_none() {
                    if let Err(err) = self.unzip_in_place(&desc) {
                        desc.unpin();
                        self.evict_corrupt(&desc);
                        return Err(err);
                    }
                }
                self.note_access(&desc);
                if mode == FetchMode::Normal {
                    crate::readahead::maybe_linear(self, id);
                }
                return Ok(PageHandle {
                    pool: self.clone(),
                    desc,
                });
            }

            match mode {
                FetchMode::PeekIfResident => return Err(FetchError::NotResident),
                FetchMode::AllocateForWrite => match self.create_page(id)? {
                    Some(handle) => return Ok(handle),
                    // lost an install race: the page is resident now.
                    None => continue,
                },
                FetchMode::Normal => {
                    if self.config.random_read_ahead {
                        crate::readahead::maybe_random(self, id);
                    }
                    match self.read_page_in(id)? {
                        Some(handle) => {
                            crate::readahead::maybe_linear(self, id);
                            return Ok(handle);
                        }
                        // lost an install race; retry as a hit.
                        None => continue,
                    }
                }
            }
        }
    }

    /// Wait out a read in progress. `Err(None)` = retry the whole fetch,
    /// `Err(Some(status))` = the read failed and the failure belongs to us.
    fn wait_page_usable(&self, desc: &Arc<PageDescriptor>) -> Result<(), Option<IoStatus>> {
        loop {
            match desc.state() {
                PageState::Resident => return Ok(()),
                PageState::ReadInProgress | PageState::Memory => {
                    let mut guard = self.read_wait_mu.lock();
                    // re-check with the lock held so a completion between
                    // the check and the wait cannot be missed.
                    if desc.state() == PageState::Resident {
                        return Ok(());
                    }
                    if matches!(
                        desc.state(),
                        PageState::ReadInProgress | PageState::Memory
                    ) {
                        self.read_wait
                            .wait_for(&mut guard, Duration::from_millis(20));
                    }
                }
                PageState::CorruptEvicted => return Err(Some(IoStatus::Corrupted)),
                PageState::NotUsed | PageState::BeingRemoved => return Err(None),
            }
        }
    }

    /// Install a descriptor and read the page in, synchronously. `Ok(None)`
    /// means another thread installed the page first.
    fn read_page_in(self: &Arc<Self>, id: PageId) -> Result<Option<PageHandle>, FetchError> {
        let desc = match self.install_page(id, PageState::ReadInProgress, GetFreeMode::Block) {
            Install::Installed(desc) => desc,
            Install::Raced => return Ok(None),
            Install::NoMemory => {
                return Err(FetchError::Io {
                    id,
                    status: IoStatus::ShortRead,
                })
            }
        };

        let read_len = self
            .source
            .zip_size(id.space)
            .unwrap_or(self.config.frame_size);
        self.pending_reads.fetch_add(1, Ordering::Relaxed);
        let handle = self.io.make_handle();
        // unwrap: the io pool outlives the instances.
        handle
            .send(IoCommand {
                kind: IoKind::Read(id, vec![0u8; read_len]),
                user_data: 0,
            })
            .unwrap();
        let complete = handle.recv().unwrap();
        self.pending_reads.fetch_sub(1, Ordering::Relaxed);

        let buf = complete.command.kind.into_buf();
        match self.complete_read(&desc, buf, complete.status) {
            Ok(()) => {
                self.note_access(&desc);
                Ok(Some(PageHandle {
                    pool: self.clone(),
                    desc,
                }))
            }
            Err(status) => {
                // surface the failure to this requester; concurrent
                // waiters see CorruptEvicted and get the same error.
                desc.unpin();
                self.evict_corrupt(&desc);
                Err(FetchError::Io { id, status })
            }
        }
    }

    /// Allocate-for-write: install a zeroed Resident page without a read.
    /// `Ok(None)` means another thread installed the identity first.
    fn create_page(self: &Arc<Self>, id: PageId) -> Result<Option<PageHandle>, FetchError> {
        let desc = match self.install_page(id, PageState::Resident, GetFreeMode::Block) {
            Install::Installed(desc) => desc,
            Install::Raced => return Ok(None),
            Install::NoMemory => {
                return Err(FetchError::Io {
                    id,
                    status: IoStatus::ShortRead,
                })
            }
        };
        self.stats.pages_created.fetch_add(1, Ordering::Relaxed);
        self.note_access(&desc);
        Ok(Some(PageHandle {
            pool: self.clone(),
            desc,
        }))
    }

    /// Shared install path: allocate storage, create the descriptor, and
    /// publish it in hash + LRU. On success the descriptor is pinned, in
    /// `state`, with io-fix `Read` when a read will follow.
    pub(crate) fn install_page(
        self: &Arc<Self>,
        id: PageId,
        state: PageState,
        free_mode: GetFreeMode,
    ) -> Install {
        let zip_size = self.source.zip_size(id.space);
        let Some(frame) = self.get_free_frame(free_mode) else {
            return Install::NoMemory;
        };
        let zip_block = match zip_size {
            Some(zip) => {
                // a zip size beyond the frame size cannot be cached; fail
                // the request cleanly rather than crash.
                let class = {
                    let core = self.core.lock();
                    core.buddy.class_for_size(zip)
                };
                let Some(class) = class else {
                    self.core.lock().free_frames.push(frame);
                    return Install::NoMemory;
                };
                match self.get_zip_block(class, free_mode) {
                    Some(block) => Some(block),
                    None => {
                        self.core.lock().free_frames.push(frame);
                        return Install::NoMemory;
                    }
                }
            }
            None => None,
        };

        let desc = self.registry.insert(id, zip_size);
        desc.set_frame(Some(frame));
        desc.set_state(state);

        // publish under the bucket write latch; losing the race undoes
        // every allocation.
        {
            let mut bucket = self.hash.lock_bucket(&id);
            if bucket.get(&id).is_some() {
                drop(bucket);
                self.registry.remove(desc.page_ref());
                let mut core = self.core.lock();
                core.free_frames.push(frame);
                if let Some(block) = zip_block {
                    if let Some(recombined) = core.buddy.free(block) {
                        core.free_frames.push(recombined);
                    }
                }
                return Install::Raced;
            }
            desc.pin();
            if state == PageState::ReadInProgress {
                desc.set_io_fix(IoFix::Read);
            }
            bucket.insert(id, desc.page_ref());
        }

        {
            let mut core = self.core.lock();
            if let Some(block) = zip_block {
                desc.set_zip_block(Some(block));
                core.buddy.set_owner(block, desc.page_ref());
            }
            // freshly loaded pages enter at the midpoint; created pages go
            // young, they are about to be written.
            let old = state == PageState::ReadInProgress;
            core.lru.insert(&desc, old, &self.registry);
        }
        Install::Installed(desc)
    }

    /// Apply a read completion to a descriptor: validate, decompress, and
    /// make the page resident, or push it onto the corrupt path.
    pub(crate) fn complete_read(
        &self,
        desc: &Arc<PageDescriptor>,
        buf: Vec<u8>,
        status: IoStatus,
    ) -> Result<(), IoStatus> {
        let result = if status != IoStatus::Ok {
            Err(status)
        } else if !self.codec.validate(&buf) {
            Err(IoStatus::Corrupted)
        } else {
            let _latch = desc.latch.write();
            // unwrap: installed pages always carry a frame until evicted.
            let frame = desc.frame().unwrap();
            // SAFETY: the write latch is held and the page is io-fixed, so
            // nothing else touches these bytes; the pool outlives us.
            let frame_bytes = unsafe { self.frames.frame_slice_mut(frame) };
            match desc.zip_block() {
                Some(block) => {
                    let ok = {
                        let zip_len = desc.zip_size().unwrap();
                        let zip_bytes = unsafe { self.zip_slice_mut(block, zip_len) };
                        zip_bytes.copy_from_slice(&buf);
                        self.codec.decompress(zip_bytes, frame_bytes)
                    };
                    if ok {
                        self.stats.record_unzip();
                        Ok(())
                    } else {
                        Err(IoStatus::Corrupted)
                    }
                }
                None => {
                    frame_bytes.copy_from_slice(&buf);
                    Ok(())
                }
            }
        };

        match result {
            Ok(()) => {
                desc.set_state(PageState::Resident);
                desc.set_io_fix(IoFix::None);
                self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
                self.stats.record_io();
                self.notify_read_waiters();
                Ok(())
            }
            Err(status) => {
                desc.set_state(PageState::CorruptEvicted);
                desc.set_io_fix(IoFix::None);
                self.notify_read_waiters();
                Err(status)
            }
        }
    }

    /// Decompress a zip-only resident page back into a frame, putting it on
    /// the unzip list.
    fn unzip_in_place(&self, desc: &Arc<PageDescriptor>) -> Result<(), FetchError> {
        let _latch = desc.latch.write();
        if desc.frame().is_some() {
            // raced with another fetcher; their frame serves us both.
            return Ok(());
        }
        let id = desc.id();
        let frame = self
            .get_free_frame(GetFreeMode::Block)
            .ok_or(FetchError::Io {
                id,
                status: IoStatus::ShortRead,
            })?;
        // unwrap: a frameless resident page always holds its zip block.
        let block = desc.zip_block().unwrap();
        let zip_len = desc.zip_size().unwrap();
        let ok = {
            // SAFETY: write latch held; the zip block is owned by this
            // pinned descriptor.
            let zip_bytes = unsafe { self.zip_slice_mut(block, zip_len) };
            let frame_bytes = unsafe { self.frames.frame_slice_mut(frame) };
            self.codec.decompress(zip_bytes, frame_bytes)
        };
        if !ok {
            // the compressed copy rotted in memory; treat like a failed
            // read.
            self.core.lock().free_frames.push(frame);
            desc.set_state(PageState::CorruptEvicted);
            self.notify_read_waiters();
            return Err(FetchError::Io {
                id,
                status: IoStatus::Corrupted,
            });
        }
        desc.set_frame(Some(frame));
        self.stats.record_unzip();
        let mut core = self.core.lock();
        core.lru.unzip_insert(desc, desc.is_old());
        Ok(())
    }

    fn note_access(&self, desc: &Arc<PageDescriptor>) {
        let now = self.access_clock.fetch_add(1, Ordering::Relaxed);
        desc.touch(now);
        if desc.is_old() {
            let mut core = self.core.lock();
            // re-check under the structural mutex; eviction may have won.
            if core.lru.lru_list().contains(desc.slot()) && desc.is_old() {
                core.lru.make_young(desc, &self.registry, &self.stats);
            }
        }
    }

    // ---- free frame acquisition -----------------------------------------

    /// Produce a ready-to-use frame: free list first, then LRU eviction
    /// (bounded scan, then unbounded), then block on flush progress.
    pub(crate) fn get_free_frame(&self, mode: GetFreeMode) -> Option<FrameRef> {
        let mut rounds: u32 = 0;
        loop {
            {
                let mut core = self.core.lock();
                if let Some(frame) = self.take_free_frame_locked(&mut core) {
                    return Some(frame);
                }
                let scan_all = rounds > 0;
                if self.scan_and_free_locked(&mut core, scan_all) {
                    if let Some(frame) = self.take_free_frame_locked(&mut core) {
                        return Some(frame);
                    }
                }
            }
            if mode == GetFreeMode::Soft {
                return None;
            }

            // ask for background help, and past the first round do a small
            // synchronous LRU flush ourselves rather than just waiting.
            self.signal_background_flush();
            if rounds >= 1 {
                flush::flush_batch(
                    self,
                    FlushClass::Lru,
                    self.config.lru_flush_min,
                    u64::MAX,
                );
            }
            rounds += 1;
            if rounds % FREE_WAIT_WARN_ROUNDS == 0 {
                log::warn!(
                    "pool instance {}: no free frames after {} attempts \
                     ({} resident, {} dirty)",
                    self.index,
                    rounds,
                    self.hash.len(),
                    self.flush.lock().len(),
                );
            }
            if rounds >= FREE_WAIT_FATAL_ROUNDS {
                // the pool is structurally starved: nothing evictable and
                // flushing cannot make progress. Continuing would silently
                // break every caller's progress assumption.
                panic!(
                    "pool instance {} starved: no evictable page after {} rounds",
                    self.index, rounds
                );
            }
            let mut guard = self.free_wait_mu.lock();
            self.free_wait.wait_for(&mut guard, FREE_WAIT_STEP);
        }
    }

    fn take_free_frame_locked(&self, core: &mut PoolCore) -> Option<FrameRef> {
        if let Some(frame) = core.free_frames.pop() {
            if core.free_frames.len() < self.config.free_low_water {
                self.signal_background_flush();
            }
            return Some(frame);
        }
        // the frame pool may still have never-carved budget.
        self.frames.alloc_zeroed()
    }

    /// Allocate a compressed block, applying the same pressure protocol as
    /// frame acquisition.
    fn get_zip_block(&self, class: u8, mode: GetFreeMode) -> Option<ZipBlock> {
        let mut rounds: u32 = 0;
        loop {
            {
                let mut core = self.core.lock();
                loop {
                    let PoolCore {
                        buddy, free_frames, ..
                    } = &mut *core;
                    let pool = &self.frames;
                    if let Some(block) =
                        buddy.allocate(class, || free_frames.pop().or_else(|| pool.alloc_zeroed()))
                    {
                        return Some(block);
                    }
                    if !self.scan_and_free_locked(&mut core, rounds > 0) {
                        break;
                    }
                }
            }
            if mode == GetFreeMode::Soft {
                return None;
            }
            self.signal_background_flush();
            if rounds >= 1 {
                flush::flush_batch(
                    self,
                    FlushClass::Lru,
                    self.config.lru_flush_min,
                    u64::MAX,
                );
            }
            rounds += 1;
            if rounds >= FREE_WAIT_FATAL_ROUNDS {
                panic!(
                    "pool instance {} starved allocating a compressed block",
                    self.index
                );
            }
            let mut guard = self.free_wait_mu.lock();
            self.free_wait.wait_for(&mut guard, FREE_WAIT_STEP);
        }
    }

    /// Try to free one replaceable page, preferring the unzip list when the
    /// workload is I/O bound.
    fn scan_and_free_locked(&self, core: &mut PoolCore, scan_all: bool) -> bool {
        if core
            .lru
            .should_evict_from_unzip(&self.stats, self.config.io_to_unzip_factor)
            && self.free_from_list_locked(core, scan_all, true)
        {
            return true;
        }
        self.free_from_list_locked(core, scan_all, false)
    }

    fn free_from_list_locked(&self, core: &mut PoolCore, scan_all: bool, unzip: bool) -> bool {
        let mut scanned = 0;
        let mut cur = if unzip {
            core.lru.unzip_list().tail()
        } else {
            core.lru.lru_list().tail()
        };
        while let Some(slot) = cur {
            if !scan_all && scanned >= self.config.scan_threshold {
                return false;
            }
            scanned += 1;
            let next = if unzip {
                core.lru.unzip_list().prev(slot)
            } else {
                core.lru.lru_list().prev(slot)
            };
            if let Some(desc) = self.registry.get_slot(slot) {
                if desc.ready_for_replace() {
                    let accessed = desc.is_accessed();
                    // an unzip eviction keeps the compressed copy resident.
                    if self.evict_locked(core, &desc, !unzip) {
                        if !unzip && !accessed {
                            // evicted without ever being read: wasted
                            // read-ahead.
                            self.stats
                                .readahead_pages_evicted
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        return true;
                    }
                }
            }
            cur = next;
        }
        false
    }

    // ---- eviction --------------------------------------------------------

    /// Public entry: evict a page if it is replaceable right now.
    pub(crate) fn try_evict(&self, desc: &Arc<PageDescriptor>, also_free_compressed: bool) -> bool {
        let mut core = self.core.lock();
        self.evict_locked(&mut core, desc, also_free_compressed)
    }

    /// The compound eviction under the structural mutex. With
    /// `also_free_compressed` false and both copies present, only the
    /// uncompressed frame is detached and the page stays resident with its
    /// compressed bytes (the unzip_LRU eviction).
    fn evict_locked(
        &self,
        core: &mut PoolCore,
        desc: &Arc<PageDescriptor>,
        also_free_compressed: bool,
    ) -> bool {
        if !desc.ready_for_replace() {
            return false;
        }
        let id = desc.id();

        if !also_free_compressed && desc.belongs_to_unzip() {
            // identity survives; no hash manipulation needed, but the
            // bucket latch still fences concurrent fetchers pinning the
            // frame we are about to detach.
            let bucket = self.hash.lock_bucket(&id);
            if !desc.ready_for_replace() {
                return false;
            }
            // unwrap: belongs_to_unzip implies a frame.
            let frame = desc.frame().unwrap();
            desc.set_frame(None);
            drop(bucket);
            core.lru.unzip_remove(desc);
            core.free_frames.push(frame);
            self.stats.freed_page_clock.fetch_add(1, Ordering::Relaxed);
            self.notify_free_waiters();
            return true;
        }

        {
            let mut bucket = self.hash.lock_bucket(&id);
            // re-validate under the latch: a fetcher may have pinned since
            // the optimistic check.
            if !desc.ready_for_replace() {
                return false;
            }
            if !bucket.remove_if(&id, desc.page_ref()) {
                return false;
            }
            desc.set_state(PageState::BeingRemoved);
        }
        // latch released before the slow part: clearing storage.

        core.lru.remove(desc, &self.registry);
        if let Some(block) = desc.zip_block() {
            desc.set_zip_block(None);
            if let Some(recombined) = core.buddy.free(block) {
                core.free_frames.push(recombined);
            }
        }
        if let Some(frame) = desc.frame() {
            desc.set_frame(None);
            core.free_frames.push(frame);
        }
        desc.set_state(PageState::NotUsed);
        self.registry.remove(desc.page_ref());
        self.stats.pages_evicted.fetch_add(1, Ordering::Relaxed);
        self.stats.freed_page_clock.fetch_add(1, Ordering::Relaxed);
        self.notify_free_waiters();
        true
    }

    /// Forced removal of a corrupt page, waiting for pins to drain first.
    pub(crate) fn evict_corrupt(&self, desc: &Arc<PageDescriptor>) {
        let mut waits = 0u32;
        loop {
            if desc.fix_count() == 0 {
                let mut core = self.core.lock();
                // another failing path may have removed the page already.
                if self.registry.get(desc.page_ref()).is_none() {
                    return;
                }
                let id = desc.id();
                {
                    let mut bucket = self.hash.lock_bucket(&id);
                    if desc.fix_count() != 0 {
                        continue;
                    }
                    bucket.remove_if(&id, desc.page_ref());
                    desc.set_state(PageState::BeingRemoved);
                }
                // a corrupt page is never dirty: the failed read never
                // became visible to writers.
                debug_assert!(!desc.is_dirty());
                core.lru.remove(desc, &self.registry);
                if let Some(block) = desc.zip_block() {
                    desc.set_zip_block(None);
                    if let Some(recombined) = core.buddy.free(block) {
                        core.free_frames.push(recombined);
                    }
                }
                if let Some(frame) = desc.frame() {
                    desc.set_frame(None);
                    core.free_frames.push(frame);
                }
                desc.set_state(PageState::NotUsed);
                self.registry.remove(desc.page_ref());
                self.notify_free_waiters();
                return;
            }
            waits += 1;
            if waits % 100 == 0 {
                log::warn!(
                    "waiting for {} pins to drain from corrupt page {}",
                    desc.fix_count(),
                    desc.id()
                );
            }
            let mut guard = self.free_wait_mu.lock();
            self.free_wait.wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    // ---- dirtying and flushing ------------------------------------------

    /// Record a modification. The caller guarantees the redo record at
    /// `lsn` is durable before the page could ever be flushed — this
    /// component only records the ordering key it is given.
    pub(crate) fn mark_dirty(&self, desc: &Arc<PageDescriptor>, lsn: u64) {
        debug_assert!(desc.fix_count() > 0, "dirtying an unpinned page");
        debug_assert!(lsn > 0);
        let mut fl = self.flush.lock();
        if fl.contains(desc.slot()) {
            // already dirty: the oldest modification stands.
            return;
        }
        fl.insert(desc.slot(), lsn);
        desc.set_oldest_modification(lsn);
    }

    pub(crate) fn try_begin_batch(&self, class: FlushClass) -> bool {
        !self.flush_active[class as usize].swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_batch(&self, class: FlushClass) {
        self.flush_active[class as usize].store(false, Ordering::Release);
        self.notify_flush_waiters();
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flush_active.iter().any(|a| a.load(Ordering::Acquire))
    }

    /// Run a checkpoint-class flush on this instance.
    pub fn request_flush(&self, min_count: usize, lsn_limit: u64) -> FlushOutcome {
        flush::flush_batch(self, FlushClass::List, min_count, lsn_limit)
    }

    /// Snapshot the page image to be written for a flush. Caller holds the
    /// content latch (shared) and the write io-fix.
    pub(crate) fn page_image_for_write(&self, desc: &Arc<PageDescriptor>) -> Option<Vec<u8>> {
        match desc.zip_size() {
            None => {
                let frame = desc.frame()?;
                // SAFETY: io-fix + shared latch exclude writers; eviction is
                // excluded by the io-fix.
                Some(unsafe { self.frames.frame_slice(frame) }.to_vec())
            }
            Some(zip_len) => {
                let block = desc.zip_block()?;
                // SAFETY: as above; the zip block is owned by this page.
                let zip_bytes = unsafe { self.zip_slice_mut(block, zip_len) };
                if let Some(frame) = desc.frame() {
                    // refresh the compressed copy from the modified frame.
                    let frame_bytes = unsafe { self.frames.frame_slice(frame) };
                    if !self.codec.compress(frame_bytes, zip_bytes) {
                        log::error!(
                            "page {} no longer fits its {}-byte compressed block",
                            desc.id(),
                            zip_len
                        );
                        return None;
                    }
                }
                Some(zip_bytes.to_vec())
            }
        }
    }

    /// SAFETY: caller must hold whatever excludes concurrent access to the
    /// block's bytes (content latch of the owning page or io-fix).
    #[allow(clippy::mut_from_ref)]
    unsafe fn zip_slice_mut(&self, block: ZipBlock, len: usize) -> &mut [u8] {
        let ptr = self
            .frames
            .frame_ptr(block.frame)
            .add(block.offset as usize);
        std::slice::from_raw_parts_mut(ptr, len)
    }

    fn signal_background_flush(&self) {
        if let Some(workers) = self.workers.lock().upgrade() {
            workers.request_background(self.index, FlushClass::Lru, self.config.lru_flush_min);
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Drop every resident page. Asserts no pins and no dirty pages remain;
    /// this is a cold-restart operation, not a working-set trim.
    pub fn invalidate_all(&self) {
        let descs = self.registry.all();
        for desc in &descs {
            assert_eq!(
                desc.fix_count(),
                0,
                "invalidate_all with pinned page {}",
                desc.id()
            );
            assert!(
                !desc.is_dirty(),
                "invalidate_all with dirty page {}; flush first",
                desc.id()
            );
        }
        let mut core = self.core.lock();
        for desc in &descs {
            self.evict_locked(&mut core, desc, true);
        }
        assert_eq!(self.hash.len(), 0);
        assert_eq!(self.registry.len(), 0);
    }

    /// Live shrink: withdraw frames until the budget reaches
    /// `target_frames`. Free frames go first, then buddy-carved frames are
    /// condensed (relocating live compressed blocks), then clean pages are
    /// evicted. Returns the number of frames withdrawn; a pool busier than
    /// the target may withdraw fewer.
    pub fn shrink(&self, target_frames: usize) -> usize {
        let mut withdrawn = 0;
        let mut passes = 0;
        loop {
            let need = self.frames.budget().saturating_sub(target_frames);
            if need == 0 {
                return withdrawn;
            }
            // budget that was never carved costs nothing to shed.
            withdrawn += self.frames.reduce_uncarved(need);
            if self.frames.budget() <= target_frames {
                return withdrawn;
            }
            let mut progress = false;
            {
                let mut core = self.core.lock();

                while self.frames.budget() > target_frames {
                    match core.free_frames.pop() {
                        Some(frame) => {
                            self.frames.retire(frame);
                            withdrawn += 1;
                            progress = true;
                        }
                        None => break,
                    }
                }

                if self.frames.budget() > target_frames && core.buddy.carved_frames() > 0 {
                    let need = self.frames.budget() - target_frames;
                    let targets: fxhash::FxHashSet<FrameRef> = core
                        .buddy
                        .carved_frame_ids()
                        .into_iter()
                        .take(need)
                        .collect();
                    let registry = &self.registry;
                    let released = core.buddy.condense(&targets, |r| registry.get(r));
                    for frame in released {
                        if self.frames.budget() > target_frames {
                            self.frames.retire(frame);
                            withdrawn += 1;
                        } else {
                            core.free_frames.push(frame);
                        }
                        progress = true;
                    }
                }

                if self.frames.budget() > target_frames
                    && self.scan_and_free_locked(&mut core, true)
                {
                    progress = true;
                }
            }
            if !progress {
                passes += 1;
                // one flush pass may clean pages that then become evictable.
                if passes > 2 {
                    return withdrawn;
                }
                flush::flush_batch(self, FlushClass::Lru, self.config.lru_flush_min, u64::MAX);
            }
        }
    }

    /// Block until no flush batch is active on this instance.
    pub fn wait_for_flush_end(&self) {
        let mut guard = self.flush_wait_mu.lock();
        while self.flush_in_progress() {
            self.flush_wait
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    /// Wait for in-flight I/O to drain, with periodic diagnostics. Called
    /// on the shutdown path before queues are torn down.
    pub(crate) fn drain_io(&self) {
        self.wait_for_flush_end();
        let mut waited = 0u32;
        loop {
            let reads = self.pending_reads.load(Ordering::Acquire);
            if reads == 0 && !self.flush_in_progress() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
            waited += 1;
            if waited % 500 == 0 {
                log::warn!(
                    "pool instance {}: still waiting for i/o to drain \
                     ({} reads pending, flush active: {})",
                    self.index,
                    reads,
                    self.flush_in_progress()
                );
            }
        }
    }

    pub(crate) fn notify_free_waiters(&self) {
        self.free_wait.notify_all();
    }

    pub(crate) fn notify_read_waiters(&self) {
        self.read_wait.notify_all();
    }

    pub(crate) fn notify_flush_waiters(&self) {
        self.flush_wait.notify_all();
    }

    // ---- introspection ---------------------------------------------------

    pub fn resident_pages(&self) -> usize {
        self.hash.len()
    }

    pub fn dirty_pages(&self) -> usize {
        self.flush.lock().len()
    }

    pub fn free_frames(&self) -> usize {
        self.core.lock().free_frames.len()
    }
}

/// A pinned page. The pin is released on drop; content access goes through
/// the page's reader/writer latch, which is independent of every pool-level
/// lock.
pub struct PageHandle {
    pool: Arc<PoolInstance>,
    desc: Arc<PageDescriptor>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("id", &self.desc.id())
            .finish()
    }
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.desc.id()
    }

    pub fn is_dirty(&self) -> bool {
        self.desc.is_dirty()
    }

    pub fn oldest_modification(&self) -> u64 {
        self.desc.oldest_modification()
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> PageReadGuard<'_> {
        let latch = self.desc.latch.read();
        // unwrap/SAFETY: a pinned resident page keeps its frame; the latch
        // excludes writers.
        let bytes = unsafe { self.pool.frames.frame_slice(self.desc.frame().unwrap()) };
        PageReadGuard {
            _latch: latch,
            bytes,
        }
    }

    /// Exclusive access to the page bytes. Pair every modification with
    /// [`PageHandle::mark_dirty`], passing the LSN of its redo record.
    pub fn write(&self) -> PageWriteGuard<'_> {
        let latch = self.desc.latch.write();
        // unwrap/SAFETY: as in `read`, with the latch now exclusive.
        let bytes = unsafe {
            self.pool
                .frames
                .frame_slice_mut(self.desc.frame().unwrap())
        };
        PageWriteGuard {
            _latch: latch,
            bytes,
        }
    }

    pub fn mark_dirty(&self, lsn: u64) {
        self.pool.mark_dirty(&self.desc, lsn);
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.desc.unpin() == 0 {
            // the last pin gone may unblock an eviction or corrupt-drain
            // waiter.
            self.pool.notify_free_waiters();
        }
    }
}

pub struct PageReadGuard<'a> {
    _latch: RwLockReadGuard<'a, ()>,
    bytes: &'a [u8],
}

impl std::ops::Deref for PageReadGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

pub struct PageWriteGuard<'a> {
    _latch: RwLockWriteGuard<'a, ()>,
    bytes: &'a mut [u8],
}

impl std::ops::Deref for PageWriteGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}
