//! The dirty-page flush pipeline.
//!
//! Dirty pages live on the flush list, ordered by strictly non-increasing
//! `oldest_modification` from head to tail: the head is the newest insert,
//! the tail is the oldest dirty page and therefore the checkpoint
//! bottleneck. In steady state LSNs arrive monotonically and insertion is an
//! O(1) head push; during crash recovery they arrive out of order and a
//! balanced-tree index (built only for that mode) finds the sorted position.
//!
//! Batches come in two classes: an LRU flush reclaims memory from the LRU
//! tail, a list flush drives checkpoint age down from the flush-list tail.
//! Each selected victim drags flushable neighbors (physically adjacent page
//! numbers) into the batch, the whole group is staged through the
//! double-write buffer, synced, and only then written to its final
//! locations.

use parking_lot::ArcRwLockReadGuard;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::io::{IoCommand, IoKind, IoStatus};
use crate::page_id::PageId;
use crate::pool::descriptor::{IoFix, PageDescriptor, PageState};
use crate::pool::list::SlotList;
use crate::pool::PoolInstance;

pub mod staging;
pub mod workers;

/// Why a batch is running: to reclaim memory or to advance the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushClass {
    Lru = 0,
    List = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed(usize),
    /// A batch of this class is already running on this instance; the
    /// caller backs off and retries later.
    AlreadyRunning,
}

/// State of the single flush-list iterator hazard.
///
/// A tail-to-head iterator records the node it will visit next before
/// releasing the list lock to do I/O. A concurrent removal of exactly that
/// node invalidates the slot, and the iterator restarts from the tail
/// instead of stepping through a node that is no longer linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardState {
    /// No iterator active.
    Idle,
    /// Resume at this slot.
    At(u32),
    /// The iterator had reached the head; nothing left to visit.
    End,
    /// The recorded node was removed; restart from the tail.
    Invalidated,
}

#[derive(Debug)]
pub struct HazardSlot {
    state: HazardState,
}

impl HazardSlot {
    fn new() -> Self {
        HazardSlot {
            state: HazardState::Idle,
        }
    }

    /// Record the next node to visit (None = the head was reached).
    pub fn arm(&mut self, next: Option<u32>) {
        self.state = match next {
            Some(slot) => HazardState::At(slot),
            None => HazardState::End,
        };
    }

    /// Compare-and-reset: invalidate the slot iff it points at `slot`.
    pub fn invalidate_if(&mut self, slot: u32) -> bool {
        if self.state == HazardState::At(slot) {
            self.state = HazardState::Invalidated;
            true
        } else {
            false
        }
    }

    /// Take the state, leaving the slot idle.
    pub fn disarm(&mut self) -> HazardState {
        std::mem::replace(&mut self.state, HazardState::Idle)
    }
}

/// The flush list proper. Guarded by its own mutex in [`PoolInstance`],
/// never by the structural mutex.
pub struct FlushList {
    list: SlotList,
    lsn: fxhash::FxHashMap<u32, u64>,
    pub hazard: HazardSlot,
    /// Ordered index for out-of-order insertion; present only during crash
    /// recovery.
    recovery_index: Option<BTreeMap<(u64, u32), ()>>,
}

impl FlushList {
    pub fn new() -> Self {
        FlushList {
            list: SlotList::new(),
            lsn: fxhash::FxHashMap::default(),
            hazard: HazardSlot::new(),
            recovery_index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.list.contains(slot)
    }

    pub fn lsn_of(&self, slot: u32) -> Option<u64> {
        self.lsn.get(&slot).copied()
    }

    pub fn tail(&self) -> Option<u32> {
        self.list.tail()
    }

    /// One step toward the head (toward newer modifications).
    pub fn prev(&self, slot: u32) -> Option<u32> {
        self.list.prev(slot)
    }

    /// The oldest unflushed modification, i.e. the checkpoint limit.
    pub fn oldest_lsn(&self) -> Option<u64> {
        self.tail().and_then(|slot| self.lsn_of(slot))
    }

    /// Insert a newly dirtied page. O(1) in the monotonic common case; in
    /// recovery mode the tree index locates the sorted position.
    pub fn insert(&mut self, slot: u32, lsn: u64) {
        debug_assert!(lsn > 0, "0 is the clean sentinel, not an LSN");
        debug_assert!(!self.list.contains(slot), "page already in flush list");

        let at_head = match self.list.head() {
            None => true,
            // unwrap: every listed slot has a recorded lsn.
            Some(head) => lsn >= self.lsn_of(head).unwrap(),
        };

        if at_head {
            self.list.push_head(slot);
        } else if let Some(index) = &self.recovery_index {
            // the node with the smallest LSN still greater than ours is the
            // tail-most member of the "newer" prefix: insert right after it.
            let succ = index
                .range((Excluded((lsn, u32::MAX)), Unbounded))
                .next()
                .map(|(&(_, s), _)| s);
            match succ {
                Some(after) => self.list.insert_after(after, slot),
                None => self.list.push_head(slot),
            }
        } else {
            // outside recovery LSNs are close to monotonic, but two threads
            // can swap places between taking an LSN and taking this lock;
            // walk the short distance to the sorted position.
            let mut anchor = None;
            let mut cur = self.list.head();
            while let Some(s) = cur {
                if self.lsn_of(s).unwrap() <= lsn {
                    break;
                }
                anchor = Some(s);
                cur = self.list.next(s);
            }
            match anchor {
                Some(after) => self.list.insert_after(after, slot),
                None => self.list.push_head(slot),
            }
        }

        self.lsn.insert(slot, lsn);
        if let Some(index) = &mut self.recovery_index {
            index.insert((lsn, slot), ());
        }
    }

    /// Unlink a page. Self-describing links make this O(1); the hazard is
    /// reset if the iterator was about to visit this node.
    pub fn remove(&mut self, slot: u32) -> bool {
        if !self.list.contains(slot) {
            return false;
        }
        self.hazard.invalidate_if(slot);
        self.list.remove(slot);
        // unwrap: listed slots always have a recorded lsn.
        let lsn = self.lsn.remove(&slot).unwrap();
        if let Some(index) = &mut self.recovery_index {
            index.remove(&(lsn, slot));
        }
        true
    }

    /// Enter or leave recovery mode. Entering builds the tree index from
    /// the current list; leaving tears it down.
    pub fn set_recovery_mode(&mut self, recovery: bool) {
        if recovery {
            let index = self
                .lsn
                .iter()
                .map(|(&slot, &lsn)| ((lsn, slot), ()))
                .collect();
            self.recovery_index = Some(index);
        } else {
            self.recovery_index = None;
        }
    }

    /// Assert the ordering invariant over the whole list. Test support.
    pub fn validate_ordering(&self) {
        let mut prev_lsn = u64::MAX;
        for slot in self.list.iter() {
            let lsn = self.lsn_of(slot).unwrap();
            assert!(
                prev_lsn >= lsn,
                "flush list out of order: {prev_lsn} before {lsn}"
            );
            prev_lsn = lsn;
        }
    }

    /// Head-to-tail (newest first) slots. Test support.
    pub fn slots(&self) -> Vec<u32> {
        self.list.iter().collect()
    }
}

/// Run one flush batch on an instance. Only one batch per class runs at a
/// time; a second request observes [`FlushOutcome::AlreadyRunning`].
pub fn flush_batch(
    pool: &PoolInstance,
    class: FlushClass,
    min_count: usize,
    lsn_limit: u64,
) -> FlushOutcome {
    if !pool.try_begin_batch(class) {
        return FlushOutcome::AlreadyRunning;
    }
    let flushed = match class {
        FlushClass::List => flush_list_batch(pool, min_count, lsn_limit),
        FlushClass::Lru => flush_lru_batch(pool, min_count),
    };
    pool.end_batch(class);
    FlushOutcome::Flushed(flushed)
}

/// Checkpoint-driven batch: walk the flush list from the tail while pages
/// are older than `lsn_limit`, flushing victims with their neighbors.
fn flush_list_batch(pool: &PoolInstance, min_count: usize, lsn_limit: u64) -> usize {
    let mut flushed = 0;
    while flushed < min_count {
        let victim = {
            let mut fl = pool.flush.lock();
            let mut cur = match fl.hazard.disarm() {
                HazardState::Idle | HazardState::Invalidated => fl.tail(),
                HazardState::At(slot) => Some(slot),
                HazardState::End => None,
            };
            let mut found = None;
            while let Some(slot) = cur {
                // unwrap: listed slots always have a recorded lsn.
                let lsn = fl.lsn_of(slot).unwrap();
                if lsn >= lsn_limit {
                    // the tail is the oldest: everything further is newer.
                    break;
                }
                match pool.registry.get_slot(slot) {
                    Some(desc) if desc.ready_for_flush() => {
                        let prev = fl.prev(slot);
                        fl.hazard.arm(prev);
                        found = Some(desc);
                        break;
                    }
                    _ => cur = fl.prev(slot),
                }
            }
            found
        };
        let Some(victim) = victim else { break };
        flushed += flush_group(pool, &victim, FlushClass::List, min_count - flushed);
    }
    // leave no dangling resume point for the next batch.
    pool.flush.lock().hazard.disarm();
    flushed
}

/// Memory-reclaim batch: walk the LRU tail, evicting clean replaceable
/// pages for free and flushing dirty ones (which are evicted on write
/// completion).
fn flush_lru_batch(pool: &PoolInstance, min_count: usize) -> usize {
    enum Action {
        Evict(Arc<PageDescriptor>),
        Flush(Arc<PageDescriptor>),
    }

    let mut flushed = 0;
    let mut scanned = 0;
    let scan_depth = pool.config.lru_scan_depth;
    while flushed < min_count && scanned < scan_depth {
        let action = {
            let core = pool.core.lock();
            let mut cur = core.lru.lru_list().tail();
            let mut found = None;
            while let Some(slot) = cur {
                scanned += 1;
                match pool.registry.get_slot(slot) {
                    Some(desc) if desc.ready_for_replace() => {
                        found = Some(Action::Evict(desc));
                        break;
                    }
                    Some(desc) if desc.ready_for_flush() => {
                        found = Some(Action::Flush(desc));
                        break;
                    }
                    _ => {}
                }
                if scanned >= scan_depth {
                    break;
                }
                cur = core.lru.lru_list().prev(slot);
            }
            found
        };
        match action {
            None => break,
            Some(Action::Evict(desc)) => {
                pool.try_evict(&desc, true);
            }
            Some(Action::Flush(desc)) => {
                flushed += flush_group(pool, &desc, FlushClass::Lru, min_count - flushed);
            }
        }
    }
    flushed
}

struct WriteJob {
    desc: Arc<PageDescriptor>,
    // held until the write completion is processed so no writer can modify
    // the page while its image is in flight.
    _latch: ArcRwLockReadGuard<parking_lot::RawRwLock, ()>,
    image: Vec<u8>,
}

/// Flush one victim together with its flushable neighbors, as one staged
/// batch. Returns the number of pages written.
fn flush_group(
    pool: &PoolInstance,
    victim: &Arc<PageDescriptor>,
    class: FlushClass,
    quota: usize,
) -> usize {
    let victim_id = victim.id();
    let (low, high) = neighbor_range(pool, victim, class);

    let mut jobs: Vec<WriteJob> = Vec::new();
    let mut pn = low;
    while pn < high {
        if jobs.len() >= quota.max(1) {
            // quota exhausted; still make sure the originally targeted
            // victim itself gets flushed.
            if pn <= victim_id.page_no {
                pn = victim_id.page_no;
            } else {
                break;
            }
        }
        let id = victim_id.with_page_no(pn);
        pn += 1;

        let desc = match pool.hash.get(&id).and_then(|r| pool.registry.get(r)) {
            Some(desc) => desc,
            None => continue,
        };
        // an LRU batch must not flush young neighbors: those would be
        // promoted pages we are about to throw away.
        if class == FlushClass::Lru && id != victim_id && !desc.is_old() {
            continue;
        }
        if !desc.ready_for_flush() {
            continue;
        }
        if let Some(job) = prepare_write(pool, &desc) {
            jobs.push(job);
        }
    }

    if jobs.is_empty() {
        return 0;
    }
    submit_and_complete(pool, jobs, class)
}

/// The aligned, contiguity-trimmed window of neighbors considered around a
/// victim. Collapses to the victim alone when neighbor flushing is off, the
/// pool is small, or the space is being dropped.
fn neighbor_range(
    pool: &PoolInstance,
    victim: &Arc<PageDescriptor>,
    class: FlushClass,
) -> (u32, u32) {
    let id = victim.id();
    let single = (id.page_no, id.page_no + 1);
    if !pool.config.neighbor_flushing || pool.source.space_is_stopping(id.space) {
        return single;
    }
    {
        let core = pool.core.lock();
        if core.lru.len() < pool.config.old_min_len {
            return single;
        }
    }
    let area = pool
        .config
        .read_ahead_area
        .min((pool.config.pool_frames / 16).max(1) as u32);
    let window = id.aligned_window(area);

    // trim to the contiguous dirty run around the victim: one seek saved
    // per adjacent page, nothing gained from holes.
    let flushable = |pn: u32| {
        pool.hash
            .get(&id.with_page_no(pn))
            .and_then(|r| pool.registry.get(r))
            .map_or(false, |d| {
                d.ready_for_flush() && (class != FlushClass::Lru || d.is_old())
            })
    };
    let mut low = id.page_no;
    while low > window.start && flushable(low - 1) {
        low -= 1;
    }
    let mut high = id.page_no + 1;
    while high < window.end && flushable(high) {
        high += 1;
    }
    let space_size = pool.source.space_size(id.space);
    (low, high.min(space_size.max(id.page_no + 1)))
}

/// Latch, io-fix and snapshot one page for writing. Any step failing leaves
/// the page untouched for the next batch.
fn prepare_write(pool: &PoolInstance, desc: &Arc<PageDescriptor>) -> Option<WriteJob> {
    // a held write latch means an active modifier: skip, never block a
    // batch on a latch.
    let latch = parking_lot::RwLock::try_read_arc(&desc.latch)?;
    if !desc.try_io_fix(IoFix::Write) {
        return None;
    }
    // re-validate under the io-fix claim.
    if desc.state() != PageState::Resident || !desc.is_dirty() {
        desc.set_io_fix(IoFix::None);
        return None;
    }
    match pool.page_image_for_write(desc) {
        Some(image) => Some(WriteJob {
            desc: desc.clone(),
            _latch: latch,
            image,
        }),
        None => {
            desc.set_io_fix(IoFix::None);
            None
        }
    }
}

/// Stage the whole group, sync the staging area, then release the final
/// writes and process their completions.
fn submit_and_complete(pool: &PoolInstance, mut jobs: Vec<WriteJob>, class: FlushClass) -> usize {
    if let Some(staging) = &pool.staging {
        let staged: Vec<(PageId, &[u8])> = jobs
            .iter()
            .map(|job| (job.desc.id(), job.image.as_slice()))
            .collect();
        if let Err(err) = staging.stage_batch(&staged) {
            log::error!("staging write failed, batch aborted: {err:#}");
            for job in &jobs {
                job.desc.set_io_fix(IoFix::None);
            }
            return 0;
        }
    }

    let handle = pool.io.make_handle();
    for (i, job) in jobs.iter_mut().enumerate() {
        let image = std::mem::take(&mut job.image);
        // unwrap: the io pool outlives every instance batch.
        handle
            .send(IoCommand {
                kind: IoKind::Write(job.desc.id(), image),
                user_data: i as u64,
            })
            .unwrap();
    }

    let mut completed_ok = 0;
    for _ in 0..jobs.len() {
        // unwrap: each submitted command produces exactly one completion.
        let complete = handle.recv().unwrap();
        let job = &jobs[complete.command.user_data as usize];
        if complete_write(pool, &job.desc, complete.status, class) {
            completed_ok += 1;
        }
    }

    if let Some(staging) = &pool.staging {
        if let Err(err) = staging.reset() {
            log::warn!("staging reset failed: {err:#}");
        }
    }

    // latches drop here, after every completion is bookkept.
    drop(jobs);
    pool.notify_flush_waiters();
    completed_ok
}

/// Write-completion bookkeeping for one page. Returns whether the page was
/// durably written.
fn complete_write(
    pool: &PoolInstance,
    desc: &Arc<PageDescriptor>,
    status: IoStatus,
    class: FlushClass,
) -> bool {
    match status {
        IoStatus::Ok => {
            {
                // the ordering invariant requires unlinking under the flush
                // mutex before the page can be considered clean.
                let mut fl = pool.flush.lock();
                fl.remove(desc.slot());
                desc.set_oldest_modification(0);
            }
            desc.set_io_fix(IoFix::None);
            pool.stats.pages_written.fetch_add(1, Ordering::Relaxed);
            if class == FlushClass::Lru {
                // memory-reclaim write: the page's whole point was to free
                // a frame.
                pool.try_evict(desc, true);
            }
            pool.notify_free_waiters();
            true
        }
        IoStatus::SpaceDeleted => {
            // the tablespace is gone; the page is garbage. Drop it.
            {
                let mut fl = pool.flush.lock();
                fl.remove(desc.slot());
                desc.set_oldest_modification(0);
            }
            desc.set_io_fix(IoFix::None);
            pool.try_evict(desc, true);
            false
        }
        IoStatus::Corrupted | IoStatus::ShortRead => {
            // hard write error: surface loudly, keep the page dirty so the
            // next batch retries it.
            log::error!(
                "write of page {} failed ({status:?}); leaving dirty for retry",
                desc.id()
            );
            desc.set_io_fix(IoFix::None);
            false
        }
    }
}
