//! Page descriptors and the descriptor arena.
//!
//! A [`PageDescriptor`] is the control block of one cached page. The pool's
//! lists and hash never hold the descriptor directly; they hold a
//! [`PageRef`] — an arena slot plus a generation counter — so that a stale
//! reference to an evicted-and-recycled slot resolves to nothing instead of
//! to somebody else's page.
//!
//! Field ownership follows the pool's lock discipline: list/hash membership
//! is guarded by the structural and flush mutexes, while the fields here are
//! atomics that may be *read* optimistically anywhere but are only *written*
//! under the lock that owns the corresponding transition. Decisions based on
//! optimistic reads are always re-validated under that lock.

use parking_lot::RwLock;
use slab::Slab;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};

use crate::page_id::PageId;
use crate::pool::frames::FrameRef;

/// Lifecycle of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Not mapped to any page identity.
    NotUsed = 0,
    /// Frame allocated, identity assigned, contents not meaningful yet.
    Memory = 1,
    /// A read I/O is filling the frame or compressed block.
    ReadInProgress = 2,
    /// Fully resident, clean or dirty.
    Resident = 3,
    /// Exclusive unlinking in progress; lookups must treat it as gone.
    BeingRemoved = 4,
    /// Failed validation on read completion; forced to the removal path
    /// once all pins drain.
    CorruptEvicted = 5,
}

impl PageState {
    fn from_u8(raw: u8) -> PageState {
        match raw {
            0 => PageState::NotUsed,
            1 => PageState::Memory,
            2 => PageState::ReadInProgress,
            3 => PageState::Resident,
            4 => PageState::BeingRemoved,
            5 => PageState::CorruptEvicted,
            _ => unreachable!("invalid page state {raw}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoFix {
    None = 0,
    Read = 1,
    Write = 2,
}

impl IoFix {
    fn from_u8(raw: u8) -> IoFix {
        match raw {
            0 => IoFix::None,
            1 => IoFix::Read,
            2 => IoFix::Write,
            _ => unreachable!("invalid io fix {raw}"),
        }
    }
}

/// A compressed sub-block owned by a descriptor: a location inside a buddy
/// frame plus its size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipBlock {
    pub frame: FrameRef,
    pub offset: u32,
    pub class: u8,
}

const ZIP_NONE: u64 = u64::MAX;

fn pack_zip(zip: ZipBlock) -> u64 {
    debug_assert!(zip.offset < 1 << 16);
    ((zip.frame.to_raw() as u64) << 32) | ((zip.offset as u64) << 8) | zip.class as u64
}

fn unpack_zip(raw: u64) -> Option<ZipBlock> {
    if raw == ZIP_NONE {
        return None;
    }
    Some(ZipBlock {
        // unwrap: a packed block never stores the NONE sentinel frame.
        frame: FrameRef::from_raw((raw >> 32) as u32).unwrap(),
        offset: ((raw >> 8) & 0xFFFF) as u32,
        class: (raw & 0xFF) as u8,
    })
}

/// Control block for one cached page.
pub struct PageDescriptor {
    id: PageId,
    slot: u32,
    generation: u32,
    /// Compressed physical size, `None` for uncompressed spaces.
    zip_size: Option<usize>,

    state: AtomicU8,
    io_fix: AtomicU8,
    fix_count: AtomicU32,
    /// LSN of the oldest unflushed modification; 0 = clean. Written only
    /// under the flush-list mutex.
    oldest_modification: AtomicU64,
    /// Whether the page sits in the old segment of the LRU. Written only
    /// under the structural mutex.
    old: AtomicU8,
    /// Value of the instance access clock at first access; 0 = never
    /// accessed. Read-ahead uses the ordering of these values.
    access_time: AtomicU64,

    frame: AtomicU32,
    zip: AtomicU64,

    /// Content latch over the page bytes. Wrapped in an `Arc` so flush can
    /// hold owned read guards across an entire staged batch.
    pub latch: Arc<RwLock<()>>,
}

impl PageDescriptor {
    fn new(id: PageId, slot: u32, generation: u32, zip_size: Option<usize>) -> Self {
        PageDescriptor {
            id,
            slot,
            generation,
            zip_size,
            state: AtomicU8::new(PageState::Memory as u8),
            io_fix: AtomicU8::new(IoFix::None as u8),
            fix_count: AtomicU32::new(0),
            oldest_modification: AtomicU64::new(0),
            old: AtomicU8::new(0),
            access_time: AtomicU64::new(0),
            frame: AtomicU32::new(FrameRef::NONE),
            zip: AtomicU64::new(ZIP_NONE),
            latch: Arc::new(RwLock::new(())),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page_ref(&self) -> PageRef {
        PageRef {
            slot: self.slot,
            generation: self.generation,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn zip_size(&self) -> Option<usize> {
        self.zip_size
    }

    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn io_fix(&self) -> IoFix {
        IoFix::from_u8(self.io_fix.load(Ordering::Acquire))
    }

    pub fn set_io_fix(&self, fix: IoFix) {
        self.io_fix.store(fix as u8, Ordering::Release);
    }

    /// Claim the page for an I/O, failing if one is already in flight.
    pub fn try_io_fix(&self, fix: IoFix) -> bool {
        self.io_fix
            .compare_exchange(
                IoFix::None as u8,
                fix as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn pin(&self) -> u32 {
        self.fix_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unpin(&self) -> u32 {
        let prev = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned page");
        prev - 1
    }

    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }

    pub fn oldest_modification(&self) -> u64 {
        self.oldest_modification.load(Ordering::Acquire)
    }

    pub fn set_oldest_modification(&self, lsn: u64) {
        self.oldest_modification.store(lsn, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.oldest_modification() != 0
    }

    pub fn is_old(&self) -> bool {
        self.old.load(Ordering::Acquire) != 0
    }

    pub fn set_old(&self, old: bool) {
        self.old.store(old as u8, Ordering::Release);
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Acquire)
    }

    /// Record the first access; later calls keep the original stamp.
    pub fn touch(&self, now: u64) {
        let _ = self
            .access_time
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_accessed(&self) -> bool {
        self.access_time() != 0
    }

    pub fn frame(&self) -> Option<FrameRef> {
        FrameRef::from_raw(self.frame.load(Ordering::Acquire))
    }

    pub fn set_frame(&self, frame: Option<FrameRef>) {
        let raw = frame.map_or(FrameRef::NONE, FrameRef::to_raw);
        self.frame.store(raw, Ordering::Release);
    }

    pub fn zip_block(&self) -> Option<ZipBlock> {
        unpack_zip(self.zip.load(Ordering::Acquire))
    }

    pub fn set_zip_block(&self, zip: Option<ZipBlock>) {
        let raw = zip.map_or(ZIP_NONE, pack_zip);
        self.zip.store(raw, Ordering::Release);
    }

    /// Both a compressed and an uncompressed copy exist: the page belongs
    /// on the unzip list and its frame may be detached preferentially.
    pub fn belongs_to_unzip(&self) -> bool {
        self.frame().is_some() && self.zip_block().is_some()
    }

    /// Optimistic eviction check; the caller re-validates under the hash
    /// bucket latch before acting.
    pub fn ready_for_replace(&self) -> bool {
        self.state() == PageState::Resident
            && self.fix_count() == 0
            && !self.is_dirty()
            && self.io_fix() == IoFix::None
    }

    /// Whether a flush batch may pick this page up.
    pub fn ready_for_flush(&self) -> bool {
        self.state() == PageState::Resident && self.is_dirty() && self.io_fix() == IoFix::None
    }
}

/// Handle to a descriptor: arena slot + generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub slot: u32,
    pub generation: u32,
}

/// The descriptor arena. Slots are recycled; generations are not.
pub struct Registry {
    slab: RwLock<Slab<Arc<PageDescriptor>>>,
    next_generation: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            slab: RwLock::new(Slab::new()),
            next_generation: AtomicU32::new(1),
        }
    }

    pub fn insert(&self, id: PageId, zip_size: Option<usize>) -> Arc<PageDescriptor> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut slab = self.slab.write();
        let entry = slab.vacant_entry();
        let slot = u32::try_from(entry.key()).expect("descriptor arena exceeded u32 slots");
        let desc = Arc::new(PageDescriptor::new(id, slot, generation, zip_size));
        entry.insert(desc.clone());
        desc
    }

    /// Resolve a handle, failing on generation mismatch (the slot was
    /// recycled since the handle was taken).
    pub fn get(&self, page_ref: PageRef) -> Option<Arc<PageDescriptor>> {
        let slab = self.slab.read();
        let desc = slab.get(page_ref.slot as usize)?;
        if desc.generation != page_ref.generation {
            return None;
        }
        Some(desc.clone())
    }

    /// Resolve by bare slot. Only valid while a structural lock pins the
    /// slot's membership in some list.
    pub fn get_slot(&self, slot: u32) -> Option<Arc<PageDescriptor>> {
        self.slab.read().get(slot as usize).cloned()
    }

    pub fn remove(&self, page_ref: PageRef) -> Option<Arc<PageDescriptor>> {
        let mut slab = self.slab.write();
        let desc = slab.get(page_ref.slot as usize)?;
        if desc.generation != page_ref.generation {
            return None;
        }
        Some(slab.remove(page_ref.slot as usize))
    }

    pub fn len(&self) -> usize {
        self.slab.read().len()
    }

    /// Every live descriptor. Used by invalidation and teardown sweeps.
    pub fn all(&self) -> Vec<Arc<PageDescriptor>> {
        self.slab.read().iter().map(|(_, d)| d.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_catches_stale_handles() {
        let registry = Registry::new();
        let desc = registry.insert(PageId::new(1, 1), None);
        let stale = desc.page_ref();
        assert!(registry.get(stale).is_some());
        registry.remove(stale).unwrap();

        // recycle the slot for a different page.
        let desc2 = registry.insert(PageId::new(1, 2), None);
        assert_eq!(desc2.slot(), stale.slot);
        assert!(registry.get(stale).is_none());
        assert!(registry.get(desc2.page_ref()).is_some());
    }

    #[test]
    fn zip_block_packing() {
        let desc = Registry::new().insert(PageId::new(1, 1), Some(2048));
        assert_eq!(desc.zip_block(), None);
        let pool = crate::pool::frames::FramePool::new(16384, 1);
        let frame = pool.alloc_zeroed().unwrap();
        let zip = ZipBlock {
            frame,
            offset: 4096,
            class: 3,
        };
        desc.set_zip_block(Some(zip));
        assert_eq!(desc.zip_block(), Some(zip));
        desc.set_zip_block(None);
        assert_eq!(desc.zip_block(), None);
    }

    #[test]
    fn replace_readiness() {
        let registry = Registry::new();
        let desc = registry.insert(PageId::new(1, 1), None);
        desc.set_state(PageState::Resident);
        assert!(desc.ready_for_replace());

        desc.pin();
        assert!(!desc.ready_for_replace());
        desc.unpin();

        desc.set_oldest_modification(100);
        assert!(!desc.ready_for_replace());
        assert!(desc.ready_for_flush());
        desc.set_oldest_modification(0);

        assert!(desc.try_io_fix(IoFix::Write));
        assert!(!desc.try_io_fix(IoFix::Read));
        assert!(!desc.ready_for_replace());
        desc.set_io_fix(IoFix::None);
        assert!(desc.ready_for_replace());
    }
}
