//! Binary buddy allocator for compressed page blocks.
//!
//! Whole pool frames are carved into power-of-two sub-blocks, from the
//! minimum compressed page size up to the frame size. Splitting and
//! coalescing walk the usual buddy ladder; a block's buddy is found by
//! flipping the size bit of its offset.
//!
//! Free blocks are tracked two ways at once. A side table per carved frame
//! (free bitmap + size-class byte per minimum-granule) is the authority for
//! every decision. In addition, every free block is stamped in-band: a
//! sentinel word at a fixed offset inside the block plus its encoded class.
//! The sentinel lands on the field that holds the owning space id in a live
//! compressed page, and the two value domains are disjoint by construction,
//! so a stale read can never confuse free filler with live page data. The
//! stamp is checked against the side table in debug builds to catch
//! use-after-free and double-free.
//!
//! All entry points require the pool's structural mutex to be held by the
//! caller; the allocator itself is plain data.

use bitvec::vec::BitVec;
use fxhash::{FxHashMap, FxHashSet};
use std::{collections::BTreeSet, sync::Arc};

use crate::page_id::MAX_SPACE_ID;
use crate::pool::descriptor::{IoFix, PageDescriptor, PageRef, ZipBlock};
use crate::pool::frames::{FramePool, FrameRef};

/// Smallest block the allocator hands out.
pub const MIN_ZIP_SIZE: usize = 1024;

/// Sentinel marking a free block, written at [`STAMP_OFFSET`] inside it.
pub const FREE_STAMP: u32 = 0xFFFF_FFFF;

/// Offset of the stamp inside a block. In a live compressed page this
/// position holds the owning space id.
pub const STAMP_OFFSET: usize = 32;

// The stamp must never collide with a valid space id.
const _: () = assert!(FREE_STAMP > MAX_SPACE_ID);

struct CarvedFrame {
    /// Bit set where a *free* block starts.
    free_start: BitVec,
    /// Bit set where a *used* block starts.
    used_start: BitVec,
    /// Size class of the block starting at each granule; meaningful only
    /// where a block (free or used) starts.
    class: Vec<u8>,
    used_blocks: usize,
}

pub struct Buddy {
    pool: FramePool,
    n_classes: usize,
    /// Per class: set of (frame, offset) of free blocks.
    free_lists: Vec<BTreeSet<(FrameRef, u32)>>,
    frames: FxHashMap<FrameRef, CarvedFrame>,
    owners: FxHashMap<(u32, u32), PageRef>,
    free_capacity: usize,
    /// Skip recombination while a class free list is shorter than this and
    /// no shrink is pending. 0 = always recombine.
    recombine_skip_threshold: usize,
    shrink_pending: bool,
}

impl Buddy {
    pub fn new(pool: FramePool, recombine_skip_threshold: usize) -> Self {
        let frame_size = pool.frame_size();
        assert!(frame_size >= MIN_ZIP_SIZE);
        let n_classes = (frame_size / MIN_ZIP_SIZE).trailing_zeros() as usize + 1;
        Buddy {
            pool,
            n_classes,
            free_lists: (0..n_classes).map(|_| BTreeSet::new()).collect(),
            frames: FxHashMap::default(),
            owners: FxHashMap::default(),
            free_capacity: 0,
            recombine_skip_threshold,
            shrink_pending: false,
        }
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn size_of_class(&self, class: u8) -> usize {
        MIN_ZIP_SIZE << class
    }

    /// Smallest class whose block holds `size` bytes, or `None` when `size`
    /// exceeds the frame size.
    pub fn class_for_size(&self, size: usize) -> Option<u8> {
        if size > self.pool.frame_size() {
            return None;
        }
        let size = size.max(MIN_ZIP_SIZE).next_power_of_two();
        Some((size / MIN_ZIP_SIZE).trailing_zeros() as u8)
    }

    /// Total bytes currently free inside carved frames.
    pub fn free_capacity(&self) -> usize {
        self.free_capacity
    }

    pub fn carved_frames(&self) -> usize {
        self.frames.len()
    }

    /// Every frame currently carved into sub-blocks, least-used first —
    /// the cheapest candidates for a shrink to vacate.
    pub fn carved_frame_ids(&self) -> Vec<FrameRef> {
        let mut ids: Vec<_> = self.frames.iter().map(|(&f, c)| (c.used_blocks, f)).collect();
        ids.sort();
        ids.into_iter().map(|(_, f)| f).collect()
    }

    pub fn set_shrink_pending(&mut self, pending: bool) {
        self.shrink_pending = pending;
    }

    /// Allocate a block of `class`. When no carved frame has room,
    /// `acquire_frame` is asked for a fresh full frame (which may trigger
    /// an LRU eviction in the caller). `None` only when that source is
    /// exhausted too.
    pub fn allocate(
        &mut self,
        class: u8,
        acquire_frame: impl FnOnce() -> Option<FrameRef>,
    ) -> Option<ZipBlock> {
        assert!((class as usize) < self.n_classes);
        let block = match self.take_split(class) {
            Some(block) => block,
            None => {
                let frame = acquire_frame()?;
                self.carve(frame);
                // unwrap: the freshly carved frame contributed a max-class
                // block, which always splits down to `class`.
                self.take_split(class).unwrap()
            }
        };
        self.mark_used(block);
        Some(block)
    }

    /// Free a block. Returns a frame when coalescing recombined it whole;
    /// the caller owns it again (typically pushing it to the free list).
    pub fn free(&mut self, block: ZipBlock) -> Option<FrameRef> {
        let size = self.size_of_class(block.class);
        {
            let carved = self.frames.get(&block.frame).expect("free of uncarved frame");
            let g = granule(block.offset);
            debug_assert!(!carved.free_start[g], "double free of buddy block");
            debug_assert!(carved.used_start[g], "free of block not marked used");
            debug_assert_eq!(carved.class[g], block.class, "free with wrong class");
            debug_assert_ne!(self.read_stamp(block), FREE_STAMP, "freeing stamped-free block");
        }
        self.owners.remove(&(block.frame.to_raw(), block.offset));
        let carved = self.frames.get_mut(&block.frame).unwrap();
        carved.used_blocks -= 1;
        carved.used_start.set(granule(block.offset), false);
        self.free_capacity += size;

        if self.recombine_skip_threshold > 0
            && !self.shrink_pending
            && self.free_lists[block.class as usize].len() < self.recombine_skip_threshold
        {
            self.insert_free(block);
            return None;
        }

        let mut cur = block;
        loop {
            if cur.class as usize == self.n_classes - 1 {
                // the whole frame is free again: uncarve and hand it back.
                self.uncarve(cur.frame);
                return Some(cur.frame);
            }
            let size = self.size_of_class(cur.class) as u32;
            let buddy_offset = cur.offset ^ size;
            let carved = self.frames.get_mut(&cur.frame).unwrap();
            let bg = granule(buddy_offset);
            // merge only a buddy that is free AND of exactly this class; a
            // partially subdivided buddy fails the class check.
            if carved.free_start[bg] && carved.class[bg] == cur.class {
                carved.free_start.set(bg, false);
                self.free_lists[cur.class as usize].remove(&(cur.frame, buddy_offset));
                cur = ZipBlock {
                    frame: cur.frame,
                    offset: cur.offset.min(buddy_offset),
                    class: cur.class + 1,
                };
            } else {
                self.insert_free(cur);
                return None;
            }
        }
    }

    /// Best-effort resize: allocate `new_class`, copy the common prefix,
    /// free the old block. The owner mapping follows the data. `None`
    /// leaves the old block untouched.
    pub fn realloc(
        &mut self,
        block: ZipBlock,
        new_class: u8,
        acquire_frame: impl FnOnce() -> Option<FrameRef>,
    ) -> Option<(ZipBlock, Option<FrameRef>)> {
        let new_block = self.allocate(new_class, acquire_frame)?;
        let copy_len = self
            .size_of_class(block.class)
            .min(self.size_of_class(new_class));
        unsafe {
            let src = self.pool.frame_ptr(block.frame).add(block.offset as usize);
            let dst = self
                .pool
                .frame_ptr(new_block.frame)
                .add(new_block.offset as usize);
            std::ptr::copy_nonoverlapping(src, dst, copy_len);
        }
        if let Some(owner) = self.owners.remove(&(block.frame.to_raw(), block.offset)) {
            self.owners
                .insert((new_block.frame.to_raw(), new_block.offset), owner);
        }
        let released = self.free(block);
        Some((new_block, released))
    }

    /// Move a live block to a free block of the same class in some other
    /// frame, for defragmentation during a pool shrink. `avoid` frames are
    /// not acceptable targets. `may_move` is consulted with the block's
    /// owner (None = not-yet-claimed placeholder, movable only with
    /// `force`); it re-validates pin/io state under the appropriate latch.
    ///
    /// Returns the new location and possibly a whole frame released by
    /// freeing the source.
    pub fn relocate(
        &mut self,
        src: ZipBlock,
        force: bool,
        avoid: &FxHashSet<FrameRef>,
        may_move: impl FnOnce(Option<PageRef>) -> bool,
    ) -> Option<(ZipBlock, Option<FrameRef>)> {
        let owner = self
            .owners
            .get(&(src.frame.to_raw(), src.offset))
            .copied();
        if owner.is_none() && !force {
            return None;
        }
        if !may_move(owner) {
            return None;
        }
        let dst = *self.free_lists[src.class as usize]
            .iter()
            .find(|(frame, _)| *frame != src.frame && !avoid.contains(frame))?;
        self.free_lists[src.class as usize].remove(&dst);
        let dst = ZipBlock {
            frame: dst.0,
            offset: dst.1,
            class: src.class,
        };
        {
            let carved = self.frames.get_mut(&dst.frame).unwrap();
            carved.free_start.set(granule(dst.offset), false);
        }
        self.free_capacity -= self.size_of_class(src.class);
        self.mark_used_inner(dst, owner);
        unsafe {
            let s = self.pool.frame_ptr(src.frame).add(src.offset as usize);
            let d = self.pool.frame_ptr(dst.frame).add(dst.offset as usize);
            std::ptr::copy_nonoverlapping(s, d, self.size_of_class(src.class));
        }
        let released = self.free(src);
        Some((dst, released))
    }

    /// Record which descriptor owns a block. Cleared automatically on free.
    pub fn set_owner(&mut self, block: ZipBlock, owner: PageRef) {
        self.owners.insert((block.frame.to_raw(), block.offset), owner);
    }

    pub fn owner_of(&self, block: ZipBlock) -> Option<PageRef> {
        self.owners
            .get(&(block.frame.to_raw(), block.offset))
            .copied()
    }

    /// Administrative sweep for a live pool shrink: force extra coalescing
    /// and relocation so that the `targets` frames become whole and can be
    /// withdrawn. `resolve` maps a block's owner handle to its descriptor;
    /// owners that resolve to a pinned or io-fixed page are skipped.
    /// Returns every frame released, targeted or not.
    pub fn condense(
        &mut self,
        targets: &FxHashSet<FrameRef>,
        mut resolve: impl FnMut(PageRef) -> Option<Arc<PageDescriptor>>,
    ) -> Vec<FrameRef> {
        self.shrink_pending = true;
        let mut released = Vec::new();

        // First pass: recombine any free blocks parked by the skip
        // heuristic inside target frames.
        let parked: Vec<ZipBlock> = self
            .free_lists
            .iter()
            .enumerate()
            .flat_map(|(class, list)| {
                list.iter()
                    .filter(|(frame, _)| targets.contains(frame))
                    .map(move |&(frame, offset)| ZipBlock {
                        frame,
                        offset,
                        class: class as u8,
                    })
            })
            .collect();
        for block in parked {
            // an earlier re-free may have coalesced this block away.
            if !self.free_lists[block.class as usize].remove(&(block.frame, block.offset)) {
                continue;
            }
            let g = granule(block.offset);
            let carved = self.frames.get_mut(&block.frame).unwrap();
            carved.free_start.set(g, false);
            carved.class[g] = block.class;
            self.free_capacity -= self.size_of_class(block.class);
            // account it used for an instant so the re-free balances, then
            // free with recombination unconditionally on.
            let carved = self.frames.get_mut(&block.frame).unwrap();
            carved.used_blocks += 1;
            carved.used_start.set(g, true);
            self.write_stamp_used(block);
            if let Some(frame) = self.free(block) {
                released.push(frame);
            }
        }

        // Second pass: move live blocks out of target frames.
        for &frame in targets {
            let Some(carved) = self.frames.get(&frame) else {
                continue;
            };
            let mut used = Vec::new();
            for g in carved.used_start.iter_ones() {
                used.push(ZipBlock {
                    frame,
                    offset: (g * MIN_ZIP_SIZE) as u32,
                    class: carved.class[g],
                });
            }
            for src in used {
                let owner = self.owner_of(src);
                let desc = owner.and_then(&mut resolve);
                let movable = match (owner, &desc) {
                    // not-yet-claimed placeholder: movable by force.
                    (None, _) => true,
                    // stale owner handle: leave it for eviction to clean up.
                    (Some(_), None) => false,
                    (Some(_), Some(d)) => d.fix_count() == 0 && d.io_fix() == IoFix::None,
                };
                if !movable {
                    continue;
                }
                if let Some((dst, freed)) = self.relocate(src, owner.is_none(), targets, |_| true)
                {
                    if let Some(d) = desc {
                        d.set_zip_block(Some(dst));
                    }
                    if let Some(f) = freed {
                        released.push(f);
                    }
                }
            }
        }
        self.shrink_pending = false;
        released
    }

    /// Bytes of a block. Caller must hold whatever latch protects the
    /// owning page's content.
    ///
    /// # Safety
    ///
    /// The block must be live and the frame pool must outlive the slice.
    pub unsafe fn block_slice(&self, block: ZipBlock) -> &[u8] {
        let ptr = self.pool.frame_ptr(block.frame).add(block.offset as usize);
        std::slice::from_raw_parts(ptr, self.size_of_class(block.class))
    }

    /// # Safety
    ///
    /// As [`Buddy::block_slice`], plus exclusive access to the block.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn block_slice_mut(&self, block: ZipBlock) -> &mut [u8] {
        let ptr = self.pool.frame_ptr(block.frame).add(block.offset as usize);
        std::slice::from_raw_parts_mut(ptr, self.size_of_class(block.class))
    }

    fn take_split(&mut self, class: u8) -> Option<ZipBlock> {
        // exact fit first.
        if let Some(&(frame, offset)) = self.free_lists[class as usize].iter().next() {
            self.free_lists[class as usize].remove(&(frame, offset));
            let carved = self.frames.get_mut(&frame).unwrap();
            carved.free_start.set(granule(offset), false);
            return Some(ZipBlock {
                frame,
                offset,
                class,
            });
        }
        // split the smallest larger block, pushing upper halves down the
        // ladder.
        let bigger = ((class as usize + 1)..self.n_classes)
            .find(|&c| !self.free_lists[c].is_empty())?;
        let &(frame, offset) = self.free_lists[bigger].iter().next().unwrap();
        self.free_lists[bigger].remove(&(frame, offset));
        self.frames
            .get_mut(&frame)
            .unwrap()
            .free_start
            .set(granule(offset), false);
        let mut c = bigger as u8;
        while c > class {
            c -= 1;
            let half = ZipBlock {
                frame,
                offset: offset + self.size_of_class(c) as u32,
                class: c,
            };
            self.insert_free(half);
        }
        Some(ZipBlock {
            frame,
            offset,
            class,
        })
    }

    fn carve(&mut self, frame: FrameRef) {
        let granules = self.pool.frame_size() / MIN_ZIP_SIZE;
        let mut free_start = BitVec::new();
        free_start.resize(granules, false);
        let mut used_start = BitVec::new();
        used_start.resize(granules, false);
        self.frames.insert(
            frame,
            CarvedFrame {
                free_start,
                used_start,
                class: vec![0; granules],
                used_blocks: 0,
            },
        );
        self.free_capacity += self.pool.frame_size();
        self.insert_free(ZipBlock {
            frame,
            offset: 0,
            class: (self.n_classes - 1) as u8,
        });
    }

    fn uncarve(&mut self, frame: FrameRef) {
        let carved = self.frames.remove(&frame).unwrap();
        debug_assert_eq!(carved.used_blocks, 0);
        debug_assert!(carved.free_start.not_any());
        debug_assert!(carved.used_start.not_any());
        self.free_capacity -= self.pool.frame_size();
    }

    fn insert_free(&mut self, block: ZipBlock) {
        let carved = self.frames.get_mut(&block.frame).unwrap();
        let g = granule(block.offset);
        debug_assert!(!carved.used_start[g]);
        carved.free_start.set(g, true);
        carved.class[g] = block.class;
        self.free_lists[block.class as usize].insert((block.frame, block.offset));
        self.write_stamp_free(block);
    }

    fn mark_used(&mut self, block: ZipBlock) {
        self.free_capacity -= self.size_of_class(block.class);
        self.mark_used_inner(block, None);
    }

    fn mark_used_inner(&mut self, block: ZipBlock, owner: Option<PageRef>) {
        let carved = self.frames.get_mut(&block.frame).unwrap();
        let g = granule(block.offset);
        debug_assert!(!carved.free_start[g]);
        debug_assert!(!carved.used_start[g]);
        carved.class[g] = block.class;
        carved.used_start.set(g, true);
        carved.used_blocks += 1;
        if let Some(owner) = owner {
            self.owners.insert((block.frame.to_raw(), block.offset), owner);
        }
        self.write_stamp_used(block);
    }

    fn write_stamp_free(&self, block: ZipBlock) {
        unsafe {
            let ptr = self
                .pool
                .frame_ptr(block.frame)
                .add(block.offset as usize + STAMP_OFFSET);
            ptr.cast::<u32>().write_unaligned(FREE_STAMP.to_le());
            ptr.add(4).write(block.class);
        }
    }

    fn write_stamp_used(&self, block: ZipBlock) {
        unsafe {
            let ptr = self
                .pool
                .frame_ptr(block.frame)
                .add(block.offset as usize + STAMP_OFFSET);
            ptr.cast::<u32>().write_unaligned(0u32.to_le());
        }
    }

    fn read_stamp(&self, block: ZipBlock) -> u32 {
        unsafe {
            let ptr = self
                .pool
                .frame_ptr(block.frame)
                .add(block.offset as usize + STAMP_OFFSET);
            u32::from_le(ptr.cast::<u32>().read_unaligned())
        }
    }

    #[cfg(test)]
    fn free_list_shape(&self) -> Vec<Vec<(FrameRef, u32)>> {
        self.free_lists
            .iter()
            .map(|l| l.iter().copied().collect())
            .collect()
    }
}

fn granule(offset: u32) -> usize {
    offset as usize / MIN_ZIP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(frames: usize) -> (FramePool, Buddy) {
        let pool = FramePool::new(16384, frames);
        let buddy = Buddy::new(pool.clone(), 0);
        (pool, buddy)
    }

    fn class_of(buddy: &Buddy, size: usize) -> u8 {
        buddy.class_for_size(size).unwrap()
    }

    #[test]
    fn oversize_request_fails_cleanly() {
        let (_pool, buddy) = setup(1);
        assert_eq!(buddy.class_for_size(16384 + 1), None);
        assert_eq!(buddy.class_for_size(32768), None);
        assert!(buddy.class_for_size(16384).is_some());
    }

    #[test]
    fn four_1k_blocks_recombine_to_a_whole_frame() {
        let (pool, mut buddy) = setup(1);
        let c1k = class_of(&buddy, 1024);
        let mut acquisitions = 0;
        let mut blocks = Vec::new();
        for _ in 0..4 {
            let block = buddy
                .allocate(c1k, || {
                    acquisitions += 1;
                    pool.alloc_zeroed()
                })
                .unwrap();
            blocks.push(block);
        }
        assert_eq!(acquisitions, 1);
        // one 16K frame split down: 1K+1K used at 0 and 1024, plus free
        // siblings at 2K(2048), 4K(4096), 8K(8192); two more 1K allocs eat
        // the 2K sibling.
        assert_eq!(buddy.free_capacity(), 16384 - 4 * 1024);

        let mut released = None;
        for block in blocks.into_iter().rev() {
            released = buddy.free(block);
        }
        // fully recombined: the frame came back and nothing stayed carved.
        let frame = released.expect("frame not recombined");
        assert_eq!(buddy.carved_frames(), 0);
        assert_eq!(buddy.free_capacity(), 0);
        pool.dealloc(frame);

        // a fresh 16K request needs exactly one (recycled) frame and no
        // eviction fallback.
        let c16k = class_of(&buddy, 16384);
        let mut extra = 0;
        let block = buddy
            .allocate(c16k, || {
                extra += 1;
                pool.alloc_zeroed()
            })
            .unwrap();
        assert_eq!(extra, 1);
        assert_eq!(block.offset, 0);
    }

    #[test]
    fn alloc_free_is_idempotent_on_free_list_shape() {
        let (pool, mut buddy) = setup(2);
        let c2k = class_of(&buddy, 2048);
        let a = buddy.allocate(c2k, || pool.alloc_zeroed()).unwrap();
        let before = buddy.free_list_shape();
        let cap_before = buddy.free_capacity();

        let b = buddy.allocate(class_of(&buddy, 1024), || pool.alloc_zeroed()).unwrap();
        buddy.free(b);
        assert_eq!(buddy.free_list_shape(), before);
        assert_eq!(buddy.free_capacity(), cap_before);

        buddy.free(a);
    }

    #[test]
    fn capacity_conserved_over_random_churn() {
        use rand::{Rng, SeedableRng};
        let pool = FramePool::new(16384, 8);
        let mut buddy = Buddy::new(pool.clone(), 0);
        let mut rng = rand_pcg::Pcg64::seed_from_u64(0x5EED);
        let mut live: Vec<ZipBlock> = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let class = rng.gen_range(0..buddy.n_classes() as u8);
                if let Some(block) = buddy.allocate(class, || pool.alloc_zeroed()) {
                    live.push(block);
                }
            } else {
                let block = live.swap_remove(rng.gen_range(0..live.len()));
                if let Some(frame) = buddy.free(block) {
                    pool.dealloc(frame);
                }
            }
        }
        let live_bytes: usize = live.iter().map(|b| buddy.size_of_class(b.class)).sum();
        assert_eq!(
            buddy.free_capacity() + live_bytes,
            buddy.carved_frames() * 16384
        );
        for block in live.drain(..) {
            if let Some(frame) = buddy.free(block) {
                pool.dealloc(frame);
            }
        }
        // everything recombined; no leaked or double-freed blocks.
        assert_eq!(buddy.carved_frames(), 0);
        assert_eq!(buddy.free_capacity(), 0);
    }

    #[test]
    fn skip_heuristic_parks_blocks_until_condense() {
        let pool = FramePool::new(16384, 2);
        let mut buddy = Buddy::new(pool.clone(), 16);
        let c1k = class_of(&buddy, 1024);
        let a = buddy.allocate(c1k, || pool.alloc_zeroed()).unwrap();
        let frame = a.frame;
        assert!(buddy.free(a).is_none());
        // parked on the 1K free list instead of recombining.
        assert_eq!(buddy.carved_frames(), 1);

        let targets: FxHashSet<FrameRef> = [frame].into_iter().collect();
        let released = buddy.condense(&targets, |_| None);
        assert_eq!(released, vec![frame]);
        assert_eq!(buddy.carved_frames(), 0);
    }

    #[test]
    fn relocate_moves_bytes_and_owner() {
        let pool = FramePool::new(16384, 2);
        // parking (skip threshold) keeps the hole in the second frame from
        // recombining away.
        let mut buddy = Buddy::new(pool.clone(), 16);
        let c2k = class_of(&buddy, 2048);

        // fill the first frame completely with eight 2K blocks.
        let first: Vec<ZipBlock> = (0..8)
            .map(|_| buddy.allocate(c2k, || pool.alloc_zeroed()).unwrap())
            .collect();
        let src = first[3];
        let owner = PageRef {
            slot: 9,
            generation: 3,
        };
        buddy.set_owner(src, owner);
        unsafe { buddy.block_slice_mut(src).fill(0x7E) };

        // the ninth allocation carves a second frame; freeing it leaves a
        // same-class hole there.
        let hole = buddy.allocate(c2k, || pool.alloc_zeroed()).unwrap();
        let second_frame = hole.frame;
        assert_ne!(second_frame, src.frame);
        assert!(buddy.free(hole).is_none());

        let avoid: FxHashSet<FrameRef> = [src.frame].into_iter().collect();
        let (dst, _released) = buddy
            .relocate(src, false, &avoid, |o| o == Some(owner))
            .expect("relocation failed");
        assert_eq!(dst.frame, second_frame);
        assert_eq!(buddy.owner_of(dst), Some(owner));
        assert_eq!(buddy.owner_of(src), None);
        unsafe {
            assert!(buddy.block_slice(dst).iter().all(|&b| b == 0x7E));
        }
    }

    #[test]
    fn realloc_preserves_prefix() {
        let pool = FramePool::new(16384, 2);
        let mut buddy = Buddy::new(pool.clone(), 0);
        let src = buddy
            .allocate(class_of(&buddy, 1024), || pool.alloc_zeroed())
            .unwrap();
        unsafe {
            buddy.block_slice_mut(src)[..8].copy_from_slice(b"burrowed");
        }
        let (dst, _) = buddy
            .realloc(src, class_of(&buddy, 4096), || pool.alloc_zeroed())
            .unwrap();
        assert_eq!(dst.class, class_of(&buddy, 4096));
        unsafe {
            assert_eq!(&buddy.block_slice(dst)[..8], b"burrowed");
        }
    }

    #[test]
    fn free_stamp_written_and_cleared() {
        let pool = FramePool::new(16384, 1);
        let mut buddy = Buddy::new(pool.clone(), 0);
        let c4k = class_of(&buddy, 4096);
        let a = buddy.allocate(c4k, || pool.alloc_zeroed()).unwrap();
        // sibling free blocks carry the stamp in-band.
        let sibling = ZipBlock {
            frame: a.frame,
            offset: a.offset ^ 4096,
            class: c4k,
        };
        assert_eq!(buddy.read_stamp(sibling), FREE_STAMP);
        assert_eq!(buddy.read_stamp(a), 0);
        let b = buddy.allocate(c4k, || None).unwrap();
        assert_eq!(b.offset, sibling.offset);
        assert_eq!(buddy.read_stamp(b), 0);
    }
}
