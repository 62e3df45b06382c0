//! The LRU replacement policy with midpoint insertion.
//!
//! The list is split into a "young" head segment of proven-hot pages and an
//! "old" tail segment where freshly loaded pages start out. `old` points at
//! the head-most old page — the midpoint. The old segment is kept at a
//! configurable fraction of the total length, with hysteresis so the
//! boundary does not thrash on every insert and remove. A large sequential
//! scan therefore churns only the old segment and cannot flush out the hot
//! working set.
//!
//! All methods require the pool's structural mutex to be held.

use std::sync::Arc;

use crate::pool::descriptor::{PageDescriptor, Registry};
use crate::pool::list::SlotList;
use crate::pool::stats::Stats;

/// Denominator of the old-segment ratio.
pub const OLD_RATIO_DIV: u32 = 1024;

/// Default old-segment ratio: 37% of the list, the classic midpoint.
pub const DEFAULT_OLD_RATIO: u32 = 379;

/// Allowed drift of the old-segment length around its target before the
/// boundary is moved.
pub const DEFAULT_OLD_TOLERANCE: usize = 20;

/// Minimum list length before midpoint tracking activates. Below this the
/// list is one undivided segment.
pub const DEFAULT_OLD_MIN_LEN: usize = 80;

/// Young pages the boundary always leaves alone at the head.
pub const NON_OLD_MIN_LEN: usize = 5;

/// Bounded tail-scan length for eviction on the first attempt.
pub const SEARCH_SCAN_THRESHOLD: usize = 100;

/// One I/O is weighted as this many decompressions when deciding which
/// sublist eviction should prefer.
pub const IO_TO_UNZIP_FACTOR: u64 = 50;

pub struct LruCache {
    lru: SlotList,
    unzip: SlotList,
    /// Midpoint: head-most old page, `None` while the list is short.
    old: Option<u32>,
    old_len: usize,
    old_ratio: u32,
    old_tolerance: usize,
    old_min_len: usize,
}

impl LruCache {
    pub fn new(old_ratio: u32, old_tolerance: usize, old_min_len: usize) -> Self {
        assert!(old_ratio <= OLD_RATIO_DIV);
        // the boundary must always have room to sit strictly inside the
        // list once tracking activates.
        assert!(
            old_ratio as usize * old_min_len
                > OLD_RATIO_DIV as usize * (old_tolerance + NON_OLD_MIN_LEN),
            "old ratio/min-len/tolerance combination leaves no old segment"
        );
        LruCache {
            lru: SlotList::new(),
            unzip: SlotList::new(),
            old: None,
            old_len: 0,
            old_ratio,
            old_tolerance,
            old_min_len,
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn lru_list(&self) -> &SlotList {
        &self.lru
    }

    pub fn unzip_list(&self) -> &SlotList {
        &self.unzip
    }

    pub fn old_len(&self) -> usize {
        self.old_len
    }

    pub fn midpoint(&self) -> Option<u32> {
        self.old
    }

    /// Insert a page. `old` puts it at the midpoint (the common case for
    /// freshly read pages); otherwise it goes to the head. A very short
    /// list takes everything at the head regardless.
    pub fn insert(&mut self, desc: &Arc<PageDescriptor>, old: bool, registry: &Registry) {
        let slot = desc.slot();
        if !old || self.lru.len() < self.old_min_len {
            self.lru.push_head(slot);
        } else {
            // unwrap: old is Some whenever len >= old_min_len.
            let mid = self.old.unwrap();
            self.lru.insert_after(mid, slot);
            self.old_len += 1;
        }

        if self.lru.len() > self.old_min_len {
            desc.set_old(old);
            self.adjust_old_len(registry);
        } else if self.lru.len() == self.old_min_len {
            self.old_init(registry);
        } else {
            desc.set_old(self.old.is_some());
        }

        if desc.belongs_to_unzip() {
            self.unzip_insert(desc, old);
        }
    }

    pub fn unzip_insert(&mut self, desc: &Arc<PageDescriptor>, old: bool) {
        if old {
            self.unzip.push_tail(desc.slot());
        } else {
            self.unzip.push_head(desc.slot());
        }
    }

    pub fn unzip_remove(&mut self, desc: &Arc<PageDescriptor>) {
        if self.unzip.contains(desc.slot()) {
            self.unzip.remove(desc.slot());
        }
    }

    /// Move an old-segment page to the head. Promotion of already-young
    /// pages is a no-op; they are hot enough where they are.
    pub fn make_young(&mut self, desc: &Arc<PageDescriptor>, registry: &Registry, stats: &Stats) {
        if desc.is_old() {
            stats
                .pages_made_young
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.remove(desc, registry);
        self.insert(desc, false, registry);
    }

    /// Unlink a page from the LRU (and unzip) list, fixing up the midpoint.
    pub fn remove(&mut self, desc: &Arc<PageDescriptor>, registry: &Registry) {
        let slot = desc.slot();
        let prev = self.lru.prev(slot);

        // if the midpoint is exactly this page, the predecessor becomes the
        // new boundary. It exists: the boundary never drifts closer than
        // tolerance + NON_OLD_MIN_LEN to the head.
        if self.old == Some(slot) {
            // unwrap: see above.
            let prev = prev.unwrap();
            self.old = Some(prev);
            let prev_desc = registry.get_slot(prev).expect("LRU slot without descriptor");
            prev_desc.set_old(true);
            self.old_len += 1;
        }

        self.lru.remove(slot);
        self.unzip_remove(desc);

        if self.lru.len() < self.old_min_len {
            // too short for midpoint tracking: one undivided segment.
            if self.old.is_some() {
                for s in self.lru.iter() {
                    let d = registry.get_slot(s).expect("LRU slot without descriptor");
                    d.set_old(false);
                }
                self.old = None;
                self.old_len = 0;
            }
            return;
        }

        if desc.is_old() {
            self.old_len -= 1;
        }
        self.adjust_old_len(registry);
    }

    /// Move the midpoint so the old-segment length lands back inside
    /// [target - tolerance, target + tolerance].
    fn adjust_old_len(&mut self, registry: &Registry) {
        // unwrap: only called with midpoint tracking active.
        let len = self.lru.len();
        let new_len = (len * self.old_ratio as usize / OLD_RATIO_DIV as usize)
            .min(len - (self.old_tolerance + NON_OLD_MIN_LEN));

        loop {
            let old = self.old.expect("midpoint lost while tracking active");
            if self.old_len + self.old_tolerance < new_len {
                // grow the old segment one step toward the head.
                let prev = self.lru.prev(old).expect("old segment reached the head");
                let prev_desc = registry.get_slot(prev).expect("LRU slot without descriptor");
                prev_desc.set_old(true);
                self.old = Some(prev);
                self.old_len += 1;
            } else if self.old_len > new_len + self.old_tolerance {
                // shrink it one step toward the tail.
                let old_desc = registry.get_slot(old).expect("LRU slot without descriptor");
                old_desc.set_old(false);
                self.old = self.lru.next(old);
                self.old_len -= 1;
            } else {
                return;
            }
        }
    }

    /// Called when the list first grows to the activation length: mark
    /// everything old, put the boundary at the head, and let the adjust
    /// loop walk it to position.
    fn old_init(&mut self, registry: &Registry) {
        debug_assert_eq!(self.lru.len(), self.old_min_len);
        for slot in self.lru.iter() {
            let desc = registry.get_slot(slot).expect("LRU slot without descriptor");
            desc.set_old(true);
        }
        self.old = self.lru.head();
        self.old_len = self.lru.len();
        self.adjust_old_len(registry);
    }

    /// Whether the next eviction victim should come from the unzip list
    /// (detach a decompressed frame, keep the compressed bytes) rather than
    /// the general LRU.
    ///
    /// I/O-bound regime: decompressing again is cheap relative to a read,
    /// so prefer dropping frames. CPU-bound regime: evict whole pages.
    pub fn should_evict_from_unzip(&self, stats: &Stats, io_to_unzip_factor: u64) -> bool {
        if self.unzip.is_empty() {
            return false;
        }
        // slack: keep hot decompressed frames while the unzip list is small.
        if self.unzip.len() <= self.lru.len() / 10 {
            return false;
        }
        // before eviction has ever started, assume disk bound.
        if stats
            .freed_page_clock
            .load(std::sync::atomic::Ordering::Relaxed)
            == 0
        {
            return true;
        }
        let (io_avg, unzip_avg) = stats.io_unzip_averages();
        unzip_avg <= io_avg * io_to_unzip_factor
    }

    /// Check the midpoint bookkeeping against a full walk. Test support.
    #[cfg(any(test, debug_assertions))]
    pub fn validate(&self, registry: &Registry) {
        let mut seen_old = false;
        let mut counted = 0;
        for slot in self.lru.iter() {
            let desc = registry.get_slot(slot).expect("LRU slot without descriptor");
            if self.old == Some(slot) {
                seen_old = true;
            }
            if seen_old {
                assert!(desc.is_old(), "young page tail-ward of the midpoint");
                counted += 1;
            } else {
                assert!(!desc.is_old(), "old page head-ward of the midpoint");
            }
        }
        assert_eq!(counted, self.old_len);
        assert_eq!(seen_old, self.old.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_id::PageId;
    use quickcheck::{quickcheck, Arbitrary, Gen};

    fn mk(registry: &Registry, n: u32) -> Arc<PageDescriptor> {
        registry.insert(PageId::new(1, n), None)
    }

    // the smallest activation length the default ratio supports with a
    // tolerance of 2 (ratio * min_len must exceed DIV * (tolerance + 5)).
    const TEST_MIN_LEN: usize = 20;
    const TEST_TOLERANCE: usize = 2;

    #[test]
    fn short_list_has_no_midpoint() {
        let registry = Registry::new();
        let mut lru = LruCache::new(DEFAULT_OLD_RATIO, TEST_TOLERANCE, TEST_MIN_LEN);
        let descs: Vec<_> = (0..19).map(|i| mk(&registry, i)).collect();
        for d in &descs {
            lru.insert(d, true, &registry);
        }
        assert_eq!(lru.midpoint(), None);
        assert!(descs.iter().all(|d| !d.is_old()));
        lru.validate(&registry);
    }

    #[test]
    fn midpoint_activates_at_min_len() {
        let registry = Registry::new();
        let mut lru = LruCache::new(DEFAULT_OLD_RATIO, TEST_TOLERANCE, TEST_MIN_LEN);
        let descs: Vec<_> = (0..20).map(|i| mk(&registry, i)).collect();
        for d in &descs {
            lru.insert(d, true, &registry);
        }
        assert!(lru.midpoint().is_some());
        assert!(lru.old_len() > 0 && lru.old_len() < lru.len());
        lru.validate(&registry);
    }

    #[test]
    fn midpoint_insert_lands_in_old_segment() {
        let registry = Registry::new();
        let mut lru = LruCache::new(DEFAULT_OLD_RATIO, TEST_TOLERANCE, TEST_MIN_LEN);
        let descs: Vec<_> = (0..30).map(|i| mk(&registry, i)).collect();
        for d in &descs {
            lru.insert(d, true, &registry);
        }
        let fresh = mk(&registry, 99);
        lru.insert(&fresh, true, &registry);
        assert!(fresh.is_old());
        // head insertion puts a page in the young segment.
        let hot = mk(&registry, 100);
        lru.insert(&hot, false, &registry);
        assert!(!hot.is_old());
        assert_eq!(lru.lru_list().head(), Some(hot.slot()));
        lru.validate(&registry);
    }

    #[test]
    fn make_young_promotes_old_page() {
        let registry = Registry::new();
        let stats = Stats::new();
        let mut lru = LruCache::new(DEFAULT_OLD_RATIO, TEST_TOLERANCE, TEST_MIN_LEN);
        let descs: Vec<_> = (0..24).map(|i| mk(&registry, i)).collect();
        for d in &descs {
            lru.insert(d, true, &registry);
        }
        let victim = lru.lru_list().tail().unwrap();
        let victim_desc = registry.get_slot(victim).unwrap();
        assert!(victim_desc.is_old());
        lru.make_young(&victim_desc, &registry, &stats);
        assert!(!victim_desc.is_old());
        assert_eq!(lru.lru_list().head(), Some(victim));
        assert_eq!(
            stats
                .pages_made_young
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        lru.validate(&registry);
    }

    #[test]
    fn removing_the_midpoint_moves_it_to_the_predecessor() {
        let registry = Registry::new();
        let mut lru = LruCache::new(DEFAULT_OLD_RATIO, TEST_TOLERANCE, TEST_MIN_LEN);
        let descs: Vec<_> = (0..30).map(|i| mk(&registry, i)).collect();
        for d in &descs {
            lru.insert(d, true, &registry);
        }
        let mid = lru.midpoint().unwrap();
        let mid_desc = registry.get_slot(mid).unwrap();
        lru.remove(&mid_desc, &registry);
        assert_ne!(lru.midpoint(), Some(mid));
        lru.validate(&registry);
    }

    #[derive(Debug, Clone)]
    enum Op {
        InsertOld,
        InsertYoung,
        RemoveTail,
        RemoveAt(u8),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Op {
            match u8::arbitrary(g) % 5 {
                0 | 1 => Op::InsertOld,
                2 => Op::InsertYoung,
                3 => Op::RemoveTail,
                _ => Op::RemoveAt(u8::arbitrary(g)),
            }
        }
    }

    quickcheck! {
        // once midpoint tracking is active, the old segment length stays
        // within tolerance of its target under any insert/remove sequence.
        fn old_segment_stays_within_tolerance(ops: Vec<Op>) -> bool {
            let registry = Registry::new();
            let tolerance = TEST_TOLERANCE;
            let min_len = TEST_MIN_LEN;
            let mut lru = LruCache::new(DEFAULT_OLD_RATIO, tolerance, min_len);
            let mut next_page = 0u32;
            for op in ops {
                match op {
                    Op::InsertOld | Op::InsertYoung => {
                        let desc = mk(&registry, next_page);
                        next_page += 1;
                        lru.insert(&desc, matches!(op, Op::InsertOld), &registry);
                    }
                    Op::RemoveTail => {
                        if let Some(slot) = lru.lru_list().tail() {
                            let desc = registry.get_slot(slot).unwrap();
                            lru.remove(&desc, &registry);
                        }
                    }
                    Op::RemoveAt(nth) => {
                        let slots: Vec<u32> = lru.lru_list().iter().collect();
                        if !slots.is_empty() {
                            let slot = slots[nth as usize % slots.len()];
                            let desc = registry.get_slot(slot).unwrap();
                            lru.remove(&desc, &registry);
                        }
                    }
                }
                lru.validate(&registry);
                if lru.len() >= min_len {
                    let len = lru.len();
                    let target = (len * DEFAULT_OLD_RATIO as usize / OLD_RATIO_DIV as usize)
                        .min(len - (tolerance + NON_OLD_MIN_LEN));
                    let lo = target.saturating_sub(tolerance);
                    let hi = target + tolerance;
                    if lru.old_len() < lo || lru.old_len() > hi {
                        return false;
                    }
                }
            }
            true
        }
    }
}
