//! The page hash: (space, page_no) → descriptor handle.
//!
//! Buckets carry their own reader/writer latches, separate from the pool's
//! structural mutex. The bucket latch is the authority for "is this page
//! still at this identity": eviction and relocation take the write latch,
//! re-validate, and unlink under it, so a concurrent lookup can never
//! observe a half-evicted page.

use fxhash::hash64;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::page_id::PageId;
use crate::pool::descriptor::PageRef;

type Chain = Vec<(PageId, PageRef)>;

pub struct PageHash {
    buckets: Vec<RwLock<Chain>>,
    mask: usize,
    len: AtomicUsize,
}

impl PageHash {
    pub fn new(n_buckets: usize) -> Self {
        let n_buckets = n_buckets.next_power_of_two().max(16);
        PageHash {
            buckets: (0..n_buckets).map(|_| RwLock::new(Vec::new())).collect(),
            mask: n_buckets - 1,
            len: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, id: &PageId) -> &RwLock<Chain> {
        &self.buckets[hash64(id) as usize & self.mask]
    }

    pub fn get(&self, id: &PageId) -> Option<PageRef> {
        let chain = self.bucket(id).read();
        chain.iter().find(|(k, _)| k == id).map(|&(_, r)| r)
    }

    pub fn insert(&self, id: PageId, page_ref: PageRef) {
        let mut chain = self.bucket(&id).write();
        debug_assert!(!chain.iter().any(|(k, _)| *k == id), "duplicate hash insert");
        chain.push((id, page_ref));
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, id: &PageId) -> Option<PageRef> {
        let mut chain = self.bucket(id).write();
        let pos = chain.iter().position(|(k, _)| k == id)?;
        let (_, r) = chain.swap_remove(pos);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(r)
    }

    /// Take the bucket write latch for `id`, allowing a re-validate /
    /// unlink sequence with no window for concurrent lookups.
    pub fn lock_bucket(&self, id: &PageId) -> BucketGuard<'_> {
        BucketGuard {
            chain: self.bucket(id).write(),
            len: &self.len,
        }
    }

    /// Take the bucket read latch for `id`. Holding it excludes eviction of
    /// any page in the bucket, which is what makes lookup-then-pin safe.
    pub fn read_bucket(&self, id: &PageId) -> BucketReadGuard<'_> {
        BucketReadGuard {
            chain: self.bucket(id).read(),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

pub struct BucketReadGuard<'a> {
    chain: RwLockReadGuard<'a, Chain>,
}

impl BucketReadGuard<'_> {
    pub fn get(&self, id: &PageId) -> Option<PageRef> {
        self.chain.iter().find(|(k, _)| k == id).map(|&(_, r)| r)
    }
}

pub struct BucketGuard<'a> {
    chain: RwLockWriteGuard<'a, Chain>,
    len: &'a AtomicUsize,
}

impl BucketGuard<'_> {
    pub fn get(&self, id: &PageId) -> Option<PageRef> {
        self.chain.iter().find(|(k, _)| k == id).map(|&(_, r)| r)
    }

    pub fn insert(&mut self, id: PageId, page_ref: PageRef) {
        debug_assert!(self.get(&id).is_none(), "duplicate hash insert");
        self.chain.push((id, page_ref));
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove `id` only if it still maps to `expected`.
    pub fn remove_if(&mut self, id: &PageId, expected: PageRef) -> bool {
        let pos = self
            .chain
            .iter()
            .position(|(k, r)| k == id && *r == expected);
        match pos {
            Some(pos) => {
                self.chain.swap_remove(pos);
                self.len.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}
