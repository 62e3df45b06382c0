//! Per-instance counters and the rolling I/O vs. decompression statistics
//! consumed by the unzip-LRU eviction heuristic.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of one-tick intervals the rolling averages span.
pub const STAT_INTERVALS: usize = 50;

#[derive(Debug, Clone, Copy, Default)]
struct IntervalStat {
    io: u64,
    unzip: u64,
}

struct Ring {
    intervals: [IntervalStat; STAT_INTERVALS],
    pos: usize,
    sum: IntervalStat,
}

/// Counters for one pool instance.
///
/// The plain counters are monotonic and only ever read for reporting. The
/// `io`/`unzip` pair feeds the rolling ring: the current interval is
/// accumulated in atomics and shifted into the ring by the periodic tick.
pub struct Stats {
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub pages_created: AtomicU64,
    pub pages_evicted: AtomicU64,
    pub pages_made_young: AtomicU64,
    pub readahead_pages_read: AtomicU64,
    /// Pages evicted without ever being accessed: a measure of wasted
    /// read-ahead.
    pub readahead_pages_evicted: AtomicU64,
    /// Total eviction count; doubles as the "has eviction started" signal
    /// for the unzip heuristic.
    pub freed_page_clock: AtomicU64,

    cur_io: AtomicU64,
    cur_unzip: AtomicU64,
    ring: Mutex<Ring>,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            pages_read: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
            pages_created: AtomicU64::new(0),
            pages_evicted: AtomicU64::new(0),
            pages_made_young: AtomicU64::new(0),
            readahead_pages_read: AtomicU64::new(0),
            readahead_pages_evicted: AtomicU64::new(0),
            freed_page_clock: AtomicU64::new(0),
            cur_io: AtomicU64::new(0),
            cur_unzip: AtomicU64::new(0),
            ring: Mutex::new(Ring {
                intervals: [IntervalStat::default(); STAT_INTERVALS],
                pos: 0,
                sum: IntervalStat::default(),
            }),
        }
    }

    pub fn record_io(&self) {
        self.cur_io.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unzip(&self) {
        self.cur_unzip.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current interval and roll it into the ring. Called
    /// periodically by the flush coordinator.
    pub fn tick(&self) {
        let cur = IntervalStat {
            io: self.cur_io.swap(0, Ordering::Relaxed),
            unzip: self.cur_unzip.swap(0, Ordering::Relaxed),
        };
        let mut ring = self.ring.lock();
        let pos = ring.pos;
        let evicted = ring.intervals[pos];
        ring.sum.io = ring.sum.io + cur.io - evicted.io;
        ring.sum.unzip = ring.sum.unzip + cur.unzip - evicted.unzip;
        ring.intervals[pos] = cur;
        ring.pos = (pos + 1) % STAT_INTERVALS;
    }

    /// Rolling averages plus the still-open interval, matching how the
    /// eviction heuristic samples them.
    pub fn io_unzip_averages(&self) -> (u64, u64) {
        let ring = self.ring.lock();
        let io = ring.sum.io / STAT_INTERVALS as u64 + self.cur_io.load(Ordering::Relaxed);
        let unzip = ring.sum.unzip / STAT_INTERVALS as u64 + self.cur_unzip.load(Ordering::Relaxed);
        (io, unzip)
    }
}

/// A point-in-time copy of the counters, aggregated across instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub pages_read: u64,
    pub pages_written: u64,
    pub pages_created: u64,
    pub pages_evicted: u64,
    pub pages_made_young: u64,
    pub readahead_pages_read: u64,
    pub readahead_pages_evicted: u64,
}

impl StatsSnapshot {
    pub fn add(&mut self, stats: &Stats) {
        self.pages_read += stats.pages_read.load(Ordering::Relaxed);
        self.pages_written += stats.pages_written.load(Ordering::Relaxed);
        self.pages_created += stats.pages_created.load(Ordering::Relaxed);
        self.pages_evicted += stats.pages_evicted.load(Ordering::Relaxed);
        self.pages_made_young += stats.pages_made_young.load(Ordering::Relaxed);
        self.readahead_pages_read += stats.readahead_pages_read.load(Ordering::Relaxed);
        self.readahead_pages_evicted += stats.readahead_pages_evicted.load(Ordering::Relaxed);
    }
}
