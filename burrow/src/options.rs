use std::path::PathBuf;

/// Options when creating a [`crate::BufferPool`].
///
/// The numeric defaults are tuned starting points, not correctness
/// requirements; every one of them can be overridden.
pub struct Options {
    /// Size of one pool frame in bytes. Must be a power of two.
    pub(crate) frame_size: usize,
    /// Total frame budget, split across instances.
    pub(crate) pool_frames: usize,
    /// Number of independent pool instances (sharded by page id hash).
    pub(crate) instances: usize,
    /// The number of I/O worker threads.
    pub(crate) io_workers: usize,
    /// The number of flush worker threads.
    pub(crate) flush_workers: usize,
    /// Old-segment share of the LRU list, in percent.
    pub(crate) old_ratio_pct: u32,
    /// Hysteresis around the old-segment target length, in pages.
    pub(crate) old_tolerance: usize,
    /// LRU length at which midpoint tracking activates.
    pub(crate) old_min_len: usize,
    /// Bounded eviction scan depth on the first attempt.
    pub(crate) scan_threshold: usize,
    /// Max pages examined by one LRU flush batch.
    pub(crate) lru_scan_depth: usize,
    pub(crate) neighbor_flushing: bool,
    pub(crate) read_ahead: bool,
    pub(crate) random_read_ahead: bool,
    /// Aligned window size for read-ahead and neighbor flushing, in pages.
    pub(crate) read_ahead_area: u32,
    /// Sequential-access strictness for linear read-ahead, out of 64;
    /// higher is stricter.
    pub(crate) linear_threshold: u32,
    /// One I/O counts for this many decompressions in the unzip-LRU
    /// eviction decision.
    pub(crate) io_to_unzip_factor: u64,
    /// Free-list size below which a background flush is signaled.
    pub(crate) free_low_water: usize,
    /// Pages per starvation-triggered LRU flush batch.
    pub(crate) lru_flush_min: usize,
    /// Buddy recombination is skipped while a class free list is shorter
    /// than this (0 = always recombine).
    pub(crate) buddy_recombine_skip: usize,
    /// Enable the double-write staging buffer, rooted at this path.
    pub(crate) staging_path: Option<PathBuf>,
}

impl Options {
    pub fn new() -> Self {
        Options {
            frame_size: 16 * 1024,
            pool_frames: 1024,
            instances: 1,
            io_workers: 3,
            flush_workers: 2,
            old_ratio_pct: 37,
            old_tolerance: 20,
            old_min_len: 80,
            scan_threshold: 100,
            lru_scan_depth: 128,
            neighbor_flushing: true,
            read_ahead: true,
            random_read_ahead: false,
            read_ahead_area: 64,
            linear_threshold: 56,
            io_to_unzip_factor: 50,
            free_low_water: 8,
            lru_flush_min: 8,
            buddy_recombine_skip: 0,
            staging_path: None,
        }
    }

    pub fn frame_size(&mut self, bytes: usize) {
        self.frame_size = bytes;
    }

    pub fn pool_frames(&mut self, frames: usize) {
        self.pool_frames = frames;
    }

    pub fn instances(&mut self, instances: usize) {
        self.instances = instances;
    }

    pub fn io_workers(&mut self, workers: usize) {
        self.io_workers = workers;
    }

    pub fn flush_workers(&mut self, workers: usize) {
        self.flush_workers = workers;
    }

    /// Old-segment percentage plus its hysteresis tolerance.
    pub fn old_blocks(&mut self, pct: u32, tolerance: usize) {
        self.old_ratio_pct = pct;
        self.old_tolerance = tolerance;
    }

    pub fn old_min_len(&mut self, len: usize) {
        self.old_min_len = len;
    }

    pub fn scan_threshold(&mut self, pages: usize) {
        self.scan_threshold = pages;
    }

    pub fn lru_scan_depth(&mut self, pages: usize) {
        self.lru_scan_depth = pages;
    }

    pub fn neighbor_flushing(&mut self, enabled: bool) {
        self.neighbor_flushing = enabled;
    }

    pub fn read_ahead(&mut self, enabled: bool) {
        self.read_ahead = enabled;
    }

    pub fn random_read_ahead(&mut self, enabled: bool) {
        self.random_read_ahead = enabled;
    }

    pub fn read_ahead_area(&mut self, pages: u32) {
        self.read_ahead_area = pages;
    }

    pub fn linear_threshold(&mut self, threshold: u32) {
        self.linear_threshold = threshold.min(64);
    }

    pub fn io_to_unzip_factor(&mut self, factor: u64) {
        self.io_to_unzip_factor = factor;
    }

    pub fn free_low_water(&mut self, frames: usize) {
        self.free_low_water = frames;
    }

    pub fn lru_flush_min(&mut self, pages: usize) {
        self.lru_flush_min = pages;
    }

    pub fn buddy_recombine_skip(&mut self, threshold: usize) {
        self.buddy_recombine_skip = threshold;
    }

    pub fn staging_path(&mut self, path: impl Into<PathBuf>) {
        self.staging_path = Some(path.into());
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}
