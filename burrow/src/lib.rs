//! A buffer pool for disk-based storage engines: a fixed-memory cache of
//! database pages with midpoint-LRU replacement, a binary buddy
//! sub-allocator for compressed pages, and a staged dirty-page flush
//! pipeline.
//!
//! The pool sits between the engine and its tablespace layer: pages are
//! fetched and pinned through [`BufferPool::fetch`], modified under their
//! content latch, marked dirty with the LSN of their redo record, and
//! written back by flush batches that preserve durability ordering. The
//! pool is sharded into independent instances to keep lock contention off
//! the hot path.
//!
//! The tablespace layer, redo log, and codecs are collaborators behind the
//! [`PageSource`] and [`PageCodec`] traits; this crate owns caching,
//! replacement, compressed-block packing and write-back only.

use anyhow::Context as _;
use crossbeam_channel::{select, tick, Sender};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

pub mod io;
mod options;
mod page_id;
mod readahead;

pub(crate) mod flush;
pub(crate) mod pool;

pub use crate::io::{FileSource, IoStatus, NoopCodec, PageCodec, PageSource};
pub use crate::options::Options;
pub use crate::page_id::{PageId, SpaceId, MAX_SPACE_ID};
pub use crate::pool::buddy::{FREE_STAMP, MIN_ZIP_SIZE, STAMP_OFFSET};
pub use crate::pool::stats::StatsSnapshot;
pub use crate::pool::{FetchError, FetchMode, PageHandle, PageReadGuard, PageWriteGuard};
pub use flush::FlushOutcome;

use flush::{workers::FlushWorkers, FlushClass};
use pool::{PoolConfig, PoolInstance};

/// The page cache façade: a set of sharded pool instances plus the I/O and
/// flush worker machinery they share.
pub struct BufferPool {
    shared: Arc<Shared>,
}

struct Shared {
    instances: Vec<Arc<PoolInstance>>,
    workers: Arc<FlushWorkers>,
    control_stop: Sender<()>,
    control: Mutex<Option<JoinHandle<()>>>,
    lru_flush_min: usize,
    shut_down: AtomicBool,
}

impl BufferPool {
    /// Create a pool. `source` is the tablespace layer, `codec` the
    /// validation/compression transform applied at the I/O boundary.
    pub fn new(
        o: Options,
        source: Arc<dyn PageSource>,
        codec: Arc<dyn PageCodec>,
    ) -> anyhow::Result<BufferPool> {
        anyhow::ensure!(o.frame_size.is_power_of_two(), "frame size not a power of two");
        anyhow::ensure!(
            o.frame_size >= pool::buddy::MIN_ZIP_SIZE,
            "frame size below the minimum compressed page size"
        );
        anyhow::ensure!(o.instances >= 1, "at least one pool instance required");
        anyhow::ensure!(
            o.pool_frames >= o.instances * 4,
            "pool of {} frames is too small for {} instances",
            o.pool_frames,
            o.instances
        );
        anyhow::ensure!(o.old_ratio_pct >= 5 && o.old_ratio_pct <= 95, "old ratio out of range");
        anyhow::ensure!(o.io_workers >= 1, "at least one i/o worker required");
        anyhow::ensure!(o.flush_workers >= 1, "at least one flush worker required");

        let frames_per_instance = o.pool_frames / o.instances;
        let config = Arc::new(PoolConfig {
            frame_size: o.frame_size,
            pool_frames: frames_per_instance,
            old_ratio: o.old_ratio_pct * pool::lru::OLD_RATIO_DIV / 100,
            old_tolerance: o.old_tolerance,
            old_min_len: o.old_min_len,
            scan_threshold: o.scan_threshold,
            lru_scan_depth: o.lru_scan_depth,
            neighbor_flushing: o.neighbor_flushing,
            read_ahead: o.read_ahead,
            random_read_ahead: o.random_read_ahead,
            read_ahead_area: o.read_ahead_area,
            linear_threshold: o.linear_threshold,
            io_to_unzip_factor: o.io_to_unzip_factor,
            free_low_water: o.free_low_water,
            lru_flush_min: o.lru_flush_min,
            buddy_skip_threshold: o.buddy_recombine_skip,
        });

        let io = Arc::new(io::start_io_pool(o.io_workers, source.clone()));

        let mut instances = Vec::with_capacity(o.instances);
        for index in 0..o.instances {
            let staging = match &o.staging_path {
                Some(root) => {
                    let path = root.with_extension(format!("dblwr.{index}"));
                    Some(
                        flush::staging::StagingBuffer::create(&path, o.frame_size)
                            .context("creating staging buffer")?,
                    )
                }
                None => None,
            };
            instances.push(PoolInstance::new(
                index,
                config.clone(),
                source.clone(),
                codec.clone(),
                io.clone(),
                staging,
            ));
        }

        let workers = Arc::new(FlushWorkers::spawn(o.flush_workers, instances.clone()));
        let bg_handle = io.make_handle();
        for instance in &instances {
            *instance.workers.lock() = Arc::downgrade(&workers);
            *instance.bg_io.lock() = Some(bg_handle.clone());
        }

        // the control thread drains background read completions and ticks
        // the rolling statistics.
        let (control_stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let control = {
            let instances = instances.clone();
            std::thread::Builder::new()
                .name("buf-control".into())
                .spawn(move || {
                    let ticker = tick(Duration::from_secs(1));
                    loop {
                        select! {
                            recv(stop_rx) -> _ => {
                                // drain whatever completions are already
                                // queued before going away.
                                while let Ok(complete) = bg_handle.try_recv() {
                                    dispatch_completion(&instances, complete);
                                }
                                return;
                            }
                            recv(bg_handle.receiver()) -> msg => {
                                let Ok(complete) = msg else { return };
                                dispatch_completion(&instances, complete);
                            }
                            recv(ticker) -> _ => {
                                for instance in &instances {
                                    instance.stats.tick();
                                }
                            }
                        }
                    }
                })
                .expect("spawning control thread")
        };

        Ok(BufferPool {
            shared: Arc::new(Shared {
                instances,
                workers,
                control_stop,
                control: Mutex::new(Some(control)),
                lru_flush_min: o.lru_flush_min,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    fn instance_for(&self, id: &PageId) -> &Arc<PoolInstance> {
        let n = self.shared.instances.len();
        let shard = fxhash::hash64(id) as usize % n;
        &self.shared.instances[shard]
    }

    /// Acquire a pinned handle to a page. The pin is released when the
    /// handle drops.
    pub fn fetch(&self, id: PageId, mode: FetchMode) -> Result<PageHandle, FetchError> {
        self.instance_for(&id).fetch(id, mode)
    }

    /// Record a modification of a pinned page. The caller guarantees the
    /// redo record at `lsn` is durable before this page could be flushed.
    pub fn mark_dirty(&self, handle: &PageHandle, lsn: u64) {
        handle.mark_dirty(lsn);
    }

    /// Checkpoint/administrative flush: write back up to `min_pages` dirty
    /// pages (plus opportunistic neighbors) older than `lsn_limit`, across
    /// all instances in parallel. Returns the number of pages written.
    pub fn request_flush(&self, min_pages: usize, lsn_limit: Option<u64>) -> usize {
        let n = self.shared.instances.len();
        let per_instance = (min_pages + n - 1) / n;
        self.shared.workers.flush_all(
            n,
            FlushClass::List,
            per_instance,
            lsn_limit.unwrap_or(u64::MAX),
        )
    }

    /// Age-driven flushing: when the oldest dirty page trails `durable_lsn`
    /// by more than `max_age`, flush enough of the flush-list tail to close
    /// the gap. The durable LSN only schedules work here; durability
    /// ordering was the caller's obligation when the pages were dirtied.
    pub fn flush_for_checkpoint_age(
        &self,
        durable_lsn: u64,
        max_age: u64,
        batch: usize,
    ) -> usize {
        match self.oldest_modification() {
            Some(oldest) if durable_lsn.saturating_sub(oldest) > max_age => {
                self.request_flush(batch, Some(durable_lsn.saturating_sub(max_age)))
            }
            _ => 0,
        }
    }

    /// Memory-pressure flush: give every instance an LRU-tail batch.
    pub fn flush_lru_tail(&self) -> usize {
        let n = self.shared.instances.len();
        self.shared
            .workers
            .flush_all(n, FlushClass::Lru, self.shared.lru_flush_min, u64::MAX)
    }

    /// Enter or leave crash-recovery mode. In recovery mode the flush list
    /// accepts out-of-order LSNs, paying for a tree index that is torn
    /// down on exit.
    pub fn set_recovery_mode(&self, recovery: bool) {
        for instance in &self.shared.instances {
            instance.flush.lock().set_recovery_mode(recovery);
        }
    }

    /// The oldest unflushed modification across the pool — the LSN the
    /// engine may checkpoint up to. `None` when fully clean.
    pub fn oldest_modification(&self) -> Option<u64> {
        self.shared
            .instances
            .iter()
            .filter_map(|i| i.flush.lock().oldest_lsn())
            .min()
    }

    /// Live shrink to `new_pool_frames` total frames, spread evenly across
    /// instances. Returns the number of frames actually withdrawn.
    pub fn shrink(&self, new_pool_frames: usize) -> usize {
        let per_instance = new_pool_frames / self.shared.instances.len();
        self.shared
            .instances
            .iter()
            .map(|i| i.shrink(per_instance))
            .sum()
    }

    /// Drop every resident page. Panics if any page is pinned or dirty;
    /// flush first.
    pub fn invalidate_all(&self) {
        for instance in &self.shared.instances {
            instance.invalidate_all();
        }
    }

    pub fn resident_pages(&self) -> usize {
        self.shared.instances.iter().map(|i| i.resident_pages()).sum()
    }

    /// Frames currently sitting on the free lists.
    pub fn free_frames(&self) -> usize {
        self.shared.instances.iter().map(|i| i.free_frames()).sum()
    }

    pub fn dirty_pages(&self) -> usize {
        self.shared.instances.iter().map(|i| i.dirty_pages()).sum()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        for instance in &self.shared.instances {
            snapshot.add(&instance.stats);
        }
        snapshot
    }

    /// Orderly teardown: stop read-ahead, retire the flush workers via the
    /// two-phase handshake, and drain in-flight I/O before queues go away.
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // no new speculative reads.
        for instance in &self.shared.instances {
            *instance.bg_io.lock() = None;
        }
        self.shared.workers.shutdown();
        for instance in &self.shared.instances {
            instance.drain_io();
        }
        let _ = self.shared.control_stop.send(());
        if let Some(handle) = self.shared.control.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_completion(instances: &[Arc<PoolInstance>], complete: io::CompleteIo) {
    let instance = complete.command.user_data as usize;
    let id = complete.command.kind.page_id();
    let status = complete.status;
    let buf = complete.command.kind.into_buf();
    if let Some(pool) = instances.get(instance) {
        readahead::complete_background_read(pool, id, buf, status);
    }
}
