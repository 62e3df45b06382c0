//! Speculative page prefetching.
//!
//! Linear read-ahead watches for sequential access patterns: when a border
//! page of an aligned window is touched and the window's pages were
//! accessed in a consistent direction, the next window in that direction is
//! fired as one batch of asynchronous reads. Random read-ahead (off by
//! default) fires the *current* window once enough of it is already hot.
//!
//! Fired reads return immediately; completions land on a shared background
//! handle drained by the completer thread, which installs or discards the
//! pages. Speculative work never blocks a foreground request: frames come
//! from the soft allocation path and a cap on in-flight reads sheds load.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::io::{IoCommand, IoKind, IoStatus};
use crate::page_id::PageId;
use crate::pool::descriptor::PageState;
use crate::pool::{GetFreeMode, Install, PoolInstance};

/// In-flight reads are capped at this fraction of the pool.
const PEND_READS_DIV: usize = 2;

fn effective_area(pool: &PoolInstance) -> u32 {
    pool.config
        .read_ahead_area
        .min((pool.config.pool_frames as u32 / 32).max(1))
}

/// Linear read-ahead trigger; called after a page access.
pub(crate) fn maybe_linear(pool: &Arc<PoolInstance>, id: PageId) {
    if !pool.config.read_ahead {
        return;
    }
    let area = effective_area(pool);
    if area < 2 || !id.is_window_border(area) {
        return;
    }
    if pool.source.space_is_stopping(id.space) {
        return;
    }
    let window = id.aligned_window(area);
    if window.end > pool.source.space_size(id.space) {
        // the area is not whole; no pattern to extend.
        return;
    }
    if pool.pending_reads.load(Ordering::Relaxed) > pool.config.pool_frames / PEND_READS_DIV {
        return;
    }

    // border at the low end means the scan runs descending.
    let ascending = id.page_no != window.start;

    // how many unaccessed or out-of-order pages the pattern tolerates.
    let fail_allowed = (64u32.saturating_sub(pool.config.linear_threshold)).min(area);
    let mut fails = 0u32;
    let mut prev_stamp: Option<u64> = None;
    for pn in window.clone() {
        let desc = pool
            .hash
            .get(&id.with_page_no(pn))
            .and_then(|r| pool.registry.get(r));
        match desc {
            Some(desc) if desc.is_accessed() => {
                let stamp = desc.access_time();
                if let Some(prev) = prev_stamp {
                    // first-access stamps of a linear scan are ordered in
                    // the scan direction; tolerate a few stragglers that
                    // were already resident before the scan began.
                    let in_order = if ascending { stamp >= prev } else { stamp <= prev };
                    if !in_order {
                        fails += 1;
                    }
                }
                prev_stamp = Some(stamp);
            }
            _ => fails += 1,
        }
        if fails > fail_allowed {
            return;
        }
    }

    let next_low = if ascending {
        window.end
    } else {
        match window.start.checked_sub(area) {
            Some(low) => low,
            None => return,
        }
    };
    fire_window(pool, id, next_low..next_low + area);
}

/// Random read-ahead trigger; called on a cache miss before the foreground
/// read is issued.
pub(crate) fn maybe_random(pool: &Arc<PoolInstance>, id: PageId) {
    if !pool.config.random_read_ahead {
        return;
    }
    let area = effective_area(pool);
    if area < 2 || pool.source.space_is_stopping(id.space) {
        return;
    }
    let mut window = id.aligned_window(area);
    window.end = window.end.min(pool.source.space_size(id.space));
    if pool.pending_reads.load(Ordering::Relaxed) > pool.config.pool_frames / PEND_READS_DIV {
        return;
    }

    // enough recently-accessed young pages in the window suggest the rest
    // will be wanted too.
    let threshold = 5 + area as usize / 8;
    let mut recent = 0usize;
    for pn in window.clone() {
        let desc = pool
            .hash
            .get(&id.with_page_no(pn))
            .and_then(|r| pool.registry.get(r));
        if let Some(desc) = desc {
            if desc.is_accessed() && !desc.is_old() {
                recent += 1;
                if recent >= threshold {
                    fire_window(pool, id, window);
                    return;
                }
            }
        }
    }
}

/// Install and submit asynchronous reads for every absent page of the
/// window. Stops quietly when the pool has no spare memory.
fn fire_window(pool: &Arc<PoolInstance>, anchor: PageId, window: std::ops::Range<u32>) {
    let Some(handle) = pool.bg_io.lock().clone() else {
        return;
    };
    for pn in window {
        let id = anchor.with_page_no(pn);
        if pool.hash.get(&id).is_some() {
            continue;
        }
        let desc = match pool.install_page(id, PageState::ReadInProgress, GetFreeMode::Soft) {
            Install::Installed(desc) => desc,
            Install::Raced => continue,
            Install::NoMemory => return,
        };
        // no caller waits on a speculative read; the io-fix alone protects
        // the page until completion.
        desc.unpin();
        let read_len = pool
            .source
            .zip_size(id.space)
            .unwrap_or(pool.config.frame_size);
        pool.pending_reads.fetch_add(1, Ordering::Relaxed);
        if handle
            .send(IoCommand {
                kind: IoKind::Read(id, vec![0u8; read_len]),
                user_data: pool.index as u64,
            })
            .is_err()
        {
            // io pool is shutting down; undo and stop.
            pool.pending_reads.fetch_sub(1, Ordering::Relaxed);
            pool.complete_read(&desc, Vec::new(), IoStatus::ShortRead).ok();
            pool.evict_corrupt(&desc);
            return;
        }
    }
}

/// Apply one background read completion: install the page or drop it.
pub(crate) fn complete_background_read(
    pool: &Arc<PoolInstance>,
    id: PageId,
    buf: Vec<u8>,
    status: IoStatus,
) {
    pool.pending_reads.fetch_sub(1, Ordering::Relaxed);
    let Some(desc) = pool.hash.get(&id).and_then(|r| pool.registry.get(r)) else {
        return;
    };
    if desc.state() != PageState::ReadInProgress {
        return;
    }
    match pool.complete_read(&desc, buf, status) {
        Ok(()) => {
            pool.stats
                .readahead_pages_read
                .fetch_add(1, Ordering::Relaxed);
        }
        Err(status) => {
            // a bad speculative page is simply dropped; whoever actually
            // wants it will read it (and surface the error) themselves.
            log::debug!("read-ahead of page {id} failed ({status:?}); dropping");
            pool.evict_corrupt(&desc);
        }
    }
}
