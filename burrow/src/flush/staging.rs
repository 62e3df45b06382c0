//! The double-write staging buffer.
//!
//! Before a flush batch's pages are written to their final locations, the
//! whole batch is written sequentially to a staging file and synced. Only
//! after that sync are the individual page writes released; a torn final
//! write can then be repaired from the staging copy by the recovery layer
//! (which is outside this crate — only the write-side contract lives here).

use anyhow::Context as _;
use std::{
    fs::File,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::page_id::PageId;

pub struct StagingBuffer {
    file: File,
    frame_size: usize,
    batches_staged: AtomicU64,
}

impl StagingBuffer {
    pub fn create(path: &Path, frame_size: usize) -> anyhow::Result<StagingBuffer> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating staging buffer at {}", path.display()))?;
        Ok(StagingBuffer {
            file,
            frame_size,
            batches_staged: AtomicU64::new(0),
        })
    }

    /// Write every page image of the batch to the staging area and sync.
    /// After this returns Ok, the final writes may be released: whatever
    /// tears, one intact copy of each page exists.
    pub fn stage_batch(&self, pages: &[(PageId, &[u8])]) -> anyhow::Result<()> {
        use std::os::unix::fs::FileExt as _;
        for (i, (_, image)) in pages.iter().enumerate() {
            debug_assert!(image.len() <= self.frame_size);
            self.file
                .write_all_at(image, (i * self.frame_size) as u64)
                .context("staging write failed")?;
        }
        self.file.sync_data().context("staging sync failed")?;
        self.batches_staged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Called once the batch's final writes have completed: the staged
    /// copies are no longer needed.
    pub fn reset(&self) -> anyhow::Result<()> {
        self.file.set_len(0)?;
        Ok(())
    }

    pub fn batches_staged(&self) -> u64 {
        self.batches_staged.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::create(&dir.path().join("dblwr"), 4096).unwrap();
        let a = vec![0xAA; 4096];
        let b = vec![0xBB; 2048];
        let pages: Vec<(PageId, &[u8])> =
            vec![(PageId::new(1, 0), &a), (PageId::new(1, 7), &b)];
        staging.stage_batch(&pages).unwrap();
        assert_eq!(staging.batches_staged(), 1);
        assert_eq!(staging.file.metadata().unwrap().len(), 4096 + 2048);
        staging.reset().unwrap();
        assert_eq!(staging.file.metadata().unwrap().len(), 0);
    }
}
