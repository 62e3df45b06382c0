use burrow::{
    BufferPool, FetchMode, IoStatus, NoopCodec, Options, PageCodec, PageHandle, PageId,
    PageSource, SpaceId,
};
use std::sync::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// An in-memory tablespace layer with per-page read counters and simple
/// fault injection.
pub struct MemSource {
    frame_size: usize,
    spaces: RwLock<HashMap<SpaceId, MemSpace>>,
    reads: RwLock<HashMap<PageId, u64>>,
    corrupt: RwLock<HashSet<PageId>>,
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
}

struct MemSpace {
    pages: HashMap<u32, Vec<u8>>,
    size_pages: u32,
    zip_size: Option<usize>,
    stopping: bool,
}

#[allow(dead_code)]
impl MemSource {
    pub fn new(frame_size: usize) -> Self {
        MemSource {
            frame_size,
            spaces: RwLock::new(HashMap::new()),
            reads: RwLock::new(HashMap::new()),
            corrupt: RwLock::new(HashSet::new()),
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
        }
    }

    pub fn add_space(&self, space: u32, size_pages: u32, zip_size: Option<usize>) {
        self.spaces.write().unwrap().insert(
            SpaceId(space),
            MemSpace {
                pages: HashMap::new(),
                size_pages,
                zip_size,
                stopping: false,
            },
        );
    }

    /// Seed a page image; the first 4 bytes carry the page number so tests
    /// can verify that frames never alias.
    pub fn seed_page(&self, id: PageId, fill: u8) {
        let mut spaces = self.spaces.write().unwrap();
        let space = spaces.get_mut(&id.space).unwrap();
        let len = space.zip_size.unwrap_or(self.frame_size);
        let mut image = vec![fill; len];
        image[..4].copy_from_slice(&id.page_no.to_le_bytes());
        space.pages.insert(id.page_no, image);
    }

    pub fn read_count(&self, id: PageId) -> u64 {
        self.reads.read().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn page_bytes(&self, id: PageId) -> Option<Vec<u8>> {
        self.spaces
            .read().unwrap()
            .get(&id.space)
            .and_then(|s| s.pages.get(&id.page_no).cloned())
    }

    pub fn corrupt_page(&self, id: PageId) {
        self.corrupt.write().unwrap().insert(id);
    }

    pub fn heal_page(&self, id: PageId) {
        self.corrupt.write().unwrap().remove(&id);
    }

    pub fn begin_stopping(&self, space: u32) {
        if let Some(s) = self.spaces.write().unwrap().get_mut(&SpaceId(space)) {
            s.stopping = true;
        }
    }

    /// Remove the space entirely; subsequent I/O reports `SpaceDeleted`.
    pub fn drop_space(&self, space: u32) {
        self.spaces.write().unwrap().remove(&SpaceId(space));
    }
}

impl PageSource for MemSource {
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> IoStatus {
        *self.reads.write().unwrap().entry(id).or_insert(0) += 1;
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        if self.corrupt.read().unwrap().contains(&id) {
            return IoStatus::Corrupted;
        }
        let spaces = self.spaces.read().unwrap();
        let Some(space) = spaces.get(&id.space) else {
            return IoStatus::SpaceDeleted;
        };
        match space.pages.get(&id.page_no) {
            Some(image) if image.len() == buf.len() => {
                buf.copy_from_slice(image);
                IoStatus::Ok
            }
            Some(_) => IoStatus::ShortRead,
            // untouched pages read back as zeroes, like a sparse file.
            None => {
                buf.fill(0);
                IoStatus::Ok
            }
        }
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> IoStatus {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        let mut spaces = self.spaces.write().unwrap();
        let Some(space) = spaces.get_mut(&id.space) else {
            return IoStatus::SpaceDeleted;
        };
        space.pages.insert(id.page_no, buf.to_vec());
        IoStatus::Ok
    }

    fn space_size(&self, space: SpaceId) -> u32 {
        self.spaces.read().unwrap().get(&space).map_or(0, |s| s.size_pages)
    }

    fn space_is_stopping(&self, space: SpaceId) -> bool {
        self.spaces.read().unwrap().get(&space).map_or(true, |s| s.stopping)
    }

    fn zip_size(&self, space: SpaceId) -> Option<usize> {
        self.spaces.read().unwrap().get(&space).and_then(|s| s.zip_size)
    }
}

/// Codec for compressed-space tests: "compression" keeps the payload
/// prefix, so any page whose tail is zero round-trips exactly.
pub struct PrefixCodec;

impl PageCodec for PrefixCodec {
    fn validate(&self, _raw: &[u8]) -> bool {
        true
    }

    fn decompress(&self, raw: &[u8], page: &mut [u8]) -> bool {
        if raw.len() > page.len() {
            return false;
        }
        page[..raw.len()].copy_from_slice(raw);
        page[raw.len()..].fill(0);
        true
    }

    fn compress(&self, page: &[u8], raw: &mut [u8]) -> bool {
        if page[raw.len()..].iter().any(|&b| b != 0) {
            return false;
        }
        raw.copy_from_slice(&page[..raw.len()]);
        true
    }
}

pub struct Test {
    pub pool: BufferPool,
    pub source: Arc<MemSource>,
}

#[allow(dead_code)]
impl Test {
    /// A small single-instance pool with the speculative machinery off, so
    /// tests observe exactly the I/O they cause.
    pub fn quiet(pool_frames: usize, configure: impl FnOnce(&mut Options)) -> Test {
        let mut o = Options::new();
        o.pool_frames(pool_frames);
        o.read_ahead(false);
        o.neighbor_flushing(false);
        o.io_workers(2);
        o.flush_workers(1);
        configure(&mut o);
        let source = Arc::new(MemSource::new(16 * 1024));
        source.add_space(1, 1 << 20, None);
        let pool = BufferPool::new(o, source.clone(), Arc::new(NoopCodec)).unwrap();
        Test { pool, source }
    }

    pub fn fetch(&self, space: u32, page_no: u32) -> PageHandle {
        self.pool
            .fetch(PageId::new(space, page_no), FetchMode::Normal)
            .unwrap()
    }

    pub fn create(&self, space: u32, page_no: u32) -> PageHandle {
        self.pool
            .fetch(PageId::new(space, page_no), FetchMode::AllocateForWrite)
            .unwrap()
    }

    /// Create a page, write a recognizable payload, and mark it dirty.
    pub fn dirty_page(&self, space: u32, page_no: u32, lsn: u64) {
        let handle = self.create(space, page_no);
        {
            let mut bytes = handle.write();
            bytes[..4].copy_from_slice(&page_no.to_le_bytes());
            bytes[4..12].copy_from_slice(&lsn.to_le_bytes());
        }
        handle.mark_dirty(lsn);
    }
}
