//! Asynchronous page I/O.
//!
//! The cache core never touches files directly. Everything below it is
//! reached through [`PageSource`] (the tablespace layer) and [`PageCodec`]
//! (checksum/encryption/compression transforms applied at the I/O boundary).
//! Submission is channel-driven: a fixed set of worker threads drains
//! [`IoCommand`]s and sends [`CompleteIo`]s back to the submitting handle.

use crossbeam_channel::{Receiver, RecvError, SendError, Sender, TryRecvError};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::{fs::File, sync::Arc};
use threadpool::ThreadPool;

use crate::page_id::{PageId, SpaceId};

/// Outcome of a single page read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    /// The bytes came back but failed checksum/decryption validation.
    Corrupted,
    /// Fewer bytes than a full page were transferred.
    ShortRead,
    /// The tablespace was dropped while the request was in flight.
    SpaceDeleted,
}

/// The tablespace layer, as seen by the cache: read/write one page,
/// report space extents, and flag spaces that are being dropped.
pub trait PageSource: Send + Sync + 'static {
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> IoStatus;
    fn write_page(&self, id: PageId, buf: &[u8]) -> IoStatus;
    /// Current size of the space in pages. Reads beyond this are refused.
    fn space_size(&self, space: SpaceId) -> u32;
    /// Whether the space is mid-deletion. Read-ahead and neighbor flushing
    /// skip stopping spaces.
    fn space_is_stopping(&self, space: SpaceId) -> bool;
    /// Compressed page size for the space, if the space stores compressed
    /// pages. `None` means pages are stored uncompressed at frame size.
    fn zip_size(&self, space: SpaceId) -> Option<usize>;
}

/// Transforms applied to page bytes at the I/O boundary only.
pub trait PageCodec: Send + Sync + 'static {
    /// Checksum/decryption validation of raw bytes as they came off disk.
    fn validate(&self, raw: &[u8]) -> bool;
    /// Expand a compressed image into a full frame. `false` = the image is
    /// not decodable, which the cache treats like a failed validation.
    fn decompress(&self, raw: &[u8], page: &mut [u8]) -> bool;
    /// Compress a frame into `raw`. `false` = does not fit.
    fn compress(&self, page: &[u8], raw: &mut [u8]) -> bool;
}

/// Codec for engines that store pages verbatim.
pub struct NoopCodec;

impl PageCodec for NoopCodec {
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
        if page.len() < raw.len() {
            return false;
        }
        // Verbatim storage cannot shrink a page; only a prefix copy when
        // the target is a full frame.
        if raw.len() == page.len() {
            raw.copy_from_slice(page);
            return true;
        }
        false
    }
}

pub enum IoKind {
    /// Read `buf.len()` bytes of the page into `buf`.
    Read(PageId, Vec<u8>),
    /// Write the full buffer to the page's location.
    Write(PageId, Vec<u8>),
}

impl IoKind {
    pub fn page_id(&self) -> PageId {
        match *self {
            IoKind::Read(id, _) | IoKind::Write(id, _) => id,
        }
    }

    pub fn into_buf(self) -> Vec<u8> {
        match self {
            IoKind::Read(_, buf) | IoKind::Write(_, buf) => buf,
        }
    }
}

pub struct IoCommand {
    pub kind: IoKind,
    // not interpreted by the workers, echoed back in the completion.
    pub user_data: u64,
}

pub struct CompleteIo {
    pub command: IoCommand,
    pub status: IoStatus,
}

struct IoPacket {
    command: IoCommand,
    completion_sender: Sender<CompleteIo>,
}

/// Create the I/O worker pool. Workers execute commands against `source`
/// and send responses back via channels to any number of handles.
pub fn start_io_pool(io_workers: usize, source: Arc<dyn PageSource>) -> IoPool {
    assert!(io_workers > 0);
    let (command_tx, command_rx) = crossbeam_channel::unbounded::<IoPacket>();
    let tp = ThreadPool::with_name("buf-io".into(), io_workers);
    for _ in 0..io_workers {
        let command_rx = command_rx.clone();
        let source = source.clone();
        tp.execute(move || loop {
            let Ok(packet) = command_rx.recv() else {
                // All senders dropped: the pool is shutting down.
                return;
            };
            let complete = execute(&*source, packet.command);
            let _ = packet.completion_sender.send(complete);
        });
    }
    IoPool {
        sender: command_tx,
        _tp: tp,
    }
}

fn execute(source: &dyn PageSource, mut command: IoCommand) -> CompleteIo {
    let status = match command.kind {
        IoKind::Read(id, ref mut buf) => source.read_page(id, buf),
        IoKind::Write(id, ref buf) => source.write_page(id, buf),
    };
    CompleteIo { command, status }
}

/// A manager for the broader I/O pool. This can be used to create new I/O
/// handles. Dropping it disconnects the command channel; workers exit once
/// the queue drains.
pub struct IoPool {
    sender: Sender<IoPacket>,
    _tp: ThreadPool,
}

impl IoPool {
    pub fn make_handle(&self) -> IoHandle {
        let (completion_sender, completion_receiver) = crossbeam_channel::unbounded();
        IoHandle {
            sender: self.sender.clone(),
            completion_sender,
            completion_receiver,
        }
    }
}

/// A handle for submitting I/O commands and receiving their completions.
///
/// Only completions for commands submitted on this handle or its clones are
/// received, in no guaranteed order.
#[derive(Clone)]
pub struct IoHandle {
    sender: Sender<IoPacket>,
    completion_sender: Sender<CompleteIo>,
    completion_receiver: Receiver<CompleteIo>,
}

impl IoHandle {
    pub fn send(&self, command: IoCommand) -> Result<(), SendError<IoCommand>> {
        self.sender
            .send(IoPacket {
                command,
                completion_sender: self.completion_sender.clone(),
            })
            .map_err(|SendError(packet)| SendError(packet.command))
    }

    pub fn recv(&self) -> Result<CompleteIo, RecvError> {
        self.completion_receiver.recv()
    }

    pub fn try_recv(&self) -> Result<CompleteIo, TryRecvError> {
        self.completion_receiver.try_recv()
    }

    pub fn receiver(&self) -> &Receiver<CompleteIo> {
        &self.completion_receiver
    }
}

struct SpaceFile {
    file: File,
    size_pages: u32,
    zip_size: Option<usize>,
    stopping: bool,
}

/// A one-file-per-space [`PageSource`] for tests and simple embeddings.
pub struct FileSource {
    frame_size: usize,
    spaces: RwLock<FxHashMap<SpaceId, SpaceFile>>,
}

impl FileSource {
    pub fn new(frame_size: usize) -> Self {
        FileSource {
            frame_size,
            spaces: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn add_space(&self, space: SpaceId, file: File, size_pages: u32, zip_size: Option<usize>) {
        self.spaces.write().insert(
            space,
            SpaceFile {
                file,
                size_pages,
                zip_size,
                stopping: false,
            },
        );
    }

    pub fn begin_stopping(&self, space: SpaceId) {
        if let Some(sf) = self.spaces.write().get_mut(&space) {
            sf.stopping = true;
        }
    }

    fn physical_size(&self, sf: &SpaceFile) -> usize {
        sf.zip_size.unwrap_or(self.frame_size)
    }
}

impl PageSource for FileSource {
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> IoStatus {
        use std::os::unix::fs::FileExt as _;
        let spaces = self.spaces.read();
        let Some(sf) = spaces.get(&id.space) else {
            return IoStatus::SpaceDeleted;
        };
        let offset = id.page_no as u64 * self.physical_size(sf) as u64;
        match sf.file.read_at(buf, offset) {
            Ok(n) if n == buf.len() => IoStatus::Ok,
            // Reading past the end of a sparse, freshly extended space
            // yields zeroes, which is a valid page image of zeroes.
            Ok(0) if id.page_no < sf.size_pages => {
                buf.fill(0);
                IoStatus::Ok
            }
            Ok(_) => IoStatus::ShortRead,
            Err(_) => IoStatus::ShortRead,
        }
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> IoStatus {
        use std::os::unix::fs::FileExt as _;
        let spaces = self.spaces.read();
        let Some(sf) = spaces.get(&id.space) else {
            return IoStatus::SpaceDeleted;
        };
        let offset = id.page_no as u64 * self.physical_size(sf) as u64;
        match sf.file.write_all_at(buf, offset) {
            Ok(()) => IoStatus::Ok,
            Err(_) => IoStatus::ShortRead,
        }
    }

    fn space_size(&self, space: SpaceId) -> u32 {
        self.spaces.read().get(&space).map_or(0, |sf| sf.size_pages)
    }

    fn space_is_stopping(&self, space: SpaceId) -> bool {
        self.spaces.read().get(&space).map_or(true, |sf| sf.stopping)
    }

    fn zip_size(&self, space: SpaceId) -> Option<usize> {
        self.spaces.read().get(&space).and_then(|sf| sf.zip_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("space_1"))
            .unwrap();
        let source = Arc::new(FileSource::new(4096));
        source.add_space(SpaceId(1), file, 16, None);

        let pool = start_io_pool(2, source.clone());
        let handle = pool.make_handle();

        let mut image = vec![0u8; 4096];
        image[0] = 0xAB;
        image[4095] = 0xCD;
        handle
            .send(IoCommand {
                kind: IoKind::Write(PageId::new(1, 3), image.clone()),
                user_data: 7,
            })
            .unwrap();
        let complete = handle.recv().unwrap();
        assert_eq!(complete.status, IoStatus::Ok);
        assert_eq!(complete.command.user_data, 7);

        handle
            .send(IoCommand {
                kind: IoKind::Read(PageId::new(1, 3), vec![0u8; 4096]),
                user_data: 8,
            })
            .unwrap();
        let complete = handle.recv().unwrap();
        assert_eq!(complete.status, IoStatus::Ok);
        assert_eq!(complete.command.kind.into_buf(), image);
    }

    #[test]
    fn deleted_space_reports_status() {
        let source = Arc::new(FileSource::new(4096));
        let pool = start_io_pool(1, source);
        let handle = pool.make_handle();
        handle
            .send(IoCommand {
                kind: IoKind::Read(PageId::new(9, 0), vec![0u8; 4096]),
                user_data: 0,
            })
            .unwrap();
        assert_eq!(handle.recv().unwrap().status, IoStatus::SpaceDeleted);
    }
}
