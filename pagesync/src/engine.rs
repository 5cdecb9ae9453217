//! Storage engine interface (outbound calls) and an in-memory engine.
//!
//! The engine owns the primary cache and the authoritative file size. This
//! crate never looks inside it: every byte moves through [`StorageEngine::read`]
//! and [`StorageEngine::write`] with a [`Uio`] descriptor. Engines must honour
//! [`IoFlags::DIRECT`] by never calling back into the page frame cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::dir::DirSink;
use crate::error::Errno;
use crate::uio::{IoFlags, Uio};

pub type Ino = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

/// Abstract primary cache. Reads and writes are reentrant and serialized
/// per object by the engine itself.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Current size of `ino` as seen by the primary cache.
    fn size(&self, ino: Ino) -> u64;

    /// Fills `uio` starting at `uio.offset()`. Bytes past end of file are
    /// left in `uio.resid()`.
    async fn read(&self, ino: Ino, uio: &mut Uio<'_>, flags: IoFlags) -> Result<(), Errno>;

    /// Drains `uio` into the object. Whatever could not be stored is left in
    /// `uio.resid()`.
    async fn write(&self, ino: Ino, uio: &mut Uio<'_>, flags: IoFlags) -> Result<(), Errno>;

    /// Emits directory entries starting at cursor `*pos` until `sink` is
    /// full, advancing `*pos` past every accepted entry.
    async fn readdir(&self, ino: Ino, sink: &mut dyn DirSink, pos: &mut u64)
    -> Result<(), Errno>;

    async fn fsync(&self, ino: Ino, datasync: bool) -> Result<(), Errno>;
}

struct MemObject {
    kind: FileKind,
    parent: Ino,
    data: Vec<u8>,
    children: BTreeMap<String, Ino>,
}

impl MemObject {
    fn new(kind: FileKind, parent: Ino) -> Self {
        Self {
            kind,
            parent,
            data: Vec::new(),
            children: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct Faults {
    short_read: Option<usize>,
    short_write: Option<usize>,
    read_error: Option<Errno>,
    write_error: Option<Errno>,
}

/// Transfer counters, split by whether the bypass flag reached the engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub external_reads: u64,
    pub bypass_reads: u64,
    pub external_writes: u64,
    pub bypass_writes: u64,
    pub fsyncs: u64,
}

/// In-memory primary cache with one-shot fault injection, used by the demo
/// binary and the tests.
pub struct MemEngine {
    objects: RwLock<HashMap<Ino, MemObject>>,
    next_ino: AtomicU64,
    faults: Mutex<Faults>,
    stats: Mutex<EngineStats>,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    pub const ROOT_INO: Ino = 1;

    pub fn new() -> Self {
        let mut objects = HashMap::new();
        objects.insert(
            Self::ROOT_INO,
            MemObject::new(FileKind::Directory, Self::ROOT_INO),
        );
        Self {
            objects: RwLock::new(objects),
            next_ino: AtomicU64::new(Self::ROOT_INO + 1),
            faults: Mutex::new(Faults::default()),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    pub fn create_file(&self, parent: Ino, name: &str) -> Result<Ino, Errno> {
        self.create(parent, name, FileKind::Regular)
    }

    pub fn mkdir(&self, parent: Ino, name: &str) -> Result<Ino, Errno> {
        self.create(parent, name, FileKind::Directory)
    }

    fn create(&self, parent: Ino, name: &str, kind: FileKind) -> Result<Ino, Errno> {
        let mut objects = self.objects.write();
        let dir = objects.get_mut(&parent).ok_or(Errno::ENOENT)?;
        if dir.kind != FileKind::Directory {
            return Err(Errno::ENOTDIR);
        }
        if dir.children.contains_key(name) {
            return Err(Errno::new(libc::EEXIST));
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        dir.children.insert(name.to_string(), ino);
        objects.insert(ino, MemObject::new(kind, parent));
        Ok(ino)
    }

    pub fn kind(&self, ino: Ino) -> Option<FileKind> {
        self.objects.read().get(&ino).map(|o| o.kind)
    }

    /// Shrinks or zero-extends a regular file.
    pub fn truncate(&self, ino: Ino, size: u64) -> Result<(), Errno> {
        let size = usize::try_from(size).map_err(|_| Errno::EFBIG)?;
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&ino).ok_or(Errno::ENOENT)?;
        if obj.kind == FileKind::Directory {
            return Err(Errno::new(libc::EISDIR));
        }
        obj.data.resize(size, 0);
        Ok(())
    }

    /// Snapshot of a file's bytes.
    pub fn contents(&self, ino: Ino) -> Option<Vec<u8>> {
        self.objects.read().get(&ino).map(|o| o.data.clone())
    }

    /// The next read transfers at most `max` bytes.
    pub fn inject_short_read(&self, max: usize) {
        self.faults.lock().short_read = Some(max);
    }

    /// The next write stores at most `max` bytes, like a device running out
    /// of space mid-transfer.
    pub fn inject_short_write(&self, max: usize) {
        self.faults.lock().short_write = Some(max);
    }

    pub fn inject_read_error(&self, errno: Errno) {
        self.faults.lock().read_error = Some(errno);
    }

    pub fn inject_write_error(&self, errno: Errno) {
        self.faults.lock().write_error = Some(errno);
    }

    pub fn stats(&self) -> EngineStats {
        *self.stats.lock()
    }
}

#[async_trait]
impl StorageEngine for MemEngine {
    fn size(&self, ino: Ino) -> u64 {
        self.objects
            .read()
            .get(&ino)
            .map(|o| o.data.len() as u64)
            .unwrap_or(0)
    }

    async fn read(&self, ino: Ino, uio: &mut Uio<'_>, flags: IoFlags) -> Result<(), Errno> {
        let (error, short) = {
            let mut faults = self.faults.lock();
            (faults.read_error.take(), faults.short_read.take())
        };
        {
            let mut stats = self.stats.lock();
            if flags.contains(IoFlags::DIRECT) {
                stats.bypass_reads += 1;
            } else {
                stats.external_reads += 1;
            }
        }
        if let Some(e) = error {
            return Err(e);
        }

        let objects = self.objects.read();
        let obj = objects.get(&ino).ok_or(Errno::ENOENT)?;
        if obj.kind == FileKind::Directory {
            return Err(Errno::new(libc::EISDIR));
        }
        let size = obj.data.len() as u64;
        let start = uio.offset();
        if start >= size {
            return Ok(());
        }
        let mut end = start.saturating_add(uio.resid() as u64).min(size);
        if let Some(max) = short {
            end = end.min(start + max as u64);
        }
        let n = uio.copy_out(&obj.data[start as usize..end as usize]);
        trace!(ino, offset = start, n, ?flags, "mem engine read");
        Ok(())
    }

    async fn write(&self, ino: Ino, uio: &mut Uio<'_>, flags: IoFlags) -> Result<(), Errno> {
        let (error, short) = {
            let mut faults = self.faults.lock();
            (faults.write_error.take(), faults.short_write.take())
        };
        {
            let mut stats = self.stats.lock();
            if flags.contains(IoFlags::DIRECT) {
                stats.bypass_writes += 1;
            } else {
                stats.external_writes += 1;
            }
        }
        if let Some(e) = error {
            return Err(e);
        }

        let mut objects = self.objects.write();
        let obj = objects.get_mut(&ino).ok_or(Errno::ENOENT)?;
        if obj.kind == FileKind::Directory {
            return Err(Errno::new(libc::EISDIR));
        }
        if flags.contains(IoFlags::APPEND) {
            uio.set_offset(obj.data.len() as u64);
        }
        let start = uio.offset();
        if start >= uio.limit() {
            return Err(Errno::EFBIG);
        }
        let mut n = (uio.resid() as u64).min(uio.limit() - start) as usize;
        if let Some(max) = short {
            n = n.min(max);
        }
        let start = usize::try_from(start).map_err(|_| Errno::EFBIG)?;
        let end = start.checked_add(n).ok_or(Errno::EFBIG)?;
        if obj.data.len() < end {
            obj.data.resize(end, 0);
        }
        let n = uio.copy_in(&mut obj.data[start..end]);
        trace!(ino, offset = start, n, ?flags, "mem engine write");
        Ok(())
    }

    async fn readdir(
        &self,
        ino: Ino,
        sink: &mut dyn DirSink,
        pos: &mut u64,
    ) -> Result<(), Errno> {
        let objects = self.objects.read();
        let dir = objects.get(&ino).ok_or(Errno::ENOENT)?;
        if dir.kind != FileKind::Directory {
            return Err(Errno::ENOTDIR);
        }

        // cursor 0 is ".", 1 is "..", children follow in name order
        if *pos == 0 {
            if !sink.fill(".", *pos, ino, FileKind::Directory) {
                return Ok(());
            }
            *pos += 1;
        }
        if *pos == 1 {
            if !sink.fill("..", *pos, dir.parent, FileKind::Directory) {
                return Ok(());
            }
            *pos += 1;
        }
        let skip = usize::try_from(*pos - 2).unwrap_or(usize::MAX);
        for (name, child) in dir.children.iter().skip(skip) {
            let kind = objects
                .get(child)
                .map(|o| o.kind)
                .unwrap_or(FileKind::Regular);
            if !sink.fill(name, *pos, *child, kind) {
                break;
            }
            *pos += 1;
        }
        Ok(())
    }

    async fn fsync(&self, ino: Ino, _datasync: bool) -> Result<(), Errno> {
        if !self.objects.read().contains_key(&ino) {
            return Err(Errno::ENOENT);
        }
        self.stats.lock().fsyncs += 1;
        Ok(())
    }
}
