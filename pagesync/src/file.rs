//! Inbound file operations.
//!
//! [`FileOps`] is the entry point the host calls for both regular files and
//! directories. Directories accept `llseek`, `readdir` and `fsync`; reading,
//! writing or mapping one fails.
//!
//! Explicit reads and writes go to the primary cache only. A write to a
//! mapped file is followed by [`PageSync::update_pages`] so resident page
//! frames never lag behind the primary cache. Neither path creates page
//! frames; that is left to [`FileOps::fault`].

use std::io::SeekFrom;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::aops::{CacheSync, PageSync};
use crate::config::PageSyncConfig;
use crate::dir::{self, DirSink};
use crate::engine::{FileKind, Ino, StorageEngine};
use crate::error::{PageSyncError, Result};
use crate::inode::Inode;
use crate::mmap::{GenericMmap, VmArea, VmHost, establish_mapping};
use crate::page::{Page, WritebackControl, filemap_fault, write_cache_pages};
use crate::rw::{read_common, write_common};
use crate::uio::{IoFlags, Origin};

/// Largest size a file opened without `LARGEFILE` may have.
const MAX_NON_LFS: u64 = (1 << 31) - 1;

/// An open file: the inode, the file position and the open flags.
#[derive(Debug)]
pub struct OpenFile {
    inode: Arc<Inode>,
    pos: u64,
    flags: IoFlags,
}

impl OpenFile {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn flags(&self) -> IoFlags {
        self.flags
    }
}

pub struct FileOps<E: ?Sized, H = GenericMmap> {
    engine: Arc<E>,
    sync: CacheSync<E>,
    host: H,
    page_size: usize,
    writeback_batch: usize,
}

impl<E: StorageEngine + ?Sized> FileOps<E, GenericMmap> {
    pub fn new(engine: Arc<E>, config: &PageSyncConfig) -> Self {
        Self::with_host(engine, config, GenericMmap)
    }
}

impl<E: StorageEngine + ?Sized, H: VmHost> FileOps<E, H> {
    pub fn with_host(engine: Arc<E>, config: &PageSyncConfig, host: H) -> Self {
        Self {
            sync: CacheSync::new(engine.clone(), config.max_offset),
            engine,
            host,
            page_size: config.page_size,
            writeback_batch: config.writeback_batch,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn sync(&self) -> &CacheSync<E> {
        &self.sync
    }

    /// Builds the in-memory inode for an engine object.
    pub fn new_inode(&self, ino: Ino, kind: FileKind) -> Arc<Inode> {
        Arc::new(Inode::new(ino, kind, self.page_size))
    }

    pub fn open(&self, inode: Arc<Inode>, flags: IoFlags) -> Result<OpenFile> {
        if !inode.is_dir()
            && !flags.contains(IoFlags::LARGEFILE)
            && self.engine.size(inode.ino()) > MAX_NON_LFS
        {
            return Err(PageSyncError::Overflow);
        }
        Ok(OpenFile {
            inode,
            pos: 0,
            flags,
        })
    }

    pub fn llseek(&self, file: &mut OpenFile, whence: SeekFrom) -> Result<u64> {
        let pos = match whence {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::Current(delta) => file.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self
                .engine
                .size(file.inode.ino())
                .checked_add_signed(delta),
        };
        let pos = pos
            .filter(|p| *p <= self.sync.limit())
            .ok_or_else(|| PageSyncError::InvalidArgument(format!("bad seek {whence:?}")))?;
        file.pos = pos;
        Ok(pos)
    }

    #[instrument(level = "trace", skip_all, fields(ino = file.inode.ino(), pos = file.pos, len = buf.len()))]
    pub async fn read(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        if file.inode.is_dir() {
            return Err(PageSyncError::IsDirectory);
        }
        let n = read_common(
            &*self.engine,
            file.inode.ino(),
            buf,
            file.pos,
            Origin::External,
            file.flags,
            self.sync.limit(),
        )
        .await?;
        file.pos += n as u64;
        Ok(n)
    }

    #[instrument(level = "trace", skip_all, fields(ino = file.inode.ino(), pos = file.pos, len = buf.len()))]
    pub async fn write(&self, file: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        let inode = file.inode.clone();
        if inode.is_dir() {
            return Err(PageSyncError::IsDirectory);
        }
        let (pos, flags, _append) = if file.flags.contains(IoFlags::APPEND) {
            let guard = inode.lock_append().await;
            let size = self.engine.size(inode.ino());
            (size, file.flags - IoFlags::APPEND, Some(guard))
        } else {
            (file.pos, file.flags, None)
        };

        // resident pages stay locked until refreshed, so no write-back of a
        // stale frame can land on top of this write
        let held = if inode.is_mapped() {
            inode.mapping().lock_range(pos, buf.len()).await
        } else {
            Vec::new()
        };

        let n = write_common(
            &*self.engine,
            inode.ino(),
            buf,
            pos,
            Origin::External,
            flags,
            self.sync.limit(),
        )
        .await?;

        if n > 0 && inode.is_mapped() {
            // the primary cache took the write; a failed refresh surfaces at the next flush
            if let Err(e) = self.sync.update_pages(&inode, held, pos, n).await {
                warn!(ino = inode.ino(), error = %e, "failed to refresh mapped pages");
                inode.mapping().set_error(e.errno());
            }
        }
        file.pos = pos + n as u64;
        Ok(n)
    }

    /// Enumerates entries from the file position. Returns `0` or a negative
    /// errno.
    pub async fn readdir(&self, file: &mut OpenFile, sink: &mut dyn DirSink) -> i32 {
        if !file.inode.is_dir() {
            return -libc::ENOTDIR;
        }
        dir::readdir(&*self.engine, &file.inode, sink, &mut file.pos).await
    }

    pub fn mmap(&self, file: &OpenFile, vma: &VmArea) -> Result<()> {
        establish_mapping(&self.host, &file.inode, vma)
    }

    /// Host page fault on a mapped file.
    pub async fn fault(&self, file: &OpenFile, index: u64) -> Result<Arc<Page>> {
        if !file.inode.is_mapped() {
            return Err(PageSyncError::InvalidArgument(
                "fault on a file that was never mapped".into(),
            ));
        }
        let i_size = self.engine.size(file.inode.ino());
        filemap_fault(&self.sync, &file.inode, i_size, index).await
    }

    pub async fn writeback(&self, inode: &Inode, wbc: &mut WritebackControl) -> Result<usize> {
        write_cache_pages(&self.sync, inode, wbc).await
    }

    /// One bounded background pass, as the host's flusher would run.
    pub async fn background_writeback(&self, inode: &Inode) -> Result<usize> {
        let mut wbc = WritebackControl::background(self.writeback_batch);
        self.writeback(inode, &mut wbc).await
    }

    /// Writes back dirty pages, reports any deferred write-back error, then
    /// asks the engine for durability. Returns `0` or a negative errno.
    #[instrument(level = "debug", skip_all, fields(ino = file.inode.ino(), datasync))]
    pub async fn fsync(&self, file: &OpenFile, datasync: bool) -> i32 {
        let inode = &file.inode;
        if inode.is_mapped() {
            let mut wbc = WritebackControl::integrity();
            if let Err(e) = self.writeback(inode, &mut wbc).await {
                inode.mapping().take_error();
                return e.to_status();
            }
            debug!(pages = wbc.pages_written, "flushed mapped pages");
        }
        if let Some(errno) = inode.mapping().take_error() {
            return -errno.code();
        }
        dir::fsync(&*self.engine, inode, datasync).await
    }

    /// Close. Reports a deferred write-back error nobody has seen yet.
    pub fn release(&self, file: OpenFile) -> Result<()> {
        match file.inode.mapping().take_error() {
            Some(errno) => Err(errno.into()),
            None => Ok(()),
        }
    }
}
