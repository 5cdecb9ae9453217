//! Directory enumeration and fsync adapters.
//!
//! Thin pass-throughs to the engine. They hold no state and only normalize
//! the engine's error to a status that is `0` or negative.

use tracing::instrument;

use crate::engine::{FileKind, Ino, StorageEngine};
use crate::error::{PageSyncError, status};
use crate::inode::Inode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: Ino,
    pub kind: FileKind,
    /// Cursor of this entry.
    pub pos: u64,
}

/// Receiver of directory entries. Returns `false` once it cannot take more;
/// the refused entry is offered again on the next call.
pub trait DirSink: Send {
    fn fill(&mut self, name: &str, pos: u64, ino: Ino, kind: FileKind) -> bool;
}

impl DirSink for Vec<DirEntry> {
    fn fill(&mut self, name: &str, pos: u64, ino: Ino, kind: FileKind) -> bool {
        self.push(DirEntry {
            name: name.to_string(),
            ino,
            kind,
            pos,
        });
        true
    }
}

/// A sink with room for a fixed number of entries, like a reply buffer.
#[derive(Debug)]
pub struct DirBuffer {
    entries: Vec<DirEntry>,
    capacity: usize,
}

impl DirBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }
}

impl DirSink for DirBuffer {
    fn fill(&mut self, name: &str, pos: u64, ino: Ino, kind: FileKind) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        DirSink::fill(&mut self.entries, name, pos, ino, kind)
    }
}

#[instrument(level = "trace", skip(engine, inode, sink), fields(ino = inode.ino()))]
pub async fn readdir<E: StorageEngine + ?Sized>(
    engine: &E,
    inode: &Inode,
    sink: &mut dyn DirSink,
    pos: &mut u64,
) -> i32 {
    let res = engine
        .readdir(inode.ino(), sink, pos)
        .await
        .map_err(PageSyncError::from);
    let status = status(res);
    debug_assert!(status <= 0);
    status
}

#[instrument(level = "trace", skip(engine, inode), fields(ino = inode.ino()))]
pub async fn fsync<E: StorageEngine + ?Sized>(engine: &E, inode: &Inode, datasync: bool) -> i32 {
    let res = engine
        .fsync(inode.ino(), datasync)
        .await
        .map_err(PageSyncError::from);
    let status = status(res);
    debug_assert!(status <= 0);
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemEngine;

    fn dir_inode(ino: Ino) -> Inode {
        Inode::new(ino, FileKind::Directory, 4096)
    }

    #[tokio::test]
    async fn test_readdir_lists_dot_entries_and_children() {
        let engine = MemEngine::new();
        engine.create_file(MemEngine::ROOT_INO, "b").unwrap();
        engine.mkdir(MemEngine::ROOT_INO, "a").unwrap();

        let mut out: Vec<DirEntry> = Vec::new();
        let mut pos = 0;
        let status = readdir(&engine, &dir_inode(MemEngine::ROOT_INO), &mut out, &mut pos).await;
        assert_eq!(status, 0);
        let names: Vec<_> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "a", "b"]);
        assert_eq!(out[2].kind, FileKind::Directory);
        assert_eq!(pos, 4);
    }

    #[tokio::test]
    async fn test_readdir_resumes_from_cursor() {
        let engine = MemEngine::new();
        for name in ["x", "y", "z"] {
            engine.create_file(MemEngine::ROOT_INO, name).unwrap();
        }
        let root = dir_inode(MemEngine::ROOT_INO);
        let mut pos = 0;

        let mut first = DirBuffer::with_capacity(3);
        assert_eq!(readdir(&engine, &root, &mut first, &mut pos).await, 0);
        assert_eq!(first.entries().len(), 3);
        assert_eq!(pos, 3);

        let mut rest = DirBuffer::with_capacity(8);
        assert_eq!(readdir(&engine, &root, &mut rest, &mut pos).await, 0);
        let names: Vec<_> = rest.into_entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["y", "z"]);
    }

    #[tokio::test]
    async fn test_readdir_error_is_negative() {
        let engine = MemEngine::new();
        let file = engine.create_file(MemEngine::ROOT_INO, "f").unwrap();
        let mut out: Vec<DirEntry> = Vec::new();
        let mut pos = 0;
        let status = readdir(&engine, &dir_inode(file), &mut out, &mut pos).await;
        assert_eq!(status, -libc::ENOTDIR);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_fsync_passes_through() {
        let engine = MemEngine::new();
        let file = engine.create_file(MemEngine::ROOT_INO, "f").unwrap();
        let inode = Inode::new(file, FileKind::Regular, 4096);
        assert_eq!(fsync(&engine, &inode, true).await, 0);
        assert_eq!(engine.stats().fsyncs, 1);
        assert_eq!(fsync(&engine, &dir_inode(999), false).await, -libc::ENOENT);
    }
}
