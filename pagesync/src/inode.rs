//! File objects as seen by this layer.

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::engine::{FileKind, Ino};
use crate::page::AddressSpace;

/// A storage-engine object backing a file, plus the host page frame cache
/// that mirrors it once the file is mapped.
///
/// The size is not stored here: the engine owns it.
pub struct Inode {
    ino: Ino,
    kind: FileKind,
    // set once by `mmap::mark_mapped`, never cleared
    pub(crate) mapped: Mutex<bool>,
    // serializes appenders from the size lookup to the end of the write
    append: AsyncMutex<()>,
    mapping: AddressSpace,
}

impl Inode {
    pub fn new(ino: Ino, kind: FileKind, page_size: usize) -> Self {
        Self {
            ino,
            kind,
            mapped: Mutex::new(false),
            append: AsyncMutex::new(()),
            mapping: AddressSpace::new(page_size),
        }
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_mapped(&self) -> bool {
        *self.mapped.lock()
    }

    pub(crate) async fn lock_append(&self) -> MutexGuard<'_, ()> {
        self.append.lock().await
    }

    /// Host page frame cache for this file.
    pub fn mapping(&self) -> &AddressSpace {
        &self.mapping
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("mapped", &self.is_mapped())
            .field("resident_pages", &self.mapping.nr_pages())
            .finish()
    }
}
