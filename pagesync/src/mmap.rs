//! Mapped-file state tracking and mapping establishment.

use bitflags::bitflags;
use tracing::{debug, instrument};

use crate::error::{PageSyncError, Result};
use crate::inode::Inode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// A region of a process address space backed by a file.
#[derive(Debug, Clone)]
pub struct VmArea {
    pub start: u64,
    pub len: u64,
    /// File offset of `start`, in pages.
    pub pgoff: u64,
    pub prot: Prot,
    pub shared: bool,
}

/// The host's generic mapping setup.
pub trait VmHost: Send + Sync {
    fn generic_file_mmap(&self, inode: &Inode, vma: &VmArea) -> Result<()>;
}

/// Generic mapping setup: checks the region is page aligned and addressable.
/// Page frames are not populated here; they come from faults.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericMmap;

impl VmHost for GenericMmap {
    fn generic_file_mmap(&self, inode: &Inode, vma: &VmArea) -> Result<()> {
        if inode.is_dir() {
            return Err(PageSyncError::Unsupported("mmap of a directory"));
        }
        let page_size = inode.mapping().page_size() as u64;
        if vma.len == 0 {
            return Err(PageSyncError::InvalidArgument("empty mapping".into()));
        }
        if vma.start % page_size != 0 {
            return Err(PageSyncError::InvalidArgument(format!(
                "mapping start {:#x} is not page aligned",
                vma.start
            )));
        }
        vma.pgoff
            .checked_mul(page_size)
            .and_then(|off| off.checked_add(vma.len))
            .ok_or(PageSyncError::Overflow)?;
        Ok(())
    }
}

/// Records that `inode` has a mapping. Idempotent; the flag is never cleared.
pub fn mark_mapped(inode: &Inode) {
    let mut mapped = inode.mapped.lock();
    if !*mapped {
        debug!(ino = inode.ino(), "file is now mapped");
    }
    *mapped = true;
}

/// Runs the host's generic setup and marks the file mapped only if it
/// succeeded. Setup errors are returned unchanged.
#[instrument(level = "debug", skip(host, inode), fields(ino = inode.ino()))]
pub fn establish_mapping<H: VmHost + ?Sized>(host: &H, inode: &Inode, vma: &VmArea) -> Result<()> {
    host.generic_file_mmap(inode, vma)?;
    mark_mapped(inode);
    Ok(())
}
