//! Host page frame cache.
//!
//! This is the host side of the protocol: page frames, their lock and state
//! bits, the per-file [`AddressSpace`] that indexes them, and the two host
//! drivers that call into [`PageSync`]: [`filemap_fault`] on first touch of a
//! mapped page and [`write_cache_pages`] when dirty pages are flushed.
//!
//! ## Locking
//!
//! Each page carries its own lock. A [`LockedPage`] is the proof that the
//! lock is held; dropping it unlocks the page, so a handler that consumes a
//! `LockedPage` releases the lock on every exit path. Only the lock of one
//! page is held at a time and the `AddressSpace` index lock is never held
//! across an `.await`.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as FrameMutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use crate::aops::PageSync;
use crate::error::{Errno, PageSyncError, Result};
use crate::inode::Inode;

/// Fill byte of freshly allocated frames. Anything a fault-in fails to
/// overwrite shows up as this value.
pub const PAGE_POISON: u8 = 0x6b;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        /// Held by the host for the duration of a fault-in or write-back.
        const LOCKED = 1 << 0;
        /// Frame content reflects the primary cache.
        const UPTODATE = 1 << 1;
        /// The last fault-in or write-back failed.
        const ERROR = 1 << 2;
        /// Modified through a mapping since the last write-back.
        const DIRTY = 1 << 3;
    }
}

/// A page frame, identified by its owning address space and index.
pub struct Page {
    index: u64,
    size: usize,
    flags: AtomicU32,
    frame: Arc<FrameMutex<Box<[u8]>>>,
}

impl Page {
    fn new(index: u64, size: usize) -> Self {
        Self {
            index,
            size,
            flags: AtomicU32::new(0),
            frame: Arc::new(FrameMutex::new(vec![PAGE_POISON; size].into_boxed_slice())),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte offset of the page within its file.
    pub fn offset(&self) -> u64 {
        self.index * self.size as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_locked(&self) -> bool {
        self.flags().contains(PageFlags::LOCKED)
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags().contains(PageFlags::UPTODATE)
    }

    pub fn is_error(&self) -> bool {
        self.flags().contains(PageFlags::ERROR)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    fn set(&self, f: PageFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    fn clear(&self, f: PageFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    /// Sleeps until the page lock is available.
    pub async fn lock(self: &Arc<Self>) -> LockedPage {
        let frame = self.frame.clone().lock_owned().await;
        self.set(PageFlags::LOCKED);
        LockedPage {
            page: self.clone(),
            frame,
        }
    }

    pub fn try_lock(self: &Arc<Self>) -> Option<LockedPage> {
        let frame = self.frame.clone().try_lock_owned().ok()?;
        self.set(PageFlags::LOCKED);
        Some(LockedPage {
            page: self.clone(),
            frame,
        })
    }

    /// A store by a process that has this page mapped. Dirties the page.
    pub async fn user_store(self: &Arc<Self>, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= self.size)
            .ok_or_else(|| {
                PageSyncError::InvalidArgument(format!(
                    "store of {} bytes at {offset} crosses the page",
                    bytes.len()
                ))
            })?;
        let mut page = self.lock().await;
        page.frame[offset..end].copy_from_slice(bytes);
        page.set_dirty();
        Ok(())
    }

    /// A load by a process that has this page mapped.
    pub async fn user_load(self: &Arc<Self>, offset: usize, len: usize) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| {
                PageSyncError::InvalidArgument(format!(
                    "load of {len} bytes at {offset} crosses the page"
                ))
            })?;
        let page = self.lock().await;
        Ok(page.frame[offset..end].to_vec())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page whose lock is held. Dropping it unlocks the page.
pub struct LockedPage {
    page: Arc<Page>,
    frame: OwnedMutexGuard<Box<[u8]>>,
}

impl LockedPage {
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn index(&self) -> u64 {
        self.page.index
    }

    pub fn offset(&self) -> u64 {
        self.page.offset()
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.frame
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.frame
    }

    pub fn set_uptodate(&self) {
        self.page.set(PageFlags::UPTODATE);
    }

    pub fn clear_uptodate(&self) {
        self.page.clear(PageFlags::UPTODATE);
    }

    pub fn set_error(&self) {
        self.page.set(PageFlags::ERROR);
    }

    pub fn clear_error(&self) {
        self.page.clear(PageFlags::ERROR);
    }

    pub fn set_dirty(&self) {
        self.page.set(PageFlags::DIRTY);
    }

    /// Hands the dirty state to a write-back about to start.
    pub fn clear_dirty_for_io(&self) -> bool {
        let was = self.page.is_dirty();
        self.page.clear(PageFlags::DIRTY);
        was
    }

    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for LockedPage {
    fn drop(&mut self) {
        self.page.clear(PageFlags::LOCKED);
    }
}

/// Publishes frame contents written under the page lock to every other
/// observer of the frame.
pub fn flush_dcache_page(_page: &LockedPage) {
    fence(Ordering::Release);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Background flush: skip pages that are busy.
    None,
    /// Integrity flush: wait for every dirty page.
    All,
}

/// Parameters of one host writeback pass.
#[derive(Debug, Clone)]
pub struct WritebackControl {
    pub sync_mode: SyncMode,
    /// Pages left to write in this pass.
    pub nr_to_write: usize,
    pub pages_written: usize,
}

impl WritebackControl {
    pub fn new(sync_mode: SyncMode, nr_to_write: usize) -> Self {
        Self {
            sync_mode,
            nr_to_write,
            pages_written: 0,
        }
    }

    /// Writes every dirty page and waits for busy ones.
    pub fn integrity() -> Self {
        Self::new(SyncMode::All, usize::MAX)
    }

    /// Writes at most `batch` pages, `0` meaning no bound.
    pub fn background(batch: usize) -> Self {
        let nr = if batch == 0 { usize::MAX } else { batch };
        Self::new(SyncMode::None, nr)
    }
}

/// Per-file index of resident page frames, plus the deferred write-back
/// error reported at the next flush.
pub struct AddressSpace {
    page_size: usize,
    pages: RwLock<BTreeMap<u64, Arc<Page>>>,
    wb_err: Mutex<Option<Errno>>,
}

impl AddressSpace {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: RwLock::new(BTreeMap::new()),
            wb_err: Mutex::new(None),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn index_of(&self, offset: u64) -> u64 {
        offset / self.page_size as u64
    }

    /// Indices of the pages overlapping `[pos, pos + len)`, `None` when
    /// `len` is zero.
    pub fn index_range(&self, pos: u64, len: usize) -> Option<RangeInclusive<u64>> {
        if len == 0 {
            return None;
        }
        let end = pos.saturating_add(len as u64);
        Some(self.index_of(pos)..=self.index_of(end - 1))
    }

    /// Locks the resident pages overlapping `[pos, pos + len)`, in index
    /// order. Never creates pages.
    pub async fn lock_range(&self, pos: u64, len: usize) -> Vec<LockedPage> {
        let Some(range) = self.index_range(pos, len) else {
            return Vec::new();
        };
        let mut locked = Vec::new();
        for page in self.resident_pages(range) {
            locked.push(page.lock().await);
        }
        locked
    }

    /// Looks up a resident page. Never creates one.
    pub fn find_page(&self, index: u64) -> Option<Arc<Page>> {
        self.pages.read().get(&index).cloned()
    }

    fn find_or_create_page(&self, index: u64) -> Arc<Page> {
        self.pages
            .write()
            .entry(index)
            .or_insert_with(|| Arc::new(Page::new(index, self.page_size)))
            .clone()
    }

    /// Resident pages whose index lies in `range`, in index order.
    pub fn resident_pages(&self, range: RangeInclusive<u64>) -> Vec<Arc<Page>> {
        self.pages
            .read()
            .range(range)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn dirty_pages(&self) -> Vec<Arc<Page>> {
        self.pages
            .read()
            .values()
            .filter(|p| p.is_dirty())
            .cloned()
            .collect()
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.read().len()
    }

    /// Records a write-back failure for the next flush or close.
    pub fn set_error(&self, errno: Errno) {
        *self.wb_err.lock() = Some(errno);
    }

    /// Returns and clears the recorded write-back failure.
    pub fn take_error(&self) -> Option<Errno> {
        self.wb_err.lock().take()
    }
}

/// Host fault path: returns an up-to-date page for `index`, calling
/// [`PageSync::readpage`] when the page is missing or invalid. This is the
/// only place page frames are created.
#[instrument(level = "debug", skip(sync, inode), fields(ino = inode.ino()))]
pub async fn filemap_fault<S: PageSync + ?Sized>(
    sync: &S,
    inode: &Inode,
    i_size: u64,
    index: u64,
) -> Result<Arc<Page>> {
    let mapping = inode.mapping();
    let offset = index
        .checked_mul(mapping.page_size() as u64)
        .ok_or(PageSyncError::Overflow)?;
    if offset >= i_size {
        return Err(PageSyncError::BeyondEof {
            offset,
            size: i_size,
        });
    }

    let page = mapping.find_or_create_page(index);
    if page.is_uptodate() {
        return Ok(page);
    }
    let locked = page.lock().await;
    if page.is_uptodate() {
        // filled while we waited for the lock
        return Ok(page);
    }
    sync.readpage(inode, locked).await?;
    Ok(page)
}

/// Host writeback pass over the dirty pages of `inode`.
///
/// A page's dirty bit is handed to the write-back under the page lock and put
/// back if the write-back fails, so it is only lost on success. Failures are
/// also recorded on the address space for the next flush.
#[instrument(level = "debug", skip(sync, inode, wbc), fields(ino = inode.ino()))]
pub async fn write_cache_pages<S: PageSync + ?Sized>(
    sync: &S,
    inode: &Inode,
    wbc: &mut WritebackControl,
) -> Result<usize> {
    let mapping = inode.mapping();
    let mut first_err = None;
    let mut written = 0;

    for page in mapping.dirty_pages() {
        if wbc.nr_to_write == 0 {
            break;
        }
        let locked = match wbc.sync_mode {
            SyncMode::All => page.lock().await,
            SyncMode::None => match page.try_lock() {
                Some(locked) => locked,
                None => continue,
            },
        };
        if !locked.clear_dirty_for_io() {
            continue;
        }

        match sync.writepage(inode, locked, wbc).await {
            Ok(_) => {
                written += 1;
                wbc.nr_to_write -= 1;
                wbc.pages_written += 1;
            }
            Err(e) => {
                warn!(index = page.index(), error = %e, "write-back failed, page stays dirty");
                page.set(PageFlags::DIRTY);
                mapping.set_error(e.errno());
                first_err.get_or_insert(e);
            }
        }
    }

    debug!(written, "writeback pass done");
    match first_err {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_guard_releases_on_drop() {
        let page = Arc::new(Page::new(3, 4096));
        assert_eq!(page.offset(), 3 * 4096);
        {
            let locked = page.lock().await;
            assert!(page.is_locked());
            assert!(page.try_lock().is_none());
            locked.set_error();
        }
        assert!(!page.is_locked());
        assert!(page.is_error());
        assert!(page.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_user_store_dirties() {
        let page = Arc::new(Page::new(0, 512));
        page.user_store(10, b"abc").await.unwrap();
        assert!(page.is_dirty());
        assert_eq!(page.user_load(10, 3).await.unwrap(), b"abc");
        // untouched bytes keep the poison pattern of a fresh frame
        assert_eq!(page.user_load(0, 1).await.unwrap(), vec![PAGE_POISON]);
        assert!(page.user_store(510, b"abc").await.is_err());
    }

    #[test]
    fn test_find_page_never_creates() {
        let mapping = AddressSpace::new(4096);
        assert!(mapping.find_page(0).is_none());
        assert_eq!(mapping.nr_pages(), 0);
        let page = mapping.find_or_create_page(2);
        assert!(Arc::ptr_eq(&page, &mapping.find_page(2).unwrap()));
        assert_eq!(mapping.resident_pages(0..=1).len(), 0);
        assert_eq!(mapping.resident_pages(0..=2).len(), 1);
        assert_eq!(mapping.index_of(8192), 2);
    }

    #[tokio::test]
    async fn test_lock_range_takes_resident_pages_in_order() {
        let mapping = AddressSpace::new(4096);
        for index in [5, 1, 3] {
            mapping.find_or_create_page(index);
        }
        assert!(mapping.index_range(100, 0).is_none());
        assert_eq!(mapping.index_range(4095, 2), Some(0..=1));

        let locked = mapping.lock_range(4096, 3 * 4096).await;
        let indices: Vec<_> = locked.iter().map(|p| p.index()).collect();
        assert_eq!(indices, [1, 3]);
        assert!(mapping.find_page(3).unwrap().is_locked());
        assert!(!mapping.find_page(5).unwrap().is_locked());
        assert_eq!(mapping.nr_pages(), 3);
        drop(locked);
        assert!(!mapping.find_page(1).unwrap().is_locked());
    }

    #[test]
    fn test_deferred_error_is_taken_once() {
        let mapping = AddressSpace::new(4096);
        mapping.set_error(Errno::EIO);
        assert_eq!(mapping.take_error(), Some(Errno::EIO));
        assert_eq!(mapping.take_error(), None);
    }

    #[test]
    fn test_background_batch_zero_is_unbounded() {
        assert_eq!(WritebackControl::background(0).nr_to_write, usize::MAX);
        assert_eq!(WritebackControl::background(4).nr_to_write, 4);
        assert_eq!(WritebackControl::integrity().sync_mode, SyncMode::All);
    }
}
