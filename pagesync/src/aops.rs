//! Synchronization between the primary cache and the page frame cache.
//!
//! The page frame cache is a projection of the primary cache. It is only
//! ever written by the three operations of [`PageSync`]:
//!
//! - `readpage`: fault-in, primary cache -> page frame
//! - `writepage`: write-back, page frame -> primary cache
//! - `update_pages`: after an explicit write, primary cache -> resident
//!   page frames
//!
//! All three move bytes with `Origin::Bypass`, so the engine never re-enters
//! the page frame cache while a page lock is held.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::engine::StorageEngine;
use crate::error::{PageSyncError, Result};
use crate::inode::Inode;
use crate::page::{LockedPage, SyncMode, WritebackControl, flush_dcache_page};
use crate::rw::{read_common, write_common};
use crate::uio::{IoFlags, Origin};

#[async_trait]
pub trait PageSync: Send + Sync {
    /// Fills a locked page with the file contents at its offset and zeroes
    /// the part past end of file. Unlocks the page before returning.
    async fn readpage(&self, inode: &Inode, page: LockedPage) -> Result<()>;

    /// Stores a locked page's bytes into the primary cache. Returns the byte
    /// count, `0` when the file no longer reaches the page. Unlocks the page
    /// before returning.
    async fn writepage(
        &self,
        inode: &Inode,
        page: LockedPage,
        wbc: &WritebackControl,
    ) -> Result<usize>;

    /// Refreshes every resident, up-to-date page overlapping
    /// `[pos, pos + len)` from the primary cache. Never creates pages.
    ///
    /// `held` are the resident pages of the range the caller locked before
    /// writing the primary cache; each is unlocked once refreshed. Pages that
    /// became resident since are then locked and refreshed one at a time.
    /// A page that cannot be refreshed loses its valid bit so the next fault
    /// reads it again; the remaining pages are still refreshed and the first
    /// error is returned. Otherwise returns the number of pages refreshed.
    async fn update_pages(
        &self,
        inode: &Inode,
        held: Vec<LockedPage>,
        pos: u64,
        len: usize,
    ) -> Result<usize>;
}

/// [`PageSync`] over a [`StorageEngine`].
pub struct CacheSync<E: ?Sized> {
    engine: Arc<E>,
    limit: u64,
}

impl<E: StorageEngine + ?Sized> CacheSync<E> {
    /// `limit` is the offset limit put on every descriptor.
    pub fn new(engine: Arc<E>, limit: u64) -> Self {
        Self { engine, limit }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

fn expect_len(offset: u64, expected: usize, res: Result<usize>) -> Result<usize> {
    match res {
        Ok(n) if n == expected => Ok(n),
        Ok(actual) => Err(PageSyncError::Io {
            offset,
            expected,
            actual,
        }),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl<E: StorageEngine + ?Sized> PageSync for CacheSync<E> {
    #[instrument(level = "debug", skip_all, fields(ino = inode.ino(), index = page.index()))]
    async fn readpage(&self, inode: &Inode, mut page: LockedPage) -> Result<()> {
        let ino = inode.ino();
        let off = page.offset();
        let page_size = page.len();
        let i_size = self.engine.size(ino);
        debug_assert!(page.page().is_locked());

        // a shrink racing the fault leaves nothing to read; the page is all zeroes
        let len = i_size.saturating_sub(off).min(page_size as u64) as usize;

        let res = read_common(
            &*self.engine,
            ino,
            &mut page.data_mut()[..len],
            off,
            Origin::Bypass,
            IoFlags::empty(),
            self.limit,
        )
        .await;
        let res = expect_len(off, len, res);

        match &res {
            Ok(_) => {
                if len < page_size {
                    page.data_mut()[len..].fill(0);
                }
                page.clear_error();
                page.set_uptodate();
                flush_dcache_page(&page);
                debug!(len, zeroed = page_size - len, "page faulted in");
            }
            Err(e) => {
                warn!(error = %e, "fault-in failed");
                page.set_error();
                page.clear_uptodate();
            }
        }

        page.unlock();
        res.map(|_| ())
    }

    #[instrument(level = "debug", skip_all, fields(ino = inode.ino(), index = page.index()))]
    async fn writepage(
        &self,
        inode: &Inode,
        page: LockedPage,
        wbc: &WritebackControl,
    ) -> Result<usize> {
        let ino = inode.ino();
        let off = page.offset();
        let i_size = self.engine.size(ino);

        if off >= i_size {
            debug!(i_size, "file no longer reaches the page, nothing to write");
            page.clear_error();
            page.set_uptodate();
            page.unlock();
            return Ok(0);
        }

        let len = (i_size - off).min(page.len() as u64) as usize;
        let flags = match wbc.sync_mode {
            SyncMode::All => IoFlags::SYNC,
            SyncMode::None => IoFlags::empty(),
        };
        let res = write_common(
            &*self.engine,
            ino,
            &page.data()[..len],
            off,
            Origin::Bypass,
            flags,
            self.limit,
        )
        .await;
        let res = expect_len(off, len, res);

        match &res {
            Ok(n) => {
                page.clear_error();
                page.set_uptodate();
                debug!(written = n, "page written back");
            }
            Err(e) => {
                // validity is left as is
                warn!(error = %e, "write-back failed");
                page.set_error();
            }
        }

        page.unlock();
        res
    }

    #[instrument(level = "debug", skip(self, inode, held), fields(ino = inode.ino(), held = held.len()))]
    async fn update_pages(
        &self,
        inode: &Inode,
        held: Vec<LockedPage>,
        pos: u64,
        len: usize,
    ) -> Result<usize> {
        let mapping = inode.mapping();
        let Some(range) = mapping.index_range(pos, len) else {
            return Ok(0);
        };
        let end = pos.saturating_add(len as u64);

        let mut seen = BTreeSet::new();
        let mut updated = 0;
        let mut first_err = None;

        for mut page in held {
            seen.insert(page.index());
            if !range.contains(&page.index()) {
                continue;
            }
            match self.refresh(inode, &mut page, pos, end).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        // faulted in while the primary cache was being written
        for page in mapping.resident_pages(range) {
            if seen.contains(&page.index()) {
                continue;
            }
            let mut locked = page.lock().await;
            match self.refresh(inode, &mut locked, pos, end).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        debug!(updated, "explicit write propagated");
        match first_err {
            Some(e) => Err(e),
            None => Ok(updated),
        }
    }
}

impl<E: StorageEngine + ?Sized> CacheSync<E> {
    /// Re-reads the part of `[pos, end)` that `page` covers. Returns `false`
    /// for a page that is not up to date; the next fault reads it fresh.
    async fn refresh(
        &self,
        inode: &Inode,
        page: &mut LockedPage,
        pos: u64,
        end: u64,
    ) -> Result<bool> {
        if !page.page().is_uptodate() {
            return Ok(false);
        }
        let page_start = page.offset();
        let from = pos.max(page_start);
        let to = end.min(page_start + page.len() as u64);
        let in_page = (from - page_start) as usize;
        let n = (to - from) as usize;

        let res = read_common(
            &*self.engine,
            inode.ino(),
            &mut page.data_mut()[in_page..in_page + n],
            from,
            Origin::Bypass,
            IoFlags::empty(),
            self.limit,
        )
        .await;
        if let Err(e) = expect_len(from, n, res) {
            warn!(index = page.index(), error = %e, "page propagation failed");
            page.set_error();
            page.clear_uptodate();
            return Err(e);
        }
        flush_dcache_page(page);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FileKind, MemEngine};
    use crate::error::Errno;
    use crate::page::{PAGE_POISON, filemap_fault, write_cache_pages};

    const PS: usize = 4096;

    async fn setup(contents: &[u8]) -> (Arc<MemEngine>, CacheSync<MemEngine>, Inode) {
        let engine = Arc::new(MemEngine::new());
        let ino = engine.create_file(MemEngine::ROOT_INO, "f").unwrap();
        write_common(
            &*engine,
            ino,
            contents,
            0,
            Origin::External,
            IoFlags::empty(),
            u64::MAX,
        )
        .await
        .unwrap();
        let sync = CacheSync::new(engine.clone(), u64::MAX);
        (engine, sync, Inode::new(ino, FileKind::Regular, PS))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fault_in_small_file_zero_fills() {
        let (engine, sync, inode) = setup(b"0123456789").await;
        let page = filemap_fault(&sync, &inode, engine.size(inode.ino()), 0)
            .await
            .unwrap();

        assert!(page.is_uptodate());
        assert!(!page.is_error());
        assert!(!page.is_locked());
        let bytes = page.user_load(0, PS).await.unwrap();
        assert_eq!(&bytes[..10], b"0123456789");
        assert_eq!(bytes[10..].len(), 4086);
        assert!(bytes[10..].iter().all(|&b| b == 0));
        assert_eq!(engine.stats().bypass_reads, 1);
    }

    #[tokio::test]
    async fn test_fault_in_last_partial_page() {
        let size = 2 * PS + 100;
        let data = pattern(size);
        let (engine, sync, inode) = setup(&data).await;
        let page = filemap_fault(&sync, &inode, engine.size(inode.ino()), 2)
            .await
            .unwrap();
        let bytes = page.user_load(0, PS).await.unwrap();
        assert_eq!(&bytes[..100], &data[2 * PS..]);
        // the last data byte is non-zero, so the zero tail is exactly the fill
        let zeroed = bytes.iter().rev().take_while(|&&b| b == 0).count();
        assert_eq!(zeroed, PS - 100);
    }

    #[tokio::test]
    async fn test_fault_in_short_read_marks_error() {
        let (engine, sync, inode) = setup(&pattern(PS)).await;
        engine.inject_short_read(10);
        let err = filemap_fault(&sync, &inode, engine.size(inode.ino()), 0)
            .await
            .unwrap_err();
        assert!(err.is_short_transfer());

        let page = inode.mapping().find_page(0).unwrap();
        assert!(page.is_error());
        assert!(!page.is_uptodate());
        assert!(!page.is_locked());
        // nothing past the short read was zeroed or otherwise dressed up
        assert_eq!(page.user_load(PS - 1, 1).await.unwrap(), vec![PAGE_POISON]);

        // the next fault retries and succeeds
        let page = filemap_fault(&sync, &inode, engine.size(inode.ino()), 0)
            .await
            .unwrap();
        assert!(page.is_uptodate());
        assert!(!page.is_error());
    }

    #[tokio::test]
    async fn test_fault_in_engine_error_releases_lock() {
        let (engine, sync, inode) = setup(b"abc").await;
        engine.inject_read_error(Errno::EIO);
        let err = filemap_fault(&sync, &inode, 3, 0).await.unwrap_err();
        assert_eq!(err.errno(), Errno::EIO);
        let page = inode.mapping().find_page(0).unwrap();
        assert!(!page.is_locked());
        assert!(page.is_error());
    }

    #[tokio::test]
    async fn test_fault_beyond_eof_creates_nothing() {
        let (engine, sync, inode) = setup(b"abc").await;
        let err = filemap_fault(&sync, &inode, engine.size(inode.ino()), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PageSyncError::BeyondEof { .. }));
        assert_eq!(inode.mapping().nr_pages(), 0);
    }

    #[tokio::test]
    async fn test_write_back_round_trip() {
        let (engine, sync, inode) = setup(&pattern(PS + 10)).await;
        let page = filemap_fault(&sync, &inode, engine.size(inode.ino()), 0)
            .await
            .unwrap();
        page.user_store(100, b"mapped store").await.unwrap();
        let expected = page.user_load(0, PS).await.unwrap();

        let n = sync
            .writepage(&inode, page.lock().await, &WritebackControl::integrity())
            .await
            .unwrap();
        assert_eq!(n, PS);
        assert!(!page.is_locked());
        assert_eq!(&engine.contents(inode.ino()).unwrap()[..PS], &expected[..]);
        assert_eq!(engine.stats().bypass_writes, 1);
    }

    #[tokio::test]
    async fn test_write_back_partial_page_writes_only_to_eof() {
        let (engine, sync, inode) = setup(b"0123456789").await;
        let page = filemap_fault(&sync, &inode, 10, 0).await.unwrap();
        page.user_store(0, b"ABCDE").await.unwrap();
        let n = sync
            .writepage(&inode, page.lock().await, &WritebackControl::integrity())
            .await
            .unwrap();
        assert_eq!(n, 10);
        // the file does not grow to a full page
        assert_eq!(engine.contents(inode.ino()).unwrap(), b"ABCDE56789");
    }

    #[tokio::test]
    async fn test_write_back_after_shrink_is_noop() {
        let (engine, sync, inode) = setup(&pattern(2 * PS)).await;
        let page = filemap_fault(&sync, &inode, engine.size(inode.ino()), 1)
            .await
            .unwrap();
        page.user_store(0, b"zz").await.unwrap();
        engine.truncate(inode.ino(), PS as u64).unwrap();

        let n = sync
            .writepage(&inode, page.lock().await, &WritebackControl::integrity())
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(!page.is_error());
        assert!(!page.is_locked());
        assert_eq!(engine.size(inode.ino()), PS as u64);
        assert_eq!(engine.stats().bypass_writes, 0);
    }

    #[tokio::test]
    async fn test_write_back_short_write_keeps_validity() {
        let (engine, sync, inode) = setup(&pattern(PS)).await;
        let page = filemap_fault(&sync, &inode, PS as u64, 0).await.unwrap();
        page.user_store(0, b"dirty").await.unwrap();
        engine.inject_short_write(100);

        let mut wbc = WritebackControl::integrity();
        let err = write_cache_pages(&sync, &inode, &mut wbc).await.unwrap_err();
        assert!(err.is_short_transfer());
        assert!(page.is_error());
        assert!(page.is_uptodate());
        assert!(page.is_dirty());
        assert!(!page.is_locked());
        assert_eq!(wbc.pages_written, 0);
        assert_eq!(inode.mapping().take_error(), Some(Errno::EIO));
    }

    #[tokio::test]
    async fn test_update_pages_refreshes_resident_only() {
        let (engine, sync, inode) = setup(&pattern(3 * PS)).await;
        let size = engine.size(inode.ino());
        let page0 = filemap_fault(&sync, &inode, size, 0).await.unwrap();

        // an explicit write spanning pages 0..=2, only page 0 is resident
        let pos = PS as u64 - 2;
        let held = inode.mapping().lock_range(pos, PS + 4).await;
        assert_eq!(held.len(), 1);
        write_common(
            &*engine,
            inode.ino(),
            &vec![0xeeu8; PS + 4],
            pos,
            Origin::External,
            IoFlags::empty(),
            u64::MAX,
        )
        .await
        .unwrap();
        let updated = sync.update_pages(&inode, held, pos, PS + 4).await.unwrap();
        assert_eq!(updated, 1);
        assert_eq!(inode.mapping().nr_pages(), 1);
        assert_eq!(page0.user_load(PS - 2, 2).await.unwrap(), vec![0xee, 0xee]);
        assert_eq!(page0.user_load(0, 1).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_update_pages_skips_invalid_page() {
        let (engine, sync, inode) = setup(&pattern(PS)).await;
        engine.inject_read_error(Errno::EIO);
        assert!(filemap_fault(&sync, &inode, PS as u64, 0).await.is_err());
        let updated = sync.update_pages(&inode, Vec::new(), 0, 5).await.unwrap();
        assert_eq!(updated, 0);
        assert!(!inode.mapping().find_page(0).unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_update_pages_failure_invalidates_and_continues() {
        let (engine, sync, inode) = setup(&vec![b'.'; 2 * PS]).await;
        let size = engine.size(inode.ino());
        let page0 = filemap_fault(&sync, &inode, size, 0).await.unwrap();
        let page1 = filemap_fault(&sync, &inode, size, 1).await.unwrap();

        let held = inode.mapping().lock_range(0, 2 * PS).await;
        write_common(
            &*engine,
            inode.ino(),
            &vec![b'X'; 2 * PS],
            0,
            Origin::External,
            IoFlags::empty(),
            u64::MAX,
        )
        .await
        .unwrap();
        engine.inject_read_error(Errno::EIO);

        let err = sync
            .update_pages(&inode, held, 0, 2 * PS)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), Errno::EIO);

        // the page that missed the refresh is no longer valid
        assert!(!page0.is_uptodate());
        assert!(page0.is_error());
        assert!(!page0.is_locked());
        // the next page was still refreshed
        assert!(page1.is_uptodate());
        assert_eq!(page1.user_load(0, PS).await.unwrap(), vec![b'X'; PS]);

        let page0 = filemap_fault(&sync, &inode, size, 0).await.unwrap();
        assert!(!page0.is_error());
        assert_eq!(page0.user_load(0, PS).await.unwrap(), vec![b'X'; PS]);
    }

    #[tokio::test]
    async fn test_update_pages_refreshes_page_faulted_in_meanwhile() {
        let (engine, sync, inode) = setup(&vec![b'.'; PS]).await;
        // no page was resident when the write started
        let held = inode.mapping().lock_range(0, 5).await;
        assert!(held.is_empty());
        let page = filemap_fault(&sync, &inode, PS as u64, 0).await.unwrap();
        write_common(
            &*engine,
            inode.ino(),
            b"hello",
            0,
            Origin::External,
            IoFlags::empty(),
            u64::MAX,
        )
        .await
        .unwrap();

        assert_eq!(sync.update_pages(&inode, held, 0, 5).await.unwrap(), 1);
        assert_eq!(page.user_load(0, 6).await.unwrap(), b"hello.");
    }
}
