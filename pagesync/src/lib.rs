//! Page-level synchronization between a storage engine's primary cache and
//! the host page frame cache used for memory mapped files.
//!
//! The primary cache (a [`StorageEngine`]) is authoritative. Page frames are
//! filled from it on fault ([`PageSync::readpage`]), written back to it when
//! dirty ([`PageSync::writepage`]) and refreshed after explicit writes to a
//! mapped file ([`PageSync::update_pages`]). [`FileOps`] is the inbound
//! surface the host calls for reads, writes, mmap, readdir and fsync.

pub mod aops;
pub mod config;
pub mod dir;
pub mod engine;
pub mod error;
pub mod file;
pub mod inode;
pub mod mmap;
pub mod page;
pub mod rw;
pub mod uio;

pub use aops::{CacheSync, PageSync};
pub use config::PageSyncConfig;
pub use engine::{FileKind, Ino, MemEngine, StorageEngine};
pub use error::{Errno, PageSyncError, Result};
pub use file::{FileOps, OpenFile};
pub use inode::Inode;
pub use page::{AddressSpace, LockedPage, Page, WritebackControl};
pub use uio::{IoFlags, Origin, Uio};
