//! Buffer descriptors handed to the storage engine.
//!
//! A [`Uio`] describes exactly one contiguous transfer: the caller's buffer,
//! the file offset, the residual count the engine has not yet satisfied, the
//! offset limit and the memory domain the buffer lives in. The engine moves
//! bytes with [`Uio::copy_out`] (reads) or [`Uio::copy_in`] (writes), which
//! keep `offset` and `resid` consistent.

use bitflags::bitflags;

bitflags! {
    /// Per-transfer flags, derived from the open flags of the file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoFlags: u32 {
        /// Append at end of file.
        const APPEND = 1;
        /// Service the transfer without creating or touching page frames.
        const DIRECT = 2;
        /// Data must be durable before the transfer returns.
        const SYNC = 4;
        /// Caller may address offsets past 2 GiB.
        const LARGEFILE = 8;
    }
}

/// Memory domain of the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Memory owned by an external caller (a `read(2)`/`write(2)` buffer).
    UserSpace,
    /// Memory owned by the host itself, such as a page frame.
    SysSpace,
}

/// Who is asking for a transfer.
///
/// `Bypass` is the reentrancy-suppression token: the page handlers use it so
/// that the engine never calls back into the page frame cache while a page
/// lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    External,
    Bypass,
}

impl Origin {
    pub fn segment(self) -> Segment {
        match self {
            Origin::External => Segment::UserSpace,
            Origin::Bypass => Segment::SysSpace,
        }
    }

    /// Flags to submit to the engine for a transfer of this origin.
    pub fn apply(self, flags: IoFlags) -> IoFlags {
        match self {
            Origin::External => flags,
            Origin::Bypass => flags | IoFlags::DIRECT,
        }
    }
}

enum IoVec<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// A single-segment transfer descriptor.
pub struct Uio<'a> {
    iov: IoVec<'a>,
    // bytes of `iov` already consumed
    done: usize,
    offset: u64,
    resid: usize,
    limit: u64,
    segment: Segment,
}

impl<'a> Uio<'a> {
    /// Descriptor for a read that fills `buf`.
    pub fn for_read(buf: &'a mut [u8], offset: u64, segment: Segment, limit: u64) -> Self {
        let resid = buf.len();
        Self {
            iov: IoVec::Read(buf),
            done: 0,
            offset,
            resid,
            limit,
            segment,
        }
    }

    /// Descriptor for a write that drains `buf`.
    pub fn for_write(buf: &'a [u8], offset: u64, segment: Segment, limit: u64) -> Self {
        let resid = buf.len();
        Self {
            iov: IoVec::Write(buf),
            done: 0,
            offset,
            resid,
            limit,
            segment,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes the engine has not transferred yet.
    pub fn resid(&self) -> usize {
        self.resid
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn is_read(&self) -> bool {
        matches!(self.iov, IoVec::Read(_))
    }

    /// Moves the starting offset, used by the engine for append writes.
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Read side: copies as much of `src` as fits into the caller's buffer.
    /// Returns the number of bytes copied.
    pub fn copy_out(&mut self, src: &[u8]) -> usize {
        let IoVec::Read(buf) = &mut self.iov else {
            return 0;
        };
        let n = src.len().min(self.resid);
        buf[self.done..self.done + n].copy_from_slice(&src[..n]);
        self.advance(n);
        n
    }

    /// Write side: fills `dst` from the caller's buffer. Returns the number
    /// of bytes copied.
    pub fn copy_in(&mut self, dst: &mut [u8]) -> usize {
        let IoVec::Write(buf) = &self.iov else {
            return 0;
        };
        let n = dst.len().min(self.resid);
        dst[..n].copy_from_slice(&buf[self.done..self.done + n]);
        self.advance(n);
        n
    }

    fn advance(&mut self, n: usize) {
        self.done += n;
        self.resid -= n;
        self.offset += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_sets_direct() {
        assert!(Origin::Bypass.apply(IoFlags::empty()).contains(IoFlags::DIRECT));
        assert!(!Origin::External.apply(IoFlags::SYNC).contains(IoFlags::DIRECT));
        assert_eq!(Origin::Bypass.segment(), Segment::SysSpace);
        assert_eq!(Origin::External.segment(), Segment::UserSpace);
    }

    #[test]
    fn test_copy_out_tracks_resid_and_offset() {
        let mut buf = [0u8; 8];
        let mut uio = Uio::for_read(&mut buf, 100, Segment::SysSpace, u64::MAX);
        assert_eq!(uio.copy_out(b"abc"), 3);
        assert_eq!(uio.resid(), 5);
        assert_eq!(uio.offset(), 103);
        // more than fits: only the residual is copied
        assert_eq!(uio.copy_out(b"defghijk"), 5);
        assert_eq!(uio.resid(), 0);
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn test_copy_in_wrong_direction_is_noop() {
        let data = *b"hello";
        let mut uio = Uio::for_write(&data, 0, Segment::UserSpace, u64::MAX);
        assert_eq!(uio.copy_out(b"xx"), 0);
        let mut dst = [0u8; 3];
        assert_eq!(uio.copy_in(&mut dst), 3);
        assert_eq!(&dst, b"hel");
        assert_eq!(uio.resid(), 2);
    }
}
