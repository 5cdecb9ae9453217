//! Byte-range I/O adapter: one offset+length request becomes one engine call.

use tracing::trace;

use crate::engine::{Ino, StorageEngine};
use crate::error::Result;
use crate::uio::{IoFlags, Origin, Uio};

/// Direction and buffer of a transfer.
enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }
}

/// Submits `xfer` to the engine at `pos` and returns `len - resid`.
///
/// Engine errors are returned as they came. `Origin::Bypass` describes the
/// buffer as host memory and adds [`IoFlags::DIRECT`], so the engine does
/// not re-enter the page frame cache.
async fn transfer<E: StorageEngine + ?Sized>(
    engine: &E,
    ino: Ino,
    xfer: Transfer<'_>,
    pos: u64,
    origin: Origin,
    flags: IoFlags,
    limit: u64,
) -> Result<usize> {
    let len = xfer.len();
    let flags = origin.apply(flags);
    let segment = origin.segment();

    let resid = match xfer {
        Transfer::Read(buf) => {
            let mut uio = Uio::for_read(buf, pos, segment, limit);
            engine.read(ino, &mut uio, flags).await?;
            uio.resid()
        }
        Transfer::Write(buf) => {
            let mut uio = Uio::for_write(buf, pos, segment, limit);
            engine.write(ino, &mut uio, flags).await?;
            uio.resid()
        }
    };

    trace!(ino, pos, len, resid, ?origin, "transfer");
    Ok(len - resid)
}

pub async fn read_common<E: StorageEngine + ?Sized>(
    engine: &E,
    ino: Ino,
    buf: &mut [u8],
    pos: u64,
    origin: Origin,
    flags: IoFlags,
    limit: u64,
) -> Result<usize> {
    transfer(engine, ino, Transfer::Read(buf), pos, origin, flags, limit).await
}

pub async fn write_common<E: StorageEngine + ?Sized>(
    engine: &E,
    ino: Ino,
    buf: &[u8],
    pos: u64,
    origin: Origin,
    flags: IoFlags,
    limit: u64,
) -> Result<usize> {
    transfer(engine, ino, Transfer::Write(buf), pos, origin, flags, limit).await
}
