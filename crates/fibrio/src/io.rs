//! Ring-dispatched I/O operations
//!
//! Every operation follows the same submission pattern: refuse immediately
//! if the fiber is already cancelled, build an SQE (parking on the
//! overflow FIFO when the ring is full), install the cancellation hook,
//! and suspend until the completion dispatcher delivers the result.
//!
//! Buffered reads and writes stage through a block from the registered
//! fixed-buffer pool (waiting for one when the pool is empty) and fall
//! back to plain heap blocks when buffer registration was refused at
//! startup. Short transfers, EINTR and EAGAIN are retried inside the
//! dispatcher and never visible here.

use std::any::Any;
use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;

use io_uring::types::OpenHow;

use fibrio_core::{Error, FiberCtx, Result};

use crate::fd::FdHandle;
use crate::net::sockaddr_from;
use crate::op::{Dir, LenMode, RwBuf, RwOp};
use crate::scheduler;
use crate::uring::OFFSET_CURRENT;

fn rw_single(
    ctx: Rc<FiberCtx>,
    dir: Dir,
    fd: i32,
    ptr: *mut u8,
    fixed_index: Option<u16>,
    mode: LenMode,
    total: usize,
) -> RwOp {
    RwOp {
        ctx,
        dir,
        fd,
        mode,
        buf: RwBuf::Single { ptr, fixed_index },
        total,
        cur: 0,
        file_offset: OFFSET_CURRENT,
    }
}

/// Read up to `buf.len()` bytes, returning however many the kernel
/// produced. A 0-byte transfer reports [`Error::EndOfFile`].
pub async fn read_upto(fd: &FdHandle, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let raw = fd.raw_fd()?;
    let sched = scheduler::current();
    let mut staging = sched.acquire_buf().await;
    let want = buf.len().min(staging.len());
    let op = rw_single(
        scheduler::current_ctx(),
        Dir::Read,
        raw,
        staging.as_mut_ptr(),
        staging.fixed_index(),
        LenMode::Upto,
        want,
    );
    let n = sched.submit_rw(op).await? as usize;
    buf[..n].copy_from_slice(&staging.bytes()[..n]);
    Ok(n)
}

/// Read exactly `buf.len()` bytes, retrying short transfers.
///
/// If the fiber is cancelled mid-read after real progress, the bytes read
/// so far are still copied into `buf` before the cancellation reason is
/// reported; the transfer is not silently discarded.
pub async fn read_exactly(fd: &FdHandle, buf: &mut [u8]) -> Result<()> {
    let raw = fd.raw_fd()?;
    let sched = scheduler::current();
    let mut done = 0;
    while done < buf.len() {
        let mut staging = sched.acquire_buf().await;
        let want = (buf.len() - done).min(staging.len());
        let ctx = scheduler::current_ctx();
        let op = rw_single(
            Rc::clone(&ctx),
            Dir::Read,
            raw,
            staging.as_mut_ptr(),
            staging.fixed_index(),
            LenMode::Exactly,
            want,
        );
        let n = sched.submit_rw(op).await? as usize;
        buf[done..done + n].copy_from_slice(&staging.bytes()[..n]);
        done += n;
        if n < want {
            // Short delivery happens only for a cancelled fiber.
            return Err(ctx.get_error().unwrap_or(Error::Cancelled));
        }
    }
    Ok(())
}

/// Write all of `data`, retrying short transfers.
pub async fn write_all(fd: &FdHandle, data: &[u8]) -> Result<()> {
    let raw = fd.raw_fd()?;
    let sched = scheduler::current();
    let mut done = 0;
    while done < data.len() {
        let mut staging = sched.acquire_buf().await;
        let want = (data.len() - done).min(staging.len());
        staging.bytes_mut()[..want].copy_from_slice(&data[done..done + want]);
        let ctx = scheduler::current_ctx();
        let op = rw_single(
            Rc::clone(&ctx),
            Dir::Write,
            raw,
            staging.as_mut_ptr(),
            staging.fixed_index(),
            LenMode::Exactly,
            want,
        );
        let n = sched.submit_rw(op).await? as usize;
        done += n;
        if n < want {
            return Err(ctx.get_error().unwrap_or(Error::Cancelled));
        }
    }
    Ok(())
}

/// Write at most one staging block of `data`; returns the byte count the
/// kernel accepted.
pub async fn write_upto(fd: &FdHandle, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let raw = fd.raw_fd()?;
    let sched = scheduler::current();
    let mut staging = sched.acquire_buf().await;
    let want = data.len().min(staging.len());
    staging.bytes_mut()[..want].copy_from_slice(&data[..want]);
    let op = rw_single(
        scheduler::current_ctx(),
        Dir::Write,
        raw,
        staging.as_mut_ptr(),
        staging.fixed_index(),
        LenMode::Upto,
        want,
    );
    let n = sched.submit_rw(op).await? as usize;
    Ok(n)
}

fn iovec_list(ptrs: impl Iterator<Item = (*mut u8, usize)>) -> (Box<[libc::iovec]>, usize) {
    let iovs: Box<[libc::iovec]> = ptrs
        .map(|(base, len)| libc::iovec {
            iov_base: base.cast::<libc::c_void>(),
            iov_len: len,
        })
        .collect();
    let total = iovs.iter().map(|v| v.iov_len).sum();
    (iovs, total)
}

/// Vectored read straight into the caller's buffers. One kernel transfer;
/// returns the byte count, [`Error::EndOfFile`] on 0.
pub async fn readv(fd: &FdHandle, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
    let raw = fd.raw_fd()?;
    let (iovs, total) = iovec_list(bufs.iter_mut().map(|b| (b.as_mut_ptr(), b.len())));
    if total == 0 {
        return Ok(0);
    }
    let sched = scheduler::current();
    let op = RwOp {
        ctx: scheduler::current_ctx(),
        dir: Dir::Read,
        fd: raw,
        mode: LenMode::Upto,
        buf: RwBuf::Vector { iovs, first: 0 },
        total,
        cur: 0,
        file_offset: OFFSET_CURRENT,
    };
    let n = sched.submit_rw(op).await? as usize;
    Ok(n)
}

/// Vectored write of every byte in `bufs`. Short writes shift the iovec
/// list and retry inside the dispatcher.
pub async fn writev(fd: &FdHandle, bufs: &[IoSlice<'_>]) -> Result<()> {
    let raw = fd.raw_fd()?;
    let (iovs, total) =
        iovec_list(bufs.iter().map(|b| (b.as_ptr().cast_mut(), b.len())));
    if total == 0 {
        return Ok(());
    }
    let sched = scheduler::current();
    let ctx = scheduler::current_ctx();
    let op = RwOp {
        ctx: Rc::clone(&ctx),
        dir: Dir::Write,
        fd: raw,
        mode: LenMode::Exactly,
        buf: RwBuf::Vector { iovs, first: 0 },
        total,
        cur: 0,
        file_offset: OFFSET_CURRENT,
    };
    let n = sched.submit_rw(op).await? as usize;
    if n < total {
        return Err(ctx.get_error().unwrap_or(Error::Cancelled));
    }
    Ok(())
}

/// Suspend until `fd` polls readable (POLLIN, or error/hangup).
pub async fn await_readable(fd: &FdHandle) -> Result<()> {
    poll_fd(fd, (libc::POLLIN | libc::POLLERR | libc::POLLHUP) as u32).await
}

/// Suspend until `fd` polls writable.
pub async fn await_writable(fd: &FdHandle) -> Result<()> {
    poll_fd(fd, (libc::POLLOUT | libc::POLLERR) as u32).await
}

async fn poll_fd(fd: &FdHandle, mask: u32) -> Result<()> {
    let raw = fd.raw_fd()?;
    let sched = scheduler::current();
    sched
        .submit_cancellable(
            scheduler::current_ctx(),
            None,
            Box::new(move |ring, key| ring.poll_add(raw, mask, key)),
        )
        .await?;
    Ok(())
}

/// Connect a socket to `addr`.
pub async fn connect(fd: &FdHandle, addr: std::net::SocketAddr) -> Result<()> {
    let raw = fd.raw_fd()?;
    let (storage, len) = sockaddr_from(addr);
    let storage = Box::new(storage);
    let ptr = (&*storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>();
    let sched = scheduler::current();
    sched
        .submit_cancellable(
            scheduler::current_ctx(),
            Some(storage as Box<dyn Any>),
            Box::new(move |ring, key| ring.connect(raw, ptr, len, key)),
        )
        .await?;
    Ok(())
}

/// Accept one connection; the CQE's integer result is the new kernel fd.
pub async fn accept(fd: &FdHandle) -> Result<FdHandle> {
    let raw = fd.raw_fd()?;
    let sched = scheduler::current();
    let new_fd = sched
        .submit_cancellable(
            scheduler::current_ctx(),
            None,
            Box::new(move |ring, key| ring.accept(raw, key)),
        )
        .await?;
    Ok(FdHandle::from_raw(new_fd, true))
}

/// Move up to `len` bytes between two fds without touching userspace.
/// At least one side must be a pipe; otherwise the kernel reports EINVAL
/// and the caller falls back to a buffered copy.
pub async fn splice(from: &FdHandle, to: &FdHandle, len: usize) -> Result<usize> {
    let fd_in = from.raw_fd()?;
    let fd_out = to.raw_fd()?;
    let sched = scheduler::current();
    let n = sched
        .submit_cancellable(
            scheduler::current_ctx(),
            None,
            Box::new(move |ring, key| {
                ring.splice(fd_in, OFFSET_CURRENT, fd_out, OFFSET_CURRENT, len, key)
            }),
        )
        .await?;
    if n == 0 {
        return Err(Error::EndOfFile);
    }
    Ok(n as usize)
}

/// Gathered socket send via `sendmsg`.
pub async fn send_msg(fd: &FdHandle, bufs: &[IoSlice<'_>]) -> Result<usize> {
    let raw = fd.raw_fd()?;
    let (iovs, _) = iovec_list(bufs.iter().map(|b| (b.as_ptr().cast_mut(), b.len())));
    let mut msg: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });
    msg.msg_iov = iovs.as_ptr().cast_mut();
    msg.msg_iovlen = iovs.len();
    let ptr = &*msg as *const libc::msghdr;
    let sched = scheduler::current();
    let n = sched
        .submit_cancellable(
            scheduler::current_ctx(),
            Some(Box::new((iovs, msg)) as Box<dyn Any>),
            Box::new(move |ring, key| ring.send_msg(raw, ptr, key)),
        )
        .await?;
    Ok(n as usize)
}

/// Scattered socket receive via `recvmsg`; 0 bytes reports end-of-stream.
pub async fn recv_msg(fd: &FdHandle, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
    let raw = fd.raw_fd()?;
    let (iovs, _) = iovec_list(bufs.iter_mut().map(|b| (b.as_mut_ptr(), b.len())));
    let mut msg: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });
    msg.msg_iov = iovs.as_ptr().cast_mut();
    msg.msg_iovlen = iovs.len();
    let ptr = (&mut *msg) as *mut libc::msghdr;
    let sched = scheduler::current();
    let n = sched
        .submit_cancellable(
            scheduler::current_ctx(),
            Some(Box::new((iovs, msg)) as Box<dyn Any>),
            Box::new(move |ring, key| ring.recv_msg(raw, ptr, key)),
        )
        .await?;
    if n == 0 {
        return Err(Error::EndOfFile);
    }
    Ok(n as usize)
}

/// Open a file relative to `dir` (or the CWD) via `openat2`, with
/// `RESOLVE_*` flags honoured by the kernel.
pub async fn open_at(
    dir: Option<&FdHandle>,
    path: &Path,
    flags: u64,
    mode: u64,
    resolve: u64,
) -> Result<FdHandle> {
    let dirfd = match dir {
        Some(d) => d.raw_fd()?,
        None => libc::AT_FDCWD,
    };
    let cpath = Box::new(
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Os(libc::EINVAL))?,
    );
    let how = Box::new(OpenHow::new().flags(flags).mode(mode).resolve(resolve));
    let path_ptr = cpath.as_ptr();
    let how_ptr = &*how as *const OpenHow;
    let sched = scheduler::current();
    let new_fd = sched
        .submit_cancellable(
            scheduler::current_ctx(),
            Some(Box::new((cpath, how)) as Box<dyn Any>),
            Box::new(move |ring, key| ring.openat2(dirfd, path_ptr, how_ptr, key)),
        )
        .await?;
    Ok(FdHandle::from_raw(new_fd, true))
}

/// Create a directory relative to `dir` (or the CWD).
pub async fn mkdir_at(dir: Option<&FdHandle>, path: &Path, mode: u32) -> Result<()> {
    let dirfd = match dir {
        Some(d) => d.raw_fd()?,
        None => libc::AT_FDCWD,
    };
    let cpath = Box::new(
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Os(libc::EINVAL))?,
    );
    let path_ptr = cpath.as_ptr();
    let sched = scheduler::current();
    sched
        .submit_cancellable(
            scheduler::current_ctx(),
            Some(cpath as Box<dyn Any>),
            Box::new(move |ring, key| ring.mkdirat(dirfd, path_ptr, mode, key)),
        )
        .await?;
    Ok(())
}

/// Shut down one or both directions of a connected socket.
pub async fn shutdown(fd: &FdHandle, how: std::net::Shutdown) -> Result<()> {
    let raw = fd.raw_fd()?;
    let how = match how {
        std::net::Shutdown::Read => libc::SHUT_RD,
        std::net::Shutdown::Write => libc::SHUT_WR,
        std::net::Shutdown::Both => libc::SHUT_RDWR,
    };
    let sched = scheduler::current();
    sched
        .submit_cancellable(
            scheduler::current_ctx(),
            None,
            Box::new(move |ring, key| ring.shutdown(raw, how, key)),
        )
        .await?;
    Ok(())
}

/// Round-trip a no-op through the ring (submission-path smoke test).
pub async fn noop() -> Result<()> {
    let sched = scheduler::current();
    sched
        .submit_plain(Box::new(|ring, key| ring.noop(key)))
        .await?;
    Ok(())
}
