//! io_uring binding
//!
//! Thin typed layer over the `io-uring` crate. Each prep method builds one
//! SQE, stamps the caller's user-data tag, and pushes it onto the
//! submission queue; a full queue is reported as [`RingFull`] so the caller
//! can park the operation on its overflow FIFO instead. Nothing here
//! touches the kernel until [`Uring::submit`] / [`Uring::wait`].
//!
//! Ownership contract: the op table retains the record behind every
//! user-data tag (including any buffers the SQE points into) until the
//! matching CQE has been dispatched. All raw pointers handed to prep
//! methods rely on that.

use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use fibrio_core::{Error, Result};

use crate::config::Config;

/// The submission queue has no free slot; retry after the next completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingFull;

/// Sentinel file offset meaning "use the fd's current position".
pub(crate) const OFFSET_CURRENT: i64 = -1;

fn offset_arg(file_offset: i64) -> u64 {
    if file_offset < 0 {
        u64::MAX
    } else {
        file_offset as u64
    }
}

pub(crate) struct Uring {
    ring: IoUring,
}

impl Uring {
    /// Set up the ring per `cfg`.
    ///
    /// `ENOSYS` (pre-io_uring kernel) is reported as [`Error::Unsupported`]
    /// so the top-level entry can route it to the user's fallback handler.
    pub fn new(cfg: &Config) -> Result<Uring> {
        let mut builder = IoUring::builder();
        if let Some(idle) = cfg.sqpoll_idle {
            builder.setup_sqpoll(idle.as_millis() as u32);
        }
        let ring = builder.build(cfg.queue_depth).map_err(|e| {
            match e.raw_os_error() {
                Some(errno) if errno == libc::ENOSYS => Error::Unsupported(
                    "io_uring_setup failed with ENOSYS; fibrio requires Linux 5.11 or later \
                     with io_uring enabled"
                        .to_string(),
                ),
                Some(errno) => Error::Os(errno),
                None => Error::Unsupported(e.to_string()),
            }
        })?;
        Ok(Uring { ring })
    }

    /// Register one contiguous buffer region for fixed-buffer I/O.
    ///
    /// Returns false (and leaves the ring usable) if the kernel refuses the
    /// registration for lack of lockable memory; all I/O then falls back to
    /// unregistered buffers.
    pub fn register_region(&mut self, ptr: *mut u8, len: usize) -> Result<bool> {
        let iov = libc::iovec {
            iov_base: ptr.cast::<libc::c_void>(),
            iov_len: len,
        };
        // SAFETY: the region outlives the ring (both owned by the scheduler
        // state, region dropped after ring exit).
        let res = unsafe { self.ring.submitter().register_buffers(&[iov]) };
        match res {
            Ok(()) => Ok(true),
            Err(e) => match e.raw_os_error() {
                Some(errno) if errno == libc::ENOMEM || errno == libc::EOPNOTSUPP => Ok(false),
                Some(errno) => Err(Error::Os(errno)),
                None => Err(Error::Unsupported(e.to_string())),
            },
        }
    }

    fn push(&mut self, sqe: squeue::Entry) -> std::result::Result<(), RingFull> {
        // SAFETY: per the module ownership contract, everything the SQE
        // points into stays alive until its CQE is dispatched.
        unsafe { self.ring.submission().push(&sqe).map_err(|_| RingFull) }
    }

    // ── Read / write ────────────────────────────────────────────────────

    /// Read into the registered region at `ptr` (fixed-buffer fast path).
    pub fn read_fixed(
        &mut self,
        fd: RawFd,
        ptr: *mut u8,
        len: usize,
        file_offset: i64,
        buf_index: u16,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::ReadFixed::new(types::Fd(fd), ptr, len as u32, buf_index)
            .offset(offset_arg(file_offset))
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    /// Write from the registered region at `ptr`.
    pub fn write_fixed(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: usize,
        file_offset: i64,
        buf_index: u16,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::WriteFixed::new(types::Fd(fd), ptr, len as u32, buf_index)
            .offset(offset_arg(file_offset))
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    /// Plain (unregistered) read; used when buffer registration failed.
    pub fn read(
        &mut self,
        fd: RawFd,
        ptr: *mut u8,
        len: usize,
        file_offset: i64,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Read::new(types::Fd(fd), ptr, len as u32)
            .offset(offset_arg(file_offset))
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    /// Plain (unregistered) write.
    pub fn write(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: usize,
        file_offset: i64,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Write::new(types::Fd(fd), ptr, len as u32)
            .offset(offset_arg(file_offset))
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn readv(
        &mut self,
        fd: RawFd,
        iovs: *const libc::iovec,
        count: usize,
        file_offset: i64,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Readv::new(types::Fd(fd), iovs, count as u32)
            .offset(offset_arg(file_offset))
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn writev(
        &mut self,
        fd: RawFd,
        iovs: *const libc::iovec,
        count: usize,
        file_offset: i64,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Writev::new(types::Fd(fd), iovs, count as u32)
            .offset(offset_arg(file_offset))
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    // ── File lifecycle ──────────────────────────────────────────────────

    /// `openat2(2)` through the ring. `how` must stay alive until the CQE.
    pub fn openat2(
        &mut self,
        dirfd: RawFd,
        path: *const libc::c_char,
        how: *const types::OpenHow,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::OpenAt2::new(types::Fd(dirfd), path, how)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn mkdirat(
        &mut self,
        dirfd: RawFd,
        path: *const libc::c_char,
        mode: u32,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::MkDirAt::new(types::Fd(dirfd), path)
            .mode(mode)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn close(&mut self, fd: RawFd, user_data: u64) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Close::new(types::Fd(fd)).build().user_data(user_data);
        self.push(sqe)
    }

    // ── Network ─────────────────────────────────────────────────────────

    pub fn connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Connect::new(types::Fd(fd), addr, addr_len)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn accept(&mut self, fd: RawFd, user_data: u64) -> std::result::Result<(), RingFull> {
        // Peer address is not reported; pass null pointers.
        let sqe = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
            .flags(libc::SOCK_CLOEXEC)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn send_msg(
        &mut self,
        fd: RawFd,
        msg: *const libc::msghdr,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::SendMsg::new(types::Fd(fd), msg)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn recv_msg(
        &mut self,
        fd: RawFd,
        msg: *mut libc::msghdr,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::RecvMsg::new(types::Fd(fd), msg)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn splice(
        &mut self,
        fd_in: RawFd,
        off_in: i64,
        fd_out: RawFd,
        off_out: i64,
        len: usize,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Splice::new(types::Fd(fd_in), off_in, types::Fd(fd_out), off_out, len as u32)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn shutdown(
        &mut self,
        fd: RawFd,
        how: i32,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Shutdown::new(types::Fd(fd), how)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    pub fn poll_add(
        &mut self,
        fd: RawFd,
        mask: u32,
        user_data: u64,
    ) -> std::result::Result<(), RingFull> {
        let sqe = opcode::PollAdd::new(types::Fd(fd), mask)
            .build()
            .user_data(user_data);
        self.push(sqe)
    }

    // ── Control ─────────────────────────────────────────────────────────

    /// Submit an async-cancel targeting the operation tagged `target`.
    pub fn cancel(&mut self, target: u64, user_data: u64) -> std::result::Result<(), RingFull> {
        let sqe = opcode::AsyncCancel::new(target).build().user_data(user_data);
        self.push(sqe)
    }

    pub fn noop(&mut self, user_data: u64) -> std::result::Result<(), RingFull> {
        let sqe = opcode::Nop::new().build().user_data(user_data);
        self.push(sqe)
    }

    // ── Kernel entry ────────────────────────────────────────────────────

    /// Flush all pushed SQEs to the kernel. Returns how many were consumed.
    pub fn submit(&mut self) -> Result<usize> {
        self.ring.submit().map_err(map_enter_error)
    }

    /// Non-blocking: take the next completion, if one is ready.
    pub fn peek(&mut self) -> Option<(u64, i32)> {
        self.ring
            .completion()
            .next()
            .map(|cqe: cqueue::Entry| (cqe.user_data(), cqe.result()))
    }

    /// Flush SQEs and block until a completion arrives, the eventfd is
    /// written (which completes the monitor fiber's read), or `timeout`
    /// expires. Spurious returns are fine: the scheduler re-peeks.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        let res = match timeout {
            None => self.ring.submitter().submit_and_wait(1),
            Some(t) if t.is_zero() => self.ring.submitter().submit().map(|_| 0),
            Some(t) => {
                let ts = types::Timespec::new()
                    .sec(t.as_secs())
                    .nsec(t.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
        };
        match res {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                // Timed out or interrupted: the caller's loop re-evaluates.
                Some(errno) if errno == libc::ETIME || errno == libc::EINTR => Ok(()),
                // CQ overflow pressure: completions are pending, go drain.
                Some(errno) if errno == libc::EBUSY => Ok(()),
                _ => Err(map_enter_error(e)),
            },
        }
    }
}

fn map_enter_error(e: std::io::Error) -> Error {
    match e.raw_os_error() {
        Some(errno) => Error::Os(errno),
        None => Error::Unsupported(e.to_string()),
    }
}
