//! I/O job records
//!
//! Every SQE's user-data tag keys a record in the [`OpTable`]. The record
//! owns whatever the kernel may still touch (iovec arrays, path strings,
//! socket addresses) and says how to dispatch the CQE:
//!
//! - `Rw` — read/write request with the short-transfer retry machine;
//! - `Cancellable` — single-shot job that defers to the fiber's recorded
//!   cancellation reason;
//! - `Plain` — non-cancellable job (close, noop): raw result, always;
//! - `Callback` — no suspended fiber; invoke a closure with the raw result
//!   (async-cancel results are checked this way).
//!
//! A record is inserted before its first SQE is pushed and removed exactly
//! once, when the dispatcher delivers its final result. Retries reuse the
//! record and its tag, so one suspended fiber sees exactly one resume.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use fibrio_core::{Error, FiberCtx, Result, TaskId};

use crate::uring::{RingFull, Uring};

/// Shared cell the dispatcher fills and the suspended op future drains.
pub(crate) type CompletionSlot = Rc<Cell<Option<Result<i32>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// Length policy for a read/write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LenMode {
    /// Resubmit on short transfers until the full count is moved.
    Exactly,
    /// A single kernel transfer; whatever it moved is the answer.
    Upto,
}

pub(crate) enum RwBuf {
    /// One contiguous buffer; `fixed_index` selects the registered-buffer
    /// opcode variant.
    Single {
        ptr: *mut u8,
        fixed_index: Option<u16>,
    },
    /// Scatter/gather list, shifted in place as short transfers complete.
    Vector { iovs: Box<[libc::iovec]>, first: usize },
}

/// A suspended read or write request.
pub(crate) struct RwOp {
    pub ctx: Rc<FiberCtx>,
    pub dir: Dir,
    pub fd: RawFd,
    pub mode: LenMode,
    pub buf: RwBuf,
    /// Requested byte count: target for `Exactly`, cap for `Upto`.
    pub total: usize,
    /// Bytes already transferred across retries.
    pub cur: usize,
    /// Explicit file offset, or [`crate::uring::OFFSET_CURRENT`].
    pub file_offset: i64,
}

/// What the dispatcher should do with a CQE for an [`RwOp`].
pub(crate) enum RwOutcome {
    Done(Result<i32>),
    Resubmit,
}

impl RwOp {
    /// Advance the short-transfer state machine with one CQE result.
    pub fn on_cqe(&mut self, res: i32) -> RwOutcome {
        if res == 0 {
            return RwOutcome::Done(Err(Error::EndOfFile));
        }
        if res < 0 {
            if let Some(reason) = self.ctx.get_error() {
                if self.cur > 0 {
                    // Cancelled mid-transfer with real progress: hand back
                    // the short count rather than discard the data.
                    return RwOutcome::Done(Ok(self.cur as i32));
                }
                return RwOutcome::Done(Err(reason));
            }
            if Error::errno_is_retry(res) {
                return RwOutcome::Resubmit;
            }
            if self.dir == Dir::Read && res == -libc::ECONNRESET {
                return RwOutcome::Done(Err(Error::ConnectionReset));
            }
            return RwOutcome::Done(Err(Error::from_errno(res)));
        }
        let n = res as usize;
        match self.mode {
            LenMode::Upto => RwOutcome::Done(Ok(res)),
            LenMode::Exactly => {
                self.advance(n);
                if self.cur >= self.total {
                    RwOutcome::Done(Ok(self.total as i32))
                } else if self.ctx.get_error().is_some() {
                    RwOutcome::Done(Ok(self.cur as i32))
                } else {
                    RwOutcome::Resubmit
                }
            }
        }
    }

    fn advance(&mut self, n: usize) {
        self.cur += n;
        if self.file_offset >= 0 {
            self.file_offset += n as i64;
        }
        if let RwBuf::Vector { iovs, first } = &mut self.buf {
            iov_advance(iovs, first, n);
        }
    }

    pub fn remaining(&self) -> usize {
        self.total - self.cur
    }
}

/// Shift a scatter/gather list past `n` consumed bytes.
fn iov_advance(iovs: &mut [libc::iovec], first: &mut usize, mut n: usize) {
    while n > 0 && *first < iovs.len() {
        let iov = &mut iovs[*first];
        if n >= iov.iov_len {
            n -= iov.iov_len;
            iov.iov_len = 0;
            *first += 1;
        } else {
            iov.iov_base = unsafe { iov.iov_base.cast::<u8>().add(n).cast::<libc::c_void>() };
            iov.iov_len -= n;
            n = 0;
        }
    }
}

/// Build and push the (re)submission SQE for an [`RwOp`] under `key`.
pub(crate) fn push_rw_sqe(
    ring: &mut Uring,
    rw: &RwOp,
    key: u64,
) -> std::result::Result<(), RingFull> {
    match &rw.buf {
        RwBuf::Single { ptr, fixed_index } => {
            // SAFETY: cur < total and the caller's buffer spans `total`.
            let p = unsafe { ptr.add(rw.cur) };
            let len = rw.remaining();
            match (rw.dir, fixed_index) {
                (Dir::Read, Some(idx)) => {
                    ring.read_fixed(rw.fd, p, len, rw.file_offset, *idx, key)
                }
                (Dir::Write, Some(idx)) => {
                    ring.write_fixed(rw.fd, p, len, rw.file_offset, *idx, key)
                }
                (Dir::Read, None) => ring.read(rw.fd, p, len, rw.file_offset, key),
                (Dir::Write, None) => ring.write(rw.fd, p, len, rw.file_offset, key),
            }
        }
        RwBuf::Vector { iovs, first } => {
            let live = &iovs[*first..];
            match rw.dir {
                Dir::Read => ring.readv(rw.fd, live.as_ptr(), live.len(), rw.file_offset, key),
                Dir::Write => ring.writev(rw.fd, live.as_ptr(), live.len(), rw.file_offset, key),
            }
        }
    }
}

pub(crate) enum OpKind {
    Rw(RwOp),
    Cancellable {
        ctx: Rc<FiberCtx>,
        /// Kernel-visible allocations (sockaddr, CString, OpenHow, msghdr)
        /// kept alive until the CQE.
        keep: Option<Box<dyn Any>>,
    },
    Plain,
    Callback(Box<dyn FnOnce(i32)>),
}

pub(crate) struct OpRecord {
    pub kind: OpKind,
    /// Fiber to enqueue when the slot is filled (unused for `Callback`).
    pub task: TaskId,
    pub slot: CompletionSlot,
}

/// user-data → in-flight record. Keys are monotonic and never reused.
pub(crate) struct OpTable {
    records: HashMap<u64, OpRecord>,
    next_key: u64,
}

impl OpTable {
    pub fn new() -> Self {
        OpTable {
            records: HashMap::new(),
            next_key: 1,
        }
    }

    pub fn alloc_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    pub fn insert(&mut self, key: u64, record: OpRecord) {
        let prev = self.records.insert(key, record);
        debug_assert!(prev.is_none(), "user-data tag reused");
    }

    pub fn remove(&mut self, key: u64) -> Option<OpRecord> {
        self.records.remove(&key)
    }

    pub fn get(&self, key: u64) -> Option<&OpRecord> {
        self.records.get(&key)
    }

    pub fn keys(&self) -> Vec<u64> {
        self.records.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Future half of a suspended operation: ready once the dispatcher fills
/// the completion slot and re-enqueues the owning fiber.
pub(crate) struct OpFuture {
    slot: CompletionSlot,
}

impl OpFuture {
    pub fn new(slot: CompletionSlot) -> Self {
        OpFuture { slot }
    }
}

impl Future for OpFuture {
    type Output = Result<i32>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.slot.take() {
            Some(res) => Poll::Ready(res),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw(mode: LenMode, total: usize) -> RwOp {
        RwOp {
            ctx: FiberCtx::new(TaskId::new(1)),
            dir: Dir::Read,
            fd: -1,
            mode,
            buf: RwBuf::Single {
                ptr: std::ptr::null_mut(),
                fixed_index: None,
            },
            total,
            cur: 0,
            file_offset: 10,
        }
    }

    #[test]
    fn test_exactly_resubmits_on_short_read() {
        let mut op = rw(LenMode::Exactly, 8);
        assert!(matches!(op.on_cqe(4), RwOutcome::Resubmit));
        assert_eq!(op.cur, 4);
        assert_eq!(op.file_offset, 14);
        assert!(matches!(op.on_cqe(4), RwOutcome::Done(Ok(8))));
    }

    #[test]
    fn test_upto_delivers_first_transfer() {
        let mut op = rw(LenMode::Upto, 8);
        match op.on_cqe(3) {
            RwOutcome::Done(Ok(3)) => {}
            _ => panic!("upto must deliver the raw count"),
        }
    }

    #[test]
    fn test_zero_is_end_of_stream() {
        let mut op = rw(LenMode::Exactly, 8);
        assert!(matches!(
            op.on_cqe(0),
            RwOutcome::Done(Err(Error::EndOfFile))
        ));
    }

    #[test]
    fn test_eintr_retries_without_advancing() {
        let mut op = rw(LenMode::Exactly, 8);
        assert!(matches!(op.on_cqe(-libc::EINTR), RwOutcome::Resubmit));
        assert!(matches!(op.on_cqe(-libc::EAGAIN), RwOutcome::Resubmit));
        assert_eq!(op.cur, 0);
        assert_eq!(op.file_offset, 10);
    }

    #[test]
    fn test_connreset_maps_on_reads() {
        let mut op = rw(LenMode::Upto, 8);
        assert!(matches!(
            op.on_cqe(-libc::ECONNRESET),
            RwOutcome::Done(Err(Error::ConnectionReset))
        ));
        let mut op = rw(LenMode::Upto, 8);
        op.dir = Dir::Write;
        assert!(matches!(
            op.on_cqe(-libc::ECONNRESET),
            RwOutcome::Done(Err(Error::Os(libc::ECONNRESET)))
        ));
    }

    #[test]
    fn test_cancelled_with_progress_keeps_data() {
        let mut op = rw(LenMode::Exactly, 8);
        assert!(matches!(op.on_cqe(3), RwOutcome::Resubmit));
        op.ctx.cancel(Error::Cancelled);
        // The async-cancel landed: CQE says ECANCELED, but 3 bytes already
        // moved — the short count is delivered, not the cancel reason.
        assert!(matches!(
            op.on_cqe(-libc::ECANCELED),
            RwOutcome::Done(Ok(3))
        ));
    }

    #[test]
    fn test_cancelled_without_progress_reports_reason() {
        let mut op = rw(LenMode::Exactly, 8);
        op.ctx.cancel(Error::TimedOut);
        assert!(matches!(
            op.on_cqe(-libc::ECANCELED),
            RwOutcome::Done(Err(Error::TimedOut))
        ));
    }

    #[test]
    fn test_iov_advance_shifts_and_drops() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut iovs: Box<[libc::iovec]> = vec![
            libc::iovec {
                iov_base: a.as_mut_ptr().cast(),
                iov_len: 4,
            },
            libc::iovec {
                iov_base: b.as_mut_ptr().cast(),
                iov_len: 4,
            },
        ]
        .into_boxed_slice();
        let mut first = 0;
        iov_advance(&mut iovs, &mut first, 6);
        assert_eq!(first, 1);
        assert_eq!(iovs[1].iov_len, 2);
        assert_eq!(iovs[1].iov_base as usize, b.as_ptr() as usize + 2);
    }

    #[test]
    fn test_op_table_keys_monotonic() {
        let mut table = OpTable::new();
        let k1 = table.alloc_key();
        let k2 = table.alloc_key();
        assert!(k2 > k1);
        assert!(table.is_empty());
    }
}
