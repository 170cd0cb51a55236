//! Cross-thread wake queue
//!
//! External producers (other OS threads) hand runnables to a scheduler by
//! pushing onto a lock-free FIFO and, when the consumer is parked, writing
//! 8 bytes to its eventfd. The `need_wakeup` flag serialises the race
//! between "producer pushes" and "consumer decides to sleep":
//!
//! - consumer: set `need_wakeup = true`, re-check the queue, then park;
//! - producer: push, then `need_wakeup.swap(false)` — if it was true, this
//!   producer owns the wakeup and writes the eventfd (under a mutex, so
//!   concurrent owners cannot interleave partial writes).
//!
//! Wakeups are thereby coalesced: one eventfd write per sleep cycle, no
//! matter how many producers push. The consumer drains the eventfd with an
//! 8-byte read (a counter read, per eventfd semantics).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_queue::SegQueue;

use crate::error::{Error, Result};

/// Multi-producer single-consumer wake queue.
///
/// The queue itself is MPMC-capable ([`SegQueue`]) but only the owning
/// scheduler thread pops, which is what gives FIFO-per-producer ordering.
pub struct WakeQueue<T> {
    q: SegQueue<T>,
    need_wakeup: AtomicBool,
    efd: OwnedFd,
    efd_lock: Mutex<()>,
}

impl<T> WakeQueue<T> {
    pub fn new() -> Result<Self> {
        // Blocking eventfd: the scheduler reads it through the ring, and a
        // non-blocking fd would turn that read into an EAGAIN loop.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::from_errno(unsafe { *libc::__errno_location() }));
        }
        // SAFETY: fd is freshly created and owned here.
        let efd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(WakeQueue {
            q: SegQueue::new(),
            need_wakeup: AtomicBool::new(false),
            efd,
            efd_lock: Mutex::new(()),
        })
    }

    /// Producer side: enqueue and wake the consumer if it is (about to be)
    /// parked. Safe to call from any thread.
    pub fn push(&self, item: T) {
        self.q.push(item);
        if self.need_wakeup.swap(false, Ordering::AcqRel) {
            self.signal();
        }
    }

    /// Consumer side: take the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        self.q.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Consumer side: announce intent to park. After this call the consumer
    /// must re-check [`is_empty`](Self::is_empty); if anything raced in, it
    /// calls [`finish_park`](Self::finish_park) and skips sleeping.
    pub fn prepare_to_park(&self) {
        self.need_wakeup.store(true, Ordering::SeqCst);
    }

    /// Consumer side: done sleeping (or decided not to).
    pub fn finish_park(&self) {
        self.need_wakeup.store(false, Ordering::SeqCst);
    }

    /// The eventfd the consumer monitors for wakeups.
    pub fn eventfd(&self) -> RawFd {
        self.efd.as_raw_fd()
    }

    fn signal(&self) {
        let _guard = self.efd_lock.lock().unwrap_or_else(|e| e.into_inner());
        let one: u64 = 1;
        let bytes = one.to_ne_bytes();
        // A failed write here (counter overflow) would mean 2^64-1 unread
        // wakeups; treat as unreachable but do not crash the producer.
        let n = unsafe {
            libc::write(
                self.efd.as_raw_fd(),
                bytes.as_ptr().cast::<libc::c_void>(),
                bytes.len(),
            )
        };
        debug_assert_eq!(n, 8);
    }
}

impl<T> std::fmt::Debug for WakeQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeQueue")
            .field("need_wakeup", &self.need_wakeup.load(Ordering::Relaxed))
            .field("eventfd", &self.efd.as_raw_fd())
            .finish()
    }
}
