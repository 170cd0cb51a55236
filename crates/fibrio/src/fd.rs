//! Owned file-descriptor handles
//!
//! An [`FdHandle`] wraps a raw kernel fd with an open/closed state, a
//! seekability probe, and an optional scope hook. Once closed, every
//! operation on the handle reports [`Error::ClosedFd`] and nothing further
//! reaches the ring. Closing goes through the ring's asynchronous close
//! opcode; the synchronous syscall is used only as the drop fallback for
//! handles never closed explicitly.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;

use fibrio_core::{Error, Result};

use crate::fiber::{Hook, Scope};
use crate::scheduler;

pub struct FdHandle {
    raw: Cell<RawFd>,
    seekable: bool,
    close_on_drop: bool,
    hook: RefCell<Option<Hook>>,
}

impl FdHandle {
    /// Take ownership of `raw`. Seekability is probed once with
    /// `lseek(SEEK_CUR)`; pipes and sockets come out non-seekable, so
    /// their ring submissions use the current-position offset sentinel.
    pub fn from_raw(raw: RawFd, close_on_drop: bool) -> FdHandle {
        let seekable = unsafe { libc::lseek(raw, 0, libc::SEEK_CUR) } >= 0;
        FdHandle {
            raw: Cell::new(raw),
            seekable,
            close_on_drop,
            hook: RefCell::new(None),
        }
    }

    /// Borrow a kernel fd owned by someone else (closing is a no-op).
    pub fn borrowed(raw: RawFd) -> FdHandle {
        FdHandle::from_raw(raw, false)
    }

    pub fn is_open(&self) -> bool {
        self.raw.get() >= 0
    }

    pub fn seekable(&self) -> bool {
        self.seekable
    }

    /// The raw fd, for callers that probe transports for a splice fast
    /// path or hand the fd to the kernel themselves.
    pub fn raw_fd(&self) -> Result<RawFd> {
        let fd = self.raw.get();
        if fd < 0 {
            Err(Error::ClosedFd)
        } else {
            Ok(fd)
        }
    }

    /// Close the fd through the ring. Non-cancellable: once submitted the
    /// close always runs, and the handle is marked closed up front so no
    /// later operation can slip in.
    pub async fn close(&self) -> Result<()> {
        let fd = self.raw.replace(-1);
        if fd < 0 {
            return Err(Error::ClosedFd);
        }
        if let Some(hook) = self.hook.borrow_mut().take() {
            hook.remove();
        }
        let sched = scheduler::current();
        sched
            .submit_plain(Box::new(move |ring, key| ring.close(fd, key)))
            .await?;
        Ok(())
    }

    /// Register this handle with `scope`: leaving the scope closes the fd
    /// if it is still open. The hook fires at most once and is removed by
    /// an explicit [`close`](Self::close).
    pub fn close_on_release(self: &Rc<Self>, scope: &Scope) {
        let this = Rc::clone(self);
        let hook = scope.on_release_cancellable(move || {
            if this.is_open() {
                let this = Rc::clone(&this);
                // Ring close from a fresh fiber: release hooks are plain
                // closures and cannot await.
                crate::fiber::spawn(async move {
                    let _ = this.close().await;
                });
            }
        });
        *self.hook.borrow_mut() = Some(hook);
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        let fd = self.raw.replace(-1);
        if fd >= 0 && self.close_on_drop {
            // Last-resort synchronous close; the ring path needs a live
            // fiber, which a plain drop does not have.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl std::fmt::Debug for FdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdHandle")
            .field("fd", &self.raw.get())
            .field("seekable", &self.seekable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_handle_rejects_use() {
        let fd = FdHandle::from_raw(-1, false);
        // from_raw(-1) is already "closed": raw_fd must refuse.
        assert_eq!(fd.raw_fd(), Err(Error::ClosedFd));
        assert!(!fd.is_open());
    }

    #[test]
    fn test_seekable_probe() {
        let file = tempfile::tempfile().unwrap();
        use std::os::fd::IntoRawFd;
        let fd = FdHandle::from_raw(file.into_raw_fd(), true);
        assert!(fd.seekable());

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let r = FdHandle::from_raw(fds[0], true);
        let w = FdHandle::from_raw(fds[1], true);
        assert!(!r.seekable());
        assert!(!w.seekable());
    }

    #[test]
    fn test_drop_closes_owned_fd() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let raw = fds[0];
        drop(FdHandle::from_raw(raw, true));
        // The fd slot is gone: fcntl on it must fail with EBADF.
        let ret = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        assert_eq!(ret, -1);
        drop(FdHandle::from_raw(fds[1], true));
    }
}
