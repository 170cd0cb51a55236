//! Per-fiber cancellation contexts
//!
//! Every fiber carries a [`FiberCtx`]. Cancelling a fiber records a reason
//! and synchronously invokes the single cancellation callback installed by
//! whatever operation the fiber is currently suspended on. The callback is
//! single-shot: an in-flight operation installs it before handing control
//! back to the scheduler and either clears it on completion or has it
//! consumed by `cancel` — never both.
//!
//! Contexts are deliberately `!Send`: cancellation is posted on the fiber's
//! owning thread, so no locking is needed.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::id::TaskId;

type CancelFn = Box<dyn FnOnce(&Error)>;

/// Cancellation state attached to one fiber.
pub struct FiberCtx {
    tid: TaskId,
    cancelled: RefCell<Option<Error>>,
    cancel_fn: RefCell<Option<CancelFn>>,
}

impl FiberCtx {
    pub fn new(tid: TaskId) -> Rc<Self> {
        Rc::new(FiberCtx {
            tid,
            cancelled: RefCell::new(None),
            cancel_fn: RefCell::new(None),
        })
    }

    pub fn tid(&self) -> TaskId {
        self.tid
    }

    /// The recorded cancellation reason, if this fiber has been cancelled.
    pub fn get_error(&self) -> Option<Error> {
        self.cancelled.borrow().clone()
    }

    /// Raise the recorded cancellation reason, if any.
    pub fn check(&self) -> Result<()> {
        match self.get_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Install the cancellation callback for the operation about to suspend.
    ///
    /// # Panics
    ///
    /// Panics if a callback is already installed: at most one operation per
    /// fiber may be in flight, and it must clear its hook on completion.
    pub fn set_cancel_fn<F: FnOnce(&Error) + 'static>(&self, f: F) {
        let mut slot = self.cancel_fn.borrow_mut();
        assert!(
            slot.is_none(),
            "{}: cancel callback already installed",
            self.tid
        );
        *slot = Some(Box::new(f));
    }

    /// Remove the installed callback. Returns false if `cancel` already
    /// consumed it (or none was installed).
    pub fn clear_cancel_fn(&self) -> bool {
        self.cancel_fn.borrow_mut().take().is_some()
    }

    /// Cancel this fiber with `reason`.
    ///
    /// Records the reason (first cancellation wins) and invokes the current
    /// cancellation callback, if one is installed. Returns false if the
    /// fiber was already cancelled; the callback is not re-invoked.
    pub fn cancel(&self, reason: Error) -> bool {
        {
            let mut cancelled = self.cancelled.borrow_mut();
            if cancelled.is_some() {
                return false;
            }
            *cancelled = Some(reason.clone());
        }
        // Take the hook out before calling it: the callback may install a
        // follow-up operation on this same context.
        let hook = self.cancel_fn.borrow_mut().take();
        if let Some(f) = hook {
            f(&reason);
        }
        true
    }
}

impl std::fmt::Debug for FiberCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCtx")
            .field("tid", &self.tid)
            .field("cancelled", &self.cancelled.borrow().is_some())
            .field("has_cancel_fn", &self.cancel_fn.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_check_before_and_after_cancel() {
        let ctx = FiberCtx::new(TaskId::new(1));
        assert!(ctx.check().is_ok());
        assert!(ctx.cancel(Error::Cancelled));
        assert_eq!(ctx.check(), Err(Error::Cancelled));
        assert_eq!(ctx.get_error(), Some(Error::Cancelled));
    }

    #[test]
    fn test_first_reason_wins() {
        let ctx = FiberCtx::new(TaskId::new(1));
        assert!(ctx.cancel(Error::TimedOut));
        assert!(!ctx.cancel(Error::Cancelled));
        assert_eq!(ctx.get_error(), Some(Error::TimedOut));
    }

    #[test]
    fn test_callback_invoked_once_with_reason() {
        let ctx = FiberCtx::new(TaskId::new(1));
        let fired = Rc::new(Cell::new(0u32));
        let seen = Rc::new(RefCell::new(None));
        {
            let fired = fired.clone();
            let seen = seen.clone();
            ctx.set_cancel_fn(move |reason| {
                fired.set(fired.get() + 1);
                *seen.borrow_mut() = Some(reason.clone());
            });
        }
        ctx.cancel(Error::TimedOut);
        assert_eq!(fired.get(), 1);
        assert_eq!(*seen.borrow(), Some(Error::TimedOut));
        // The hook was consumed: clearing finds nothing.
        assert!(!ctx.clear_cancel_fn());
    }

    #[test]
    fn test_clear_prevents_invocation() {
        let ctx = FiberCtx::new(TaskId::new(1));
        let fired = Rc::new(Cell::new(false));
        {
            let fired = fired.clone();
            ctx.set_cancel_fn(move |_| fired.set(true));
        }
        assert!(ctx.clear_cancel_fn());
        ctx.cancel(Error::Cancelled);
        assert!(!fired.get());
    }

    #[test]
    #[should_panic(expected = "cancel callback already installed")]
    fn test_double_install_panics() {
        let ctx = FiberCtx::new(TaskId::new(1));
        ctx.set_cancel_fn(|_| {});
        ctx.set_cancel_fn(|_| {});
    }

    #[test]
    fn test_set_after_clear_is_allowed() {
        let ctx = FiberCtx::new(TaskId::new(1));
        ctx.set_cancel_fn(|_| {});
        ctx.clear_cancel_fn();
        ctx.set_cancel_fn(|_| {});
        assert!(ctx.clear_cancel_fn());
    }
}
