//! Fiber primitives
//!
//! Forking, yielding, racing, timeouts, counting semaphores, and the
//! lifetime scope that owns cleanup hooks. Everything here is single
//! threaded: fibers of one scheduler share the thread and these types are
//! deliberately `!Send`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use fibrio_core::{Error, Result};

use crate::scheduler;
use crate::sleep::sleep;
use crate::task::JoinHandle;

/// Fork a new fiber onto the current scheduler.
///
/// The fiber starts with a fresh cancellation context; cancel it through
/// the returned handle. Dropping the handle detaches the fiber.
pub fn spawn<T: 'static>(fut: impl Future<Output = T> + 'static) -> JoinHandle<T> {
    scheduler::current().spawn_task(fut, false)
}

/// Raise the current fiber's cancellation reason, if it has one.
pub fn check() -> Result<()> {
    scheduler::current_ctx().check()
}

/// Hand the thread to the next runnable fiber.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }
    impl Future for YieldNow {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
    YieldNow { yielded: false }.await
}

#[derive(Debug, PartialEq, Eq)]
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

struct Race<A, B> {
    a: Option<JoinHandle<A>>,
    b: Option<JoinHandle<B>>,
}

enum RaceOutcome<A, B> {
    Left(A, JoinHandle<B>),
    Right(B, JoinHandle<A>),
}

impl<A, B> Future for Race<A, B> {
    type Output = RaceOutcome<A, B>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(v) = Pin::new(self.a.as_mut().unwrap()).poll(cx) {
            return Poll::Ready(RaceOutcome::Left(v, self.b.take().unwrap()));
        }
        if let Poll::Ready(v) = Pin::new(self.b.as_mut().unwrap()).poll(cx) {
            return Poll::Ready(RaceOutcome::Right(v, self.a.take().unwrap()));
        }
        Poll::Pending
    }
}

/// Run both computations; return the first to finish and cancel the other.
///
/// The loser is cancelled and then awaited: it observes the cancellation
/// at its next suspension point and runs to completion before `first`
/// returns, so nothing it references outlives it.
pub async fn first<A: 'static, B: 'static>(
    a: impl Future<Output = A> + 'static,
    b: impl Future<Output = B> + 'static,
) -> Either<A, B> {
    let ha = spawn(a);
    let hb = spawn(b);
    match (Race {
        a: Some(ha),
        b: Some(hb),
    })
    .await
    {
        RaceOutcome::Left(v, loser) => {
            loser.cancel(Error::Cancelled);
            let _ = loser.await;
            Either::Left(v)
        }
        RaceOutcome::Right(v, loser) => {
            loser.cancel(Error::Cancelled);
            let _ = loser.await;
            Either::Right(v)
        }
    }
}

/// Race `fut` against a timer; the loser is cancelled.
pub async fn timeout<T: 'static>(
    limit: Duration,
    fut: impl Future<Output = Result<T>> + 'static,
) -> Result<T> {
    match first(fut, sleep(limit)).await {
        Either::Left(v) => v,
        Either::Right(_) => Err(Error::TimedOut),
    }
}

// ── Scope ───────────────────────────────────────────────────────────────

struct ScopeInner {
    hooks: RefCell<Vec<Option<Box<dyn FnOnce()>>>>,
}

/// A structured-concurrency lifetime region owning cleanup hooks.
///
/// Hooks run in reverse registration order when the scope is released at
/// the end of [`with_scope`]. Resources such as [`crate::FdHandle`]
/// register themselves here so that leaving the scope closes whatever is
/// still open.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

/// A removable cleanup hook, as returned by
/// [`Scope::on_release_cancellable`]. Fires at most once.
pub struct Hook {
    scope: Weak<ScopeInner>,
    index: usize,
}

impl Hook {
    /// Remove the hook so it never fires. Returns false if it already
    /// fired or was removed.
    pub fn remove(&self) -> bool {
        match self.scope.upgrade() {
            Some(inner) => inner.hooks.borrow_mut()[self.index].take().is_some(),
            None => false,
        }
    }
}

impl Scope {
    fn new() -> Scope {
        Scope {
            inner: Rc::new(ScopeInner {
                hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Register a hook that runs when the scope is released.
    pub fn on_release(&self, f: impl FnOnce() + 'static) {
        self.inner.hooks.borrow_mut().push(Some(Box::new(f)));
    }

    /// Register a hook that can be removed before release.
    pub fn on_release_cancellable(&self, f: impl FnOnce() + 'static) -> Hook {
        let mut hooks = self.inner.hooks.borrow_mut();
        let index = hooks.len();
        hooks.push(Some(Box::new(f)));
        Hook {
            scope: Rc::downgrade(&self.inner),
            index,
        }
    }

    /// Raise if the current fiber has been cancelled.
    pub fn check(&self) -> Result<()> {
        check()
    }

    fn release(&self) {
        // Hooks may register further hooks (a close spawning a fiber that
        // owns another fd); keep draining until quiet.
        loop {
            let hook = {
                let mut hooks = self.inner.hooks.borrow_mut();
                match hooks.iter().rposition(|h| h.is_some()) {
                    Some(i) => hooks[i].take(),
                    None => break,
                }
            };
            if let Some(f) = hook {
                f();
            }
        }
    }
}

/// Run `f` inside a fresh scope, releasing it (firing all remaining hooks,
/// newest first) once the returned future completes.
pub async fn with_scope<T, F, Fut>(f: F) -> T
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = T>,
{
    let scope = Scope::new();
    let out = f(scope.clone()).await;
    scope.release();
    out
}

// ── Semaphore ───────────────────────────────────────────────────────────

struct SemInner {
    permits: Cell<usize>,
    waiters: RefCell<VecDeque<Waker>>,
}

/// Counting semaphore for fibers on one scheduler (connection caps and
/// the like). Permits are released by dropping the guard.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<SemInner>,
}

pub struct SemPermit {
    inner: Rc<SemInner>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            inner: Rc::new(SemInner {
                permits: Cell::new(permits),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.permits.get()
    }

    pub fn acquire(&self) -> Acquire {
        Acquire {
            inner: Rc::clone(&self.inner),
        }
    }
}

pub struct Acquire {
    inner: Rc<SemInner>,
}

impl Future for Acquire {
    type Output = SemPermit;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let permits = self.inner.permits.get();
        if permits > 0 {
            self.inner.permits.set(permits - 1);
            Poll::Ready(SemPermit {
                inner: Rc::clone(&self.inner),
            })
        } else {
            self.inner.waiters.borrow_mut().push_back(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for SemPermit {
    fn drop(&mut self) {
        self.inner.permits.set(self.inner.permits.get() + 1);
        if let Some(w) = self.inner.waiters.borrow_mut().pop_front() {
            w.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);
    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_scope_hooks_run_in_reverse() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let scope = Scope::new();
        for i in 0..3 {
            let order = Rc::clone(&order);
            scope.on_release(move || order.borrow_mut().push(i));
        }
        scope.release();
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn test_removed_hook_never_fires() {
        let fired = Rc::new(Cell::new(false));
        let scope = Scope::new();
        let hook = {
            let fired = Rc::clone(&fired);
            scope.on_release_cancellable(move || fired.set(true))
        };
        assert!(hook.remove());
        assert!(!hook.remove());
        scope.release();
        assert!(!fired.get());
    }

    #[test]
    fn test_hook_registered_during_release_runs() {
        let fired = Rc::new(Cell::new(false));
        let scope = Scope::new();
        {
            let fired = Rc::clone(&fired);
            let inner_scope = scope.clone();
            scope.on_release(move || {
                let fired = Rc::clone(&fired);
                inner_scope.on_release(move || fired.set(true));
            });
        }
        scope.release();
        assert!(fired.get());
    }

    #[test]
    fn test_semaphore_counts_and_wakes() {
        let sem = Semaphore::new(1);
        let waker_state = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&waker_state));
        let mut cx = Context::from_waker(&waker);

        let permit = match Pin::new(&mut sem.acquire()).poll(&mut cx) {
            Poll::Ready(p) => p,
            Poll::Pending => panic!("permit available"),
        };
        assert_eq!(sem.available(), 0);

        let mut second = sem.acquire();
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());

        drop(permit);
        assert_eq!(waker_state.0.load(Ordering::SeqCst), 1);
        assert!(Pin::new(&mut second).poll(&mut cx).is_ready());
    }
}
