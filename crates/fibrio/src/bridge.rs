//! Cross-domain bridge
//!
//! Fibers occasionally need a real OS thread: a blocking computation
//! ([`run_raw`]) or a whole second scheduler instance ([`run`]). Either
//! way the calling fiber suspends; the spawned thread's last act is to
//! push the fiber onto its home scheduler's wake queue, which signals the
//! eventfd and resumes it. Scheduler instances share nothing else.

use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread;

use fibrio_core::{Error, Result};

use crate::config::Config;
use crate::scheduler;

type Delivered<T> = Arc<Mutex<Option<thread::Result<T>>>>;

struct BridgeWait<T> {
    delivered: Delivered<T>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<T> Future for BridgeWait<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let taken = self
            .delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(outcome) => {
                // The worker pushed its result before waking us, so this
                // join returns immediately; it just reaps the thread.
                if let Some(handle) = self.thread.take() {
                    let _ = handle.join();
                }
                match outcome {
                    Ok(v) => Poll::Ready(v),
                    Err(panic) => resume_unwind(panic),
                }
            }
            None => Poll::Pending,
        }
    }
}

/// Run `f` on a fresh OS thread; the calling fiber suspends until it
/// finishes. A panic in `f` resumes the panic in the calling fiber.
///
/// Not cancellable once started: a running thread cannot be revoked, so
/// the only cancellation point is before spawning.
pub async fn run_raw<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let ctx = scheduler::current_ctx();
    ctx.check()?;
    let sched = scheduler::current();
    let wake = sched.wake_remote();
    let task = ctx.tid();

    let delivered: Delivered<T> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&delivered);
    let handle = thread::Builder::new()
        .name("fibrio-bridge".to_string())
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
            wake.push(task);
        })
        .map_err(|e| Error::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;

    Ok(BridgeWait {
        delivered,
        thread: Some(handle),
    }
    .await)
}

/// Spawn an independent scheduler instance on a new OS thread and run
/// `make_main()` as its top-level fiber; the calling fiber suspends until
/// the instance exits and yields its result.
pub async fn run<T, F, Fut>(make_main: F) -> Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T>,
    T: Send + 'static,
{
    run_raw(move || crate::run(Config::from_env(), make_main())).await?
}
