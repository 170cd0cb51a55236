//! # fibrio — a Linux io_uring fiber runtime
//!
//! Lightweight cooperative fibers multiplexed on one OS thread per
//! scheduler instance, with cancellable I/O dispatched through io_uring
//! and resumed on completion. Multiple instances run in parallel and talk
//! only through each other's wake queues.
//!
//! ```ignore
//! fn main() -> fibrio::Result<()> {
//!     fibrio::run(fibrio::Config::from_env(), async {
//!         let listener = fibrio::net::listen_tcp("127.0.0.1:0".parse().unwrap())?;
//!         loop {
//!             let conn = std::rc::Rc::new(fibrio::io::accept(&listener).await?);
//!             fibrio::spawn(async move {
//!                 let mut buf = [0u8; 4096];
//!                 while let Ok(n) = fibrio::io::read_upto(&conn, &mut buf).await {
//!                     let _ = fibrio::io::write_all(&conn, &buf[..n]).await;
//!                 }
//!             });
//!         }
//!     })?
//! }
//! ```
//!
//! Requires Linux 5.11+. Starting a runtime ignores `SIGPIPE`
//! process-wide (writes to dead peers report `EPIPE` instead of killing
//! the process).

mod buffer;
mod config;
mod fd;
mod op;
mod scheduler;
mod task;
mod uring;

pub mod bridge;
pub mod fiber;
pub mod io;
pub mod net;
pub mod sleep;

pub use buffer::Chunk;
pub use config::Config;
pub use fd::FdHandle;
pub use fiber::{
    check, first, spawn, timeout, with_scope, yield_now, Either, Hook, Scope, SemPermit,
    Semaphore,
};
pub use fibrio_core::{Error, FiberCtx, Result, TaskId};
pub use sleep::{sleep, sleep_until, Sleep};
pub use task::JoinHandle;

use std::future::Future;

use scheduler::Scheduler;

/// Run `main` as the top-level fiber of a new scheduler instance on the
/// calling thread, returning its output once every fiber has finished and
/// the ring has drained.
pub fn run<T>(cfg: Config, main: impl Future<Output = T>) -> Result<T> {
    let sched = Scheduler::new(&cfg)?;
    sched.block_on(main)
}

/// Like [`run`], but a kernel without io_uring routes to `fallback` with
/// a human-readable diagnostic instead of failing.
pub fn run_with_fallback<T>(
    cfg: Config,
    fallback: impl FnOnce(&str) -> T,
    main: impl Future<Output = T>,
) -> Result<T> {
    match Scheduler::new(&cfg) {
        Ok(sched) => sched.block_on(main),
        Err(Error::Unsupported(msg)) => Ok(fallback(&msg)),
        Err(e) => Err(e),
    }
}

/// Non-waiting fixed-buffer allocation; [`Error::NoBufferSpace`] when the
/// pool is empty.
pub fn alloc_fixed() -> Result<Chunk> {
    scheduler::current().try_alloc_chunk()
}

/// Fixed-buffer allocation that suspends the calling fiber until a block
/// is free. Never fails.
pub async fn alloc_fixed_or_wait() -> Chunk {
    let sched = scheduler::current();
    sched.alloc_chunk_or_wait().await
}
