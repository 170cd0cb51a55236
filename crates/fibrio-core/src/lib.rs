//! Runtime-independent building blocks for the fibrio fiber runtime.
//!
//! Everything here is usable without a running scheduler:
//!
//! - [`error`] — the error type shared by all fibrio crates
//! - [`id`] — task identifiers
//! - [`cancel`] — per-fiber cancellation contexts
//! - [`wake`] — the cross-thread wake queue (lock-free FIFO + eventfd)

pub mod cancel;
pub mod error;
pub mod id;
pub mod wake;

pub use cancel::FiberCtx;
pub use error::{Error, Result};
pub use id::TaskId;
pub use wake::WakeQueue;
