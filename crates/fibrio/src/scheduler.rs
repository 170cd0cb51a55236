//! Scheduler
//!
//! One instance per OS thread. The loop runs until the top-level fiber and
//! every ordinary fiber have finished and no I/O or timer is outstanding:
//!
//! 1. Dispatch one runnable fiber from the run queue.
//! 2. Otherwise fire one due timer.
//! 3. Otherwise peek the ring and dispatch one completion.
//! 4. Otherwise flush SQEs, compute the timer deadline, exit if nothing
//!    can ever arrive, and park in `io_uring_enter` until a completion,
//!    an eventfd wakeup, or the deadline.
//!
//! The loop is cooperative: a fiber that never suspends starves the rest
//! of its thread.
//!
//! A daemon fiber monitors the eventfd with 8-byte ring reads so that a
//! cross-thread push (see `fibrio_core::wake`) turns into a CQE and forces
//! a pass over the run queue. Shutdown cancels that daemon, which lets the
//! in-flight count reach zero.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::{pin, Pin};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use fibrio_core::{Error, FiberCtx, Result, TaskId, WakeQueue};

use crate::buffer::{Chunk, FixedPool, IoBuf};
use crate::config::Config;
use crate::op::{
    push_rw_sqe, CompletionSlot, OpFuture, OpKind, OpRecord, OpTable, RwOp, RwOutcome,
};
use crate::sleep::{SleepQueue, SleepState};
use crate::task::{join_pair, remote_waker, JoinHandle, TaskTable};
use crate::uring::{RingFull, Uring, OFFSET_CURRENT};

macro_rules! sched_debug {
    ($sched:expr, $($arg:tt)*) => {
        if $sched.debug {
            eprintln!("[fibrio] {}", format!($($arg)*));
        }
    };
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

/// The scheduler running on this thread.
///
/// # Panics
///
/// Panics when called outside `run`.
pub(crate) fn current() -> Rc<Scheduler> {
    CURRENT_SCHED.with(|s| {
        s.borrow()
            .clone()
            .expect("no fibrio runtime is running on this thread")
    })
}

/// Context of the fiber currently being polled.
pub(crate) fn current_ctx() -> Rc<FiberCtx> {
    let sched = current();
    let ctx = sched.current.borrow().clone();
    ctx.expect("fibrio operation used outside a fiber")
}

/// An operation that could not reach the submission queue; re-run when a
/// completion frees a slot.
type PendingSqe = Box<dyn FnOnce(&Rc<Scheduler>)>;

/// SQE builder for single-shot (non read/write) operations. Re-invoked on
/// retry after the ring was full, hence `Fn` rather than `FnOnce`.
pub(crate) type BuildSqe = Box<dyn Fn(&mut Uring, u64) -> std::result::Result<(), RingFull>>;

pub(crate) struct Scheduler {
    debug: bool,
    block_size: usize,
    ring: RefCell<Uring>,
    ops: RefCell<OpTable>,
    io_q: RefCell<VecDeque<PendingSqe>>,
    pool: FixedPool,
    fixed_registered: bool,
    run_q: RefCell<VecDeque<TaskId>>,
    remote: Arc<WakeQueue<TaskId>>,
    sleep_q: RefCell<SleepQueue>,
    tasks: TaskTable,
    in_flight: Cell<usize>,
    current: RefCell<Option<Rc<FiberCtx>>>,
    main_ctx: Rc<FiberCtx>,
    main_done: Cell<bool>,
    daemons_cancelled: Cell<bool>,
}

impl Scheduler {
    pub fn new(cfg: &Config) -> Result<Rc<Scheduler>> {
        cfg.validate()?;
        ignore_sigpipe();
        let mut ring = Uring::new(cfg)?;
        let pool = FixedPool::new(cfg.block_size, cfg.n_blocks);
        let (ptr, len) = pool.region();
        let fixed_registered = ring.register_region(ptr, len)?;
        pool.set_registered(fixed_registered);
        let remote = Arc::new(WakeQueue::new()?);
        let sched = Rc::new(Scheduler {
            debug: cfg.debug_logging,
            block_size: cfg.block_size,
            ring: RefCell::new(ring),
            ops: RefCell::new(OpTable::new()),
            io_q: RefCell::new(VecDeque::new()),
            pool,
            fixed_registered,
            run_q: RefCell::new(VecDeque::new()),
            remote,
            sleep_q: RefCell::new(SleepQueue::new()),
            tasks: TaskTable::new(),
            in_flight: Cell::new(0),
            current: RefCell::new(None),
            main_ctx: FiberCtx::new(TaskId::MAIN),
            main_done: Cell::new(false),
            daemons_cancelled: Cell::new(false),
        });
        sched_debug!(
            sched,
            "ring ready: depth={} fixed_buffers={}",
            cfg.queue_depth,
            fixed_registered
        );
        Ok(sched)
    }

    /// Run `main` as the top-level fiber and drive the loop to completion.
    pub fn block_on<T>(self: &Rc<Self>, main: impl Future<Output = T>) -> Result<T> {
        let _guard = install(self)?;
        self.spawn_monitor();

        let mut out: Option<T> = None;
        {
            let out_ref = &mut out;
            let wrapper = pin!(async move {
                *out_ref = Some(main.await);
            });
            self.enqueue_local(TaskId::MAIN);
            self.event_loop(wrapper)?;
        }
        match out {
            Some(v) => Ok(v),
            // The loop exited without the top-level fiber finishing; every
            // remaining fiber was unreachable. This mirrors a deadlock.
            None => Err(Error::Cancelled),
        }
    }

    // ── Run queue ───────────────────────────────────────────────────────

    pub(crate) fn enqueue_local(&self, id: TaskId) {
        self.run_q.borrow_mut().push_back(id);
    }

    /// Head-push: owner-thread-only fast requeue, used for cancellation
    /// wakes so they outrun ordinary completions.
    pub(crate) fn enqueue_front(&self, id: TaskId) {
        self.run_q.borrow_mut().push_front(id);
    }

    pub(crate) fn wake_remote(&self) -> Arc<WakeQueue<TaskId>> {
        Arc::clone(&self.remote)
    }

    // ── Timers ──────────────────────────────────────────────────────────

    pub(crate) fn sleep_insert(
        &self,
        deadline: Instant,
        task: TaskId,
        state: Rc<SleepState>,
    ) -> u64 {
        self.sleep_q.borrow_mut().insert(deadline, task, state)
    }

    pub(crate) fn sleep_cancelled(&self, seq: u64, task: TaskId) {
        self.sleep_q.borrow_mut().cancel(seq);
        self.enqueue_front(task);
    }

    // ── Fibers ──────────────────────────────────────────────────────────

    pub(crate) fn spawn_task<T: 'static>(
        self: &Rc<Self>,
        fut: impl Future<Output = T> + 'static,
        daemon: bool,
    ) -> JoinHandle<T> {
        let (sender, pending) = join_pair();
        let wrapped = Box::pin(async move {
            sender.send(fut.await);
        });
        let task = self.tasks.insert(wrapped, daemon, Arc::clone(&self.remote));
        self.enqueue_local(task.id);
        pending.into_handle(Rc::clone(&task.ctx))
    }

    fn poll_task(self: &Rc<Self>, id: TaskId) {
        let Some(task) = self.tasks.get(id) else {
            return; // stale wake for a finished fiber
        };
        let Some(mut fut) = task.future.borrow_mut().take() else {
            return;
        };
        *self.current.borrow_mut() = Some(Rc::clone(&task.ctx));
        let mut cx = Context::from_waker(&task.waker);
        let res = fut.as_mut().poll(&mut cx);
        *self.current.borrow_mut() = None;
        match res {
            Poll::Ready(()) => self.tasks.remove(id),
            Poll::Pending => *task.future.borrow_mut() = Some(fut),
        }
    }

    fn current_task_id(&self) -> TaskId {
        self.current
            .borrow()
            .as_ref()
            .expect("fibrio I/O submitted outside a fiber")
            .tid()
    }

    // ── Buffers ─────────────────────────────────────────────────────────

    pub(crate) fn try_alloc_chunk(&self) -> Result<Chunk> {
        self.pool.try_alloc().ok_or(Error::NoBufferSpace)
    }

    pub(crate) async fn alloc_chunk_or_wait(self: &Rc<Self>) -> Chunk {
        let wait = self.pool.alloc_or_wait();
        wait.await
    }

    /// Acquire an I/O staging buffer: a registered chunk when the region
    /// registration succeeded (waiting for one on exhaustion), otherwise a
    /// plain heap block.
    pub(crate) async fn acquire_buf(self: &Rc<Self>) -> IoBuf {
        if self.fixed_registered {
            let wait = self.pool.alloc_or_wait();
            IoBuf::Fixed(wait.await)
        } else {
            IoBuf::Heap(vec![0u8; self.block_size].into_boxed_slice())
        }
    }

    // ── Operation submission ────────────────────────────────────────────

    /// Submit a read/write request. The returned future resolves with the
    /// total transferred byte count once the retry machine settles.
    pub(crate) fn submit_rw(self: &Rc<Self>, rw: RwOp) -> OpFuture {
        let slot: CompletionSlot = Rc::new(Cell::new(None));
        let fut = OpFuture::new(Rc::clone(&slot));
        if let Some(reason) = rw.ctx.get_error() {
            slot.set(Some(Err(reason)));
            return fut;
        }
        let key = self.ops.borrow_mut().alloc_key();
        let task = self.current_task_id();
        let ctx = Rc::clone(&rw.ctx);
        self.push_rw(key, &rw);
        self.ops.borrow_mut().insert(
            key,
            OpRecord {
                kind: OpKind::Rw(rw),
                task,
                slot,
            },
        );
        self.install_cancel(&ctx, key);
        fut
    }

    /// Submit a cancellable single-shot operation. `keep` holds any
    /// allocations the kernel reads until the CQE arrives.
    pub(crate) fn submit_cancellable(
        self: &Rc<Self>,
        ctx: Rc<FiberCtx>,
        keep: Option<Box<dyn Any>>,
        build: BuildSqe,
    ) -> OpFuture {
        let slot: CompletionSlot = Rc::new(Cell::new(None));
        let fut = OpFuture::new(Rc::clone(&slot));
        if let Some(reason) = ctx.get_error() {
            slot.set(Some(Err(reason)));
            return fut;
        }
        let key = self.ops.borrow_mut().alloc_key();
        let task = self.current_task_id();
        self.ops.borrow_mut().insert(
            key,
            OpRecord {
                kind: OpKind::Cancellable {
                    ctx: Rc::clone(&ctx),
                    keep,
                },
                task,
                slot,
            },
        );
        self.push_build(build, key);
        self.install_cancel(&ctx, key);
        fut
    }

    /// Submit a non-cancellable operation (close, noop): no cancel hook,
    /// raw result delivered unconditionally.
    pub(crate) fn submit_plain(self: &Rc<Self>, build: BuildSqe) -> OpFuture {
        let slot: CompletionSlot = Rc::new(Cell::new(None));
        let fut = OpFuture::new(Rc::clone(&slot));
        let key = self.ops.borrow_mut().alloc_key();
        let task = self.current_task_id();
        self.ops.borrow_mut().insert(
            key,
            OpRecord {
                kind: OpKind::Plain,
                task,
                slot,
            },
        );
        self.push_build(build, key);
        fut
    }

    fn install_cancel(self: &Rc<Self>, ctx: &Rc<FiberCtx>, key: u64) {
        let weak = Rc::downgrade(self);
        ctx.set_cancel_fn(move |_reason| {
            if let Some(sched) = weak.upgrade() {
                sched.submit_async_cancel(key);
            }
        });
    }

    /// Target an in-flight operation with an async-cancel. The cancel's own
    /// CQE is checked on a no-fiber record: 0 / ENOENT / EALREADY are the
    /// expected answers, anything else is reported.
    fn submit_async_cancel(self: &Rc<Self>, target: u64) {
        let key = self.ops.borrow_mut().alloc_key();
        let slot: CompletionSlot = Rc::new(Cell::new(None));
        let check: Box<dyn FnOnce(i32)> = Box::new(move |res| {
            if !Error::cancel_result_is_benign(res) {
                eprintln!(
                    "[fibrio] async-cancel of op {} failed: {}",
                    target,
                    Error::from_errno(res)
                );
            }
        });
        self.ops.borrow_mut().insert(
            key,
            OpRecord {
                kind: OpKind::Callback(check),
                task: TaskId::MAIN, // unused: no fiber waits on this record
                slot,
            },
        );
        self.push_build(
            Box::new(move |ring, user_data| ring.cancel(target, user_data)),
            key,
        );
    }

    fn push_rw(self: &Rc<Self>, key: u64, rw: &RwOp) {
        let pushed = push_rw_sqe(&mut self.ring.borrow_mut(), rw, key).is_ok();
        if pushed {
            self.in_flight.set(self.in_flight.get() + 1);
        } else {
            self.io_q
                .borrow_mut()
                .push_back(Box::new(move |s| s.retry_push_rw(key)));
        }
    }

    fn retry_push_rw(self: &Rc<Self>, key: u64) {
        let pushed = {
            let ops = self.ops.borrow();
            let Some(rec) = ops.get(key) else {
                return; // op was torn down before it ever reached the ring
            };
            match &rec.kind {
                OpKind::Rw(rw) => push_rw_sqe(&mut self.ring.borrow_mut(), rw, key).is_ok(),
                _ => unreachable!("retry_push_rw on a non-rw record"),
            }
        };
        if pushed {
            self.in_flight.set(self.in_flight.get() + 1);
        } else {
            self.io_q
                .borrow_mut()
                .push_front(Box::new(move |s| s.retry_push_rw(key)));
        }
    }

    fn push_build(self: &Rc<Self>, build: BuildSqe, key: u64) {
        let pushed = build(&mut self.ring.borrow_mut(), key).is_ok();
        if pushed {
            self.in_flight.set(self.in_flight.get() + 1);
        } else {
            self.io_q
                .borrow_mut()
                .push_back(Box::new(move |s| s.push_build(build, key)));
        }
    }

    // ── Completion dispatch ─────────────────────────────────────────────

    fn dispatch(self: &Rc<Self>, key: u64, res: i32) {
        self.in_flight.set(self.in_flight.get() - 1);
        let rec = self.ops.borrow_mut().remove(key);
        match rec {
            None => sched_debug!(self, "stray completion for op {} ({})", key, res),
            Some(rec) => match rec.kind {
                OpKind::Callback(f) => f(res),
                OpKind::Plain => {
                    let out = if res < 0 {
                        Err(Error::from_errno(res))
                    } else {
                        Ok(res)
                    };
                    self.deliver(rec.slot, rec.task, out);
                }
                OpKind::Cancellable { ctx, keep } => {
                    ctx.clear_cancel_fn();
                    let out = match ctx.get_error() {
                        Some(reason) => Err(reason),
                        None if res < 0 => Err(Error::from_errno(res)),
                        None => Ok(res),
                    };
                    drop(keep);
                    self.deliver(rec.slot, rec.task, out);
                }
                OpKind::Rw(mut rw) => {
                    rw.ctx.clear_cancel_fn();
                    match rw.on_cqe(res) {
                        RwOutcome::Done(out) => self.deliver(rec.slot, rec.task, out),
                        RwOutcome::Resubmit => {
                            let ctx = Rc::clone(&rw.ctx);
                            self.push_rw(key, &rw);
                            self.ops.borrow_mut().insert(
                                key,
                                OpRecord {
                                    kind: OpKind::Rw(rw),
                                    task: rec.task,
                                    slot: rec.slot,
                                },
                            );
                            self.install_cancel(&ctx, key);
                        }
                    }
                }
            },
        }
        // A finished operation frees one SQE slot: hand it to the oldest
        // operation parked on the overflow FIFO.
        let thunk = self.io_q.borrow_mut().pop_front();
        if let Some(thunk) = thunk {
            thunk(self);
        }
    }

    fn deliver(&self, slot: CompletionSlot, task: TaskId, out: Result<i32>) {
        slot.set(Some(out));
        self.enqueue_local(task);
    }

    // ── Monitor fiber ───────────────────────────────────────────────────

    /// Daemon that keeps an 8-byte ring read armed on the eventfd. Each
    /// wakeup CQE bounces the loop back to the run queue; shutdown cancels
    /// this fiber, async-cancelling the read.
    fn spawn_monitor(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let efd = self.remote.eventfd();
        let fut = async move {
            let mut buf = [0u8; 8];
            loop {
                let Some(sched) = weak.upgrade() else { break };
                let ctx = current_ctx();
                let op = RwOp {
                    ctx,
                    dir: crate::op::Dir::Read,
                    fd: efd,
                    mode: crate::op::LenMode::Exactly,
                    buf: crate::op::RwBuf::Single {
                        ptr: buf.as_mut_ptr(),
                        fixed_index: None,
                    },
                    total: buf.len(),
                    cur: 0,
                    file_offset: OFFSET_CURRENT,
                };
                let pending = sched.submit_rw(op);
                drop(sched);
                match pending.await {
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        };
        let task = self.tasks.insert(Box::pin(fut), true, Arc::clone(&self.remote));
        self.enqueue_local(task.id);
    }

    // ── Main loop ───────────────────────────────────────────────────────

    fn event_loop(self: &Rc<Self>, main: Pin<&mut impl Future<Output = ()>>) -> Result<()> {
        let mut main = main;
        let main_waker = remote_waker(TaskId::MAIN, Arc::clone(&self.remote));
        loop {
            // Absorb runnables pushed by other threads.
            while let Some(id) = self.remote.pop() {
                self.enqueue_local(id);
            }

            // 1. Dispatch one runnable.
            let next = self.run_q.borrow_mut().pop_front();
            if let Some(id) = next {
                if id == TaskId::MAIN {
                    if !self.main_done.get() {
                        *self.current.borrow_mut() = Some(Rc::clone(&self.main_ctx));
                        let mut cx = Context::from_waker(&main_waker);
                        let done = main.as_mut().poll(&mut cx).is_ready();
                        *self.current.borrow_mut() = None;
                        if done {
                            self.main_done.set(true);
                            sched_debug!(self, "top-level fiber finished");
                        }
                    }
                } else {
                    self.poll_task(id);
                }
                continue;
            }

            // 2. Fire one due timer.
            let due = self.sleep_q.borrow_mut().pop_due(Instant::now());
            if let Some((task, state)) = due {
                state.fire();
                self.enqueue_local(task);
                continue;
            }

            // 3. Dispatch one ready completion.
            let cqe = self.ring.borrow_mut().peek();
            if let Some((key, res)) = cqe {
                self.dispatch(key, res);
                continue;
            }

            // Every ordinary fiber is done: release the daemons so their
            // in-flight operations (the eventfd read) get cancelled.
            if self.main_done.get()
                && !self.daemons_cancelled.get()
                && self.tasks.non_daemon_count() == 0
            {
                self.daemons_cancelled.set(true);
                sched_debug!(self, "cancelling {} daemon fiber(s)", self.tasks.len());
                for ctx in self.tasks.daemon_ctxs() {
                    ctx.cancel(Error::Cancelled);
                }
                continue;
            }

            // 4. Push pending submissions to the kernel.
            self.ring.borrow_mut().submit()?;
            let timeout = self
                .sleep_q
                .borrow_mut()
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            if matches!(timeout, Some(t) if t.is_zero()) {
                continue; // a timer became due while we were at it
            }

            // 5. Exit: nothing in flight and nothing scheduled can ever
            // produce another event.
            if timeout.is_none() && self.in_flight.get() == 0 {
                assert!(
                    self.pool.waiters() == 0,
                    "fibrio: scheduler exiting with fibers parked on the buffer wait list"
                );
                debug_assert!(self.ops.borrow().is_empty());
                break;
            }

            // 6. Park until a completion, a wakeup, or the deadline.
            self.remote.prepare_to_park();
            if !self.remote.is_empty() {
                self.remote.finish_park();
                continue;
            }
            let waited = self.ring.borrow_mut().wait(timeout);
            self.remote.finish_park();
            waited?;
        }
        Ok(())
    }
}

/// Install this scheduler as the thread's runtime; restore on drop and
/// drain the ring so teardown under a panic releases kernel resources
/// without masking the original unwind.
fn install(sched: &Rc<Scheduler>) -> Result<InstallGuard> {
    CURRENT_SCHED.with(|s| {
        let mut slot = s.borrow_mut();
        assert!(
            slot.is_none(),
            "fibrio::run called from inside a running fibrio runtime"
        );
        *slot = Some(Rc::clone(sched));
        Ok(InstallGuard {
            sched: Rc::clone(sched),
        })
    })
}

struct InstallGuard {
    sched: Rc<Scheduler>,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        CURRENT_SCHED.with(|s| s.borrow_mut().take());
        let sched = &self.sched;
        let Ok(mut ring) = sched.ring.try_borrow_mut() else {
            return;
        };
        // On the normal path nothing is in flight and this is a no-op. On
        // an unwind, outstanding operations still reference fiber memory
        // that is only freed once the scheduler itself drops, so abort
        // them and wait the completions out here. Secondary failures are
        // swallowed; the original unwind must not be masked.
        let mut outstanding = sched.in_flight.get();
        if outstanding > 0 {
            for key in sched.ops.borrow().keys() {
                let _ = ring.cancel(key, TEARDOWN_CANCEL_TAG);
            }
        }
        let _ = ring.submit();
        let mut rounds = 0;
        while outstanding > 0 && rounds < 200 {
            if ring.wait(Some(std::time::Duration::from_millis(10))).is_err() {
                break;
            }
            while let Some((key, _res)) = ring.peek() {
                if key != TEARDOWN_CANCEL_TAG {
                    outstanding = outstanding.saturating_sub(1);
                }
            }
            rounds += 1;
        }
        if outstanding > 0 {
            eprintln!(
                "[fibrio] teardown gave up on {} in-flight operation(s)",
                outstanding
            );
        }
    }
}

/// user_data for teardown-time async-cancels; never allocated by the op
/// table (keys are monotonic from 1).
const TEARDOWN_CANCEL_TAG: u64 = u64::MAX;

fn ignore_sigpipe() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Process-global side effect: writes to closed pipes and sockets
        // report EPIPE instead of killing the process.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}
