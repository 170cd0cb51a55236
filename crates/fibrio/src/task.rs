//! Fiber tasks
//!
//! A fiber is a `!Send` future owned by its scheduler's task table and
//! polled only on the owning OS thread. The per-task [`Waker`] is the one
//! `Send` handle: waking pushes the task id onto the scheduler's
//! cross-thread wake queue, which any OS thread may do.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Wake, Waker};

use fibrio_core::{Error, FiberCtx, TaskId, WakeQueue};

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct Task {
    pub id: TaskId,
    pub ctx: Rc<FiberCtx>,
    /// Taken out while being polled; `None` plus table absence means done.
    pub future: RefCell<Option<TaskFuture>>,
    pub waker: Waker,
    /// Daemon fibers do not keep the scheduler alive; they are cancelled
    /// once every ordinary fiber has finished.
    pub daemon: bool,
}

/// Cross-thread waker: enqueue the task id, signalling the eventfd if the
/// owning scheduler is parked.
struct RemoteWaker {
    id: TaskId,
    queue: Arc<WakeQueue<TaskId>>,
}

impl Wake for RemoteWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

pub(crate) fn remote_waker(id: TaskId, queue: Arc<WakeQueue<TaskId>>) -> Waker {
    Waker::from(Arc::new(RemoteWaker { id, queue }))
}

/// All live fibers of one scheduler instance.
pub(crate) struct TaskTable {
    tasks: RefCell<HashMap<u64, Rc<Task>>>,
    next_id: Cell<u64>,
    non_daemon: Cell<usize>,
}

impl TaskTable {
    pub fn new() -> Self {
        TaskTable {
            tasks: RefCell::new(HashMap::new()),
            // Id 0 is reserved for the top-level fiber, which lives on the
            // stack of `run` rather than in this table.
            next_id: Cell::new(1),
            non_daemon: Cell::new(0),
        }
    }

    pub fn insert(
        &self,
        future: TaskFuture,
        daemon: bool,
        queue: Arc<WakeQueue<TaskId>>,
    ) -> Rc<Task> {
        let raw = self.next_id.get();
        self.next_id.set(raw + 1);
        let id = TaskId::new(raw);
        let task = Rc::new(Task {
            id,
            ctx: FiberCtx::new(id),
            future: RefCell::new(Some(future)),
            waker: remote_waker(id, queue),
            daemon,
        });
        self.tasks.borrow_mut().insert(raw, Rc::clone(&task));
        if !daemon {
            self.non_daemon.set(self.non_daemon.get() + 1);
        }
        task
    }

    pub fn get(&self, id: TaskId) -> Option<Rc<Task>> {
        self.tasks.borrow().get(&id.as_u64()).cloned()
    }

    pub fn remove(&self, id: TaskId) {
        if let Some(task) = self.tasks.borrow_mut().remove(&id.as_u64()) {
            if !task.daemon {
                self.non_daemon.set(self.non_daemon.get() - 1);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn non_daemon_count(&self) -> usize {
        self.non_daemon.get()
    }

    /// Contexts of all live daemon fibers (for shutdown cancellation).
    pub fn daemon_ctxs(&self) -> Vec<Rc<FiberCtx>> {
        self.tasks
            .borrow()
            .values()
            .filter(|t| t.daemon)
            .map(|t| Rc::clone(&t.ctx))
            .collect()
    }
}

struct JoinState<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// Handle to a spawned fiber. Awaiting it yields the fiber's output;
/// dropping it detaches the fiber.
pub struct JoinHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
    ctx: Rc<FiberCtx>,
}

/// Create the two halves of a join channel. The sender goes into the
/// spawned fiber's wrapper; the pending half becomes a [`JoinHandle`] once
/// the fiber's context exists.
pub(crate) fn join_pair<T>() -> (JoinSender<T>, PendingJoin<T>) {
    let state = Rc::new(RefCell::new(JoinState {
        value: None,
        waker: None,
    }));
    (
        JoinSender {
            state: Rc::clone(&state),
        },
        PendingJoin { state },
    )
}

pub(crate) struct PendingJoin<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> PendingJoin<T> {
    pub fn into_handle(self, ctx: Rc<FiberCtx>) -> JoinHandle<T> {
        JoinHandle {
            state: self.state,
            ctx,
        }
    }
}

impl<T> JoinHandle<T> {
    /// Cancel the spawned fiber with `reason`. The fiber still runs to
    /// completion (observing the cancellation at its next suspension
    /// point), so the handle remains awaitable.
    pub fn cancel(&self, reason: Error) -> bool {
        self.ctx.cancel(reason)
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().value.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        match state.value.take() {
            Some(v) => std::task::Poll::Ready(v),
            None => {
                state.waker = Some(cx.waker().clone());
                std::task::Poll::Pending
            }
        }
    }
}

/// Completion side of a [`JoinHandle`], held by the spawned fiber's wrapper.
pub(crate) struct JoinSender<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinSender<T> {
    pub fn send(self, value: T) {
        let waker = {
            let mut state = self.state.borrow_mut();
            state.value = Some(value);
            state.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}
