//! Fixed-buffer pool
//!
//! One contiguous region of `block_size × n_blocks` bytes, registered with
//! the kernel once at startup, carved into equal blocks. `try_alloc` hands
//! out a free block or reports exhaustion; `alloc_or_wait` parks the
//! calling fiber on the pool's wait list (`mem_q`) until a block is freed.
//! Freeing a block hands it directly to the oldest waiter instead of
//! returning it to the free list, so waiters are served FIFO.
//!
//! If buffer registration was refused by the kernel, the same pool still
//! works; chunks simply carry no fixed-buffer index and I/O on them uses
//! the unregistered opcodes.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Waiter {
    cell: Rc<Cell<Option<Chunk>>>,
    waker: Waker,
}

struct PoolInner {
    /// Backing storage. Blocks are mutated through raw pointers derived
    /// from it while it stays logically untouched, hence the cells.
    region: Box<[UnsafeCell<u8>]>,
    block_size: usize,
    n_blocks: usize,
    registered: Cell<bool>,
    free: RefCell<Vec<u16>>,
    waiters: RefCell<VecDeque<Waiter>>,
}

impl PoolInner {
    fn block_ptr(&self, index: u16) -> *mut u8 {
        debug_assert!((index as usize) < self.n_blocks);
        // SAFETY: index is in range; blocks are disjoint by construction.
        unsafe {
            self.region
                .as_ptr()
                .cast::<u8>()
                .cast_mut()
                .add(index as usize * self.block_size)
        }
    }

    fn release(self: &Rc<Self>, index: u16) {
        let waiter = self.waiters.borrow_mut().pop_front();
        match waiter {
            Some(w) => {
                w.cell.set(Some(Chunk {
                    pool: Rc::clone(self),
                    index,
                }));
                w.waker.wake();
            }
            None => self.free.borrow_mut().push(index),
        }
    }
}

/// One block borrowed from the pool. Dropping it returns the block (or
/// hands it to the oldest waiter), so every exit path releases.
pub struct Chunk {
    pool: Rc<PoolInner>,
    index: u16,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.pool.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered-buffer index for `read_fixed`/`write_fixed`, when the
    /// region registration succeeded. The whole region is registered as
    /// buffer 0; chunks address into it by pointer.
    pub(crate) fn fixed_index(&self) -> Option<u16> {
        if self.pool.registered.get() {
            Some(0)
        } else {
            None
        }
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.pool.block_ptr(self.index)
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: this chunk exclusively owns its block while alive.
        unsafe { std::slice::from_raw_parts(self.as_mut_ptr(), self.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

pub(crate) struct FixedPool {
    inner: Rc<PoolInner>,
}

impl FixedPool {
    pub fn new(block_size: usize, n_blocks: usize) -> Self {
        let len = block_size * n_blocks;
        let region: Box<[UnsafeCell<u8>]> = (0..len).map(|_| UnsafeCell::new(0)).collect();
        let free: Vec<u16> = (0..n_blocks as u16).rev().collect();
        FixedPool {
            inner: Rc::new(PoolInner {
                region,
                block_size,
                n_blocks,
                registered: Cell::new(false),
                free: RefCell::new(free),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Base pointer and length of the whole region, for registration.
    pub fn region(&self) -> (*mut u8, usize) {
        (
            self.inner.region.as_ptr().cast::<u8>().cast_mut(),
            self.inner.block_size * self.inner.n_blocks,
        )
    }

    pub fn set_registered(&self, on: bool) {
        self.inner.registered.set(on);
    }

    /// Non-waiting allocation.
    pub fn try_alloc(&self) -> Option<Chunk> {
        let index = self.inner.free.borrow_mut().pop()?;
        Some(Chunk {
            pool: Rc::clone(&self.inner),
            index,
        })
    }

    /// Allocation that suspends the calling fiber until a block frees up.
    pub fn alloc_or_wait(&self) -> AllocOrWait {
        AllocOrWait {
            pool: Rc::clone(&self.inner),
            cell: Rc::new(Cell::new(None)),
            queued: false,
        }
    }

    /// Number of fibers parked on `mem_q`. A non-empty wait list at
    /// scheduler exit is an unrecoverable bug (nothing can ever free).
    pub fn waiters(&self) -> usize {
        self.inner.waiters.borrow().len()
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.free.borrow().len()
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }
}

pub(crate) struct AllocOrWait {
    pool: Rc<PoolInner>,
    cell: Rc<Cell<Option<Chunk>>>,
    queued: bool,
}

impl Future for AllocOrWait {
    type Output = Chunk;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(chunk) = self.cell.take() {
            return Poll::Ready(chunk);
        }
        if !self.queued {
            if let Some(index) = self.pool.free.borrow_mut().pop() {
                return Poll::Ready(Chunk {
                    pool: Rc::clone(&self.pool),
                    index,
                });
            }
            self.pool.waiters.borrow_mut().push_back(Waiter {
                cell: Rc::clone(&self.cell),
                waker: cx.waker().clone(),
            });
            self.queued = true;
        }
        Poll::Pending
    }
}

/// A chunk when the pool has free blocks, a plain heap block otherwise
/// (or when the caller opted out of waiting). Both variants release on
/// drop; only the fixed variant can use the registered-buffer opcodes.
pub(crate) enum IoBuf {
    Fixed(Chunk),
    Heap(Box<[u8]>),
}

impl IoBuf {
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            IoBuf::Fixed(c) => c.as_mut_ptr(),
            IoBuf::Heap(b) => b.as_mut_ptr(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IoBuf::Fixed(c) => c.len(),
            IoBuf::Heap(b) => b.len(),
        }
    }

    pub fn fixed_index(&self) -> Option<u16> {
        match self {
            IoBuf::Fixed(c) => c.fixed_index(),
            IoBuf::Heap(_) => None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            IoBuf::Fixed(c) => c.bytes(),
            IoBuf::Heap(b) => b,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            IoBuf::Fixed(c) => c.bytes_mut(),
            IoBuf::Heap(b) => b,
        }
    }
}
