//! Sleep queue
//!
//! Min-heap of absolute deadlines, one entry per suspended sleeper.
//! Cancellation is lazy: cancelled sequence numbers go into a set and are
//! skipped (and dropped) when they surface at the top of the heap, so
//! removal is O(1) amortised while pop stays O(log n).

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use fibrio_core::{Result, TaskId};

/// Shared flag the scheduler sets when the deadline fires.
pub(crate) struct SleepState {
    fired: Cell<bool>,
}

impl SleepState {
    fn new() -> Rc<Self> {
        Rc::new(SleepState {
            fired: Cell::new(false),
        })
    }

    pub fn fire(&self) {
        self.fired.set(true);
    }

    pub fn fired(&self) -> bool {
        self.fired.get()
    }
}

struct HeapEntry {
    deadline: Instant,
    seq: u64,
    task: TaskId,
    state: Rc<SleepState>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap; tie-break by sequence number so
        // equal deadlines fire in insertion order.
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

pub(crate) struct SleepQueue {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl SleepQueue {
    pub fn new() -> Self {
        SleepQueue {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, task: TaskId, state: Rc<SleepState>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            deadline,
            seq,
            task,
            state,
        });
        seq
    }

    pub fn cancel(&mut self, seq: u64) -> bool {
        self.cancelled.insert(seq)
    }

    /// Drop lazily-cancelled entries off the top of the heap.
    fn prune(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.seq) {
                self.heap.pop();
            } else {
                break;
            }
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
    }

    /// Take the next sleeper whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TaskId, Rc<SleepState>)> {
        self.prune();
        match self.heap.peek() {
            Some(top) if top.deadline <= now => {
                let entry = self.heap.pop().unwrap();
                Some((entry.task, entry.state))
            }
            _ => None,
        }
    }

    /// Earliest live deadline. Exact (prunes cancelled entries first), so
    /// the scheduler's exit decision can rely on it.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn len(&mut self) -> usize {
        self.prune();
        self.heap.len()
    }
}

/// Suspend the calling fiber until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        seq: None,
        state: SleepState::new(),
    }
}

/// Suspend the calling fiber for `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

pub struct Sleep {
    deadline: Instant,
    seq: Option<u64>,
    state: Rc<SleepState>,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sched = crate::scheduler::current();
        let ctx = crate::scheduler::current_ctx();

        if self.state.fired() {
            // Deadline delivery wins over a cancellation that raced in
            // after the timer fired; the next suspension point reports it.
            ctx.clear_cancel_fn();
            return Poll::Ready(Ok(()));
        }
        if let Some(reason) = ctx.get_error() {
            // Either cancelled before first suspension (no entry yet) or
            // the cancel hook removed our entry and re-enqueued us.
            return Poll::Ready(Err(reason));
        }
        if self.seq.is_none() {
            let task = ctx.tid();
            let seq = sched.sleep_insert(self.deadline, task, Rc::clone(&self.state));
            self.seq = Some(seq);
            let weak = Rc::downgrade(&sched);
            ctx.set_cancel_fn(move |_| {
                if let Some(sched) = weak.upgrade() {
                    sched.sleep_cancelled(seq, task);
                }
            });
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_state() -> Rc<SleepState> {
        SleepState::new()
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut q = SleepQueue::new();
        let now = Instant::now();
        q.insert(now + Duration::from_millis(30), TaskId::new(3), entry_state());
        q.insert(now + Duration::from_millis(10), TaskId::new(1), entry_state());
        q.insert(now + Duration::from_millis(20), TaskId::new(2), entry_state());

        let later = now + Duration::from_millis(50);
        let order: Vec<u64> = std::iter::from_fn(|| q.pop_due(later))
            .map(|(t, _)| t.as_u64())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_not_due_stays_queued() {
        let mut q = SleepQueue::new();
        let now = Instant::now();
        q.insert(now + Duration::from_secs(10), TaskId::new(1), entry_state());
        assert!(q.pop_due(now).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancel_removes_entry() {
        let mut q = SleepQueue::new();
        let now = Instant::now();
        let seq = q.insert(now + Duration::from_secs(1), TaskId::new(1), entry_state());
        assert!(q.cancel(seq));
        assert!(!q.cancel(seq));
        assert_eq!(q.len(), 0);
        assert!(q.next_deadline().is_none());
        assert!(q.pop_due(now + Duration::from_secs(2)).is_none());
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let mut q = SleepQueue::new();
        let now = Instant::now();
        let early = q.insert(now + Duration::from_millis(10), TaskId::new(1), entry_state());
        q.insert(now + Duration::from_millis(90), TaskId::new(2), entry_state());
        q.cancel(early);
        let dl = q.next_deadline().unwrap();
        assert!(dl >= now + Duration::from_millis(90));
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mut q = SleepQueue::new();
        let when = Instant::now() + Duration::from_millis(5);
        q.insert(when, TaskId::new(1), entry_state());
        q.insert(when, TaskId::new(2), entry_state());
        let (first, _) = q.pop_due(when + Duration::from_millis(1)).unwrap();
        let (second, _) = q.pop_due(when + Duration::from_millis(1)).unwrap();
        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);
    }
}
