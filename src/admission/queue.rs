use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::internal_event;
use super::AcquireError;

/// Heap position of a waiter that is not currently queued.
const DETACHED: usize = usize::MAX;

/// One suspended acquisition attempt.
///
/// Shared between the caller awaiting its verdict and the queue. The verdict
/// slot is fulfilled at most once: granting, rejecting, and removal all take
/// the sender, so completing an already-completed waiter is a no-op, and a
/// verdict sent to a caller that has since vanished is silently discarded.
pub(crate) struct Waiter {
    priority: i32,
    pos: AtomicUsize,
    verdict: Mutex<Option<oneshot::Sender<Result<(), AcquireError>>>>,
}

impl Waiter {
    pub(crate) fn new(priority: i32) -> (Arc<Self>, oneshot::Receiver<Result<(), AcquireError>>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Waiter {
            priority,
            pos: AtomicUsize::new(DETACHED),
            verdict: Mutex::new(Some(tx)),
        });
        (waiter, rx)
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority
    }

    /// Hand the waiter its slot. Returns `false` if the waiter was already
    /// completed or its caller is no longer listening; the slot must not be
    /// charged in that case.
    pub(crate) fn grant(&self) -> bool {
        match self.verdict.lock().take() {
            Some(tx) => tx.send(Ok(())).is_ok(),
            None => false,
        }
    }

    /// Best-effort shed notification.
    pub(crate) fn reject(&self) {
        if let Some(tx) = self.verdict.lock().take() {
            let _ = tx.send(Err(AcquireError::Dropped));
            internal_event::emit_dropped();
        }
    }

    fn detach(&self) {
        self.pos.store(DETACHED, Ordering::Relaxed);
    }
}

/// Outcome of [`WaiterQueue::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Pushed,
    Rejected,
}

/// Bounded max-heap of waiters keyed by priority.
///
/// Not synchronized on its own; only ever touched under the limiter mutex.
/// Every queued waiter's `pos` mirrors its index in the backing vector so
/// that removal by handle needs no search.
pub(crate) struct WaiterQueue {
    heap: Vec<Arc<Waiter>>,
    capacity: usize,
}

impl WaiterQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queue a waiter, shedding the weakest occupant if that makes room.
    ///
    /// A rejected waiter (the newcomer when it does not outrank anyone, or
    /// the displaced occupant) is notified before this returns.
    pub(crate) fn push(&mut self, waiter: Arc<Waiter>) -> PushOutcome {
        if self.heap.len() < self.capacity {
            self.insert(waiter);
            return PushOutcome::Pushed;
        }

        match self.weakest_leaf() {
            Some(idx) if self.heap[idx].priority() < waiter.priority() => {
                let victim = self.detach_at(idx);
                victim.reject();
                self.insert(waiter);
                PushOutcome::Pushed
            }
            _ => {
                waiter.reject();
                PushOutcome::Rejected
            }
        }
    }

    /// Remove and return the highest-priority waiter. The caller is
    /// responsible for notifying it.
    pub(crate) fn pop(&mut self) -> Option<Arc<Waiter>> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.detach_at(0))
    }

    /// Remove a specific waiter. A no-op if it is no longer queued.
    pub(crate) fn remove(&mut self, waiter: &Waiter) {
        let idx = waiter.pos.load(Ordering::Relaxed);
        if idx == DETACHED {
            return;
        }
        debug_assert!(std::ptr::eq(self.heap[idx].as_ref(), waiter));
        self.detach_at(idx);
    }

    fn insert(&mut self, waiter: Arc<Waiter>) {
        let idx = self.heap.len();
        waiter.pos.store(idx, Ordering::Relaxed);
        self.heap.push(waiter);
        self.sift_up(idx);
    }

    fn detach_at(&mut self, idx: usize) -> Arc<Waiter> {
        let removed = self.heap.swap_remove(idx);
        removed.detach();
        if idx < self.heap.len() {
            self.heap[idx].pos.store(idx, Ordering::Relaxed);
            if !self.sift_down(idx) {
                self.sift_up(idx);
            }
        }
        removed
    }

    /// The leaves of a max-heap contain its minimum, so scanning
    /// `len/2 .. len` finds the globally weakest waiter in half a pass.
    /// Ties resolve to the first leaf encountered.
    fn weakest_leaf(&self) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        let mut weakest = self.heap.len() / 2;
        for idx in weakest + 1..self.heap.len() {
            if self.heap[idx].priority() < self.heap[weakest].priority() {
                weakest = idx;
            }
        }
        Some(weakest)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].priority() <= self.heap[parent].priority() {
                break;
            }
            self.swap_nodes(idx, parent);
            idx = parent;
        }
    }

    /// Returns whether the element moved.
    fn sift_down(&mut self, mut idx: usize) -> bool {
        let start = idx;
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.heap[right].priority() > self.heap[left].priority() {
                child = right;
            }
            if self.heap[child].priority() <= self.heap[idx].priority() {
                break;
            }
            self.swap_nodes(idx, child);
            idx = child;
        }
        idx != start
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap[a].pos.store(a, Ordering::Relaxed);
        self.heap[b].pos.store(b, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;

    fn queue_of(capacity: usize, priorities: &[i32]) -> WaiterQueue {
        let mut queue = WaiterQueue::new(capacity);
        for &priority in priorities {
            let (waiter, _rx) = Waiter::new(priority);
            queue.push(waiter);
        }
        queue
    }

    #[test]
    fn pop_returns_highest_priority() {
        let cases: &[(&[i32], i32)] = &[
            (&[0, 1], 1),
            (&[1, 0], 1),
            (&[0, 2, 1], 2),
            (&[3, 1, 4, 1, 5, 9, 2, 6], 9),
        ];

        for (priorities, expected) in cases {
            let mut queue = queue_of(priorities.len(), priorities);
            let top = queue.pop().expect("queue is non-empty");
            assert_eq!(
                top.priority(),
                *expected,
                "priorities {priorities:?} popped {}",
                top.priority()
            );
        }
    }

    #[test]
    fn remove_detaches_a_specific_waiter() {
        let mut queue = WaiterQueue::new(3);
        let (a, _a_rx) = Waiter::new(0);
        let (b, _b_rx) = Waiter::new(1);
        let (c, _c_rx) = Waiter::new(2);
        for waiter in [&a, &b, &c] {
            queue.push(Arc::clone(waiter));
        }

        queue.remove(&c);

        let top = queue.pop().expect("two waiters remain");
        assert_eq!(top.priority(), b.priority());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut queue = WaiterQueue::new(2);
        let (waiter, _rx) = Waiter::new(7);
        queue.push(Arc::clone(&waiter));

        queue.remove(&waiter);
        queue.remove(&waiter);

        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_sheds_the_weakest_occupant() {
        let mut queue = WaiterQueue::new(2);
        let (low, mut low_rx) = Waiter::new(0);
        let (mid, mut mid_rx) = Waiter::new(1);
        let (high, mut high_rx) = Waiter::new(2);

        assert_eq!(queue.push(low), PushOutcome::Pushed);
        assert_eq!(queue.push(Arc::clone(&mid)), PushOutcome::Pushed);
        assert_eq!(queue.push(Arc::clone(&high)), PushOutcome::Pushed);

        // The priority-0 waiter was displaced and told so.
        assert_eq!(low_rx.try_recv(), Ok(Err(AcquireError::Dropped)));
        assert_eq!(mid_rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(high_rx.try_recv(), Err(TryRecvError::Empty));

        let mut remaining = vec![
            queue.pop().expect("first of two").priority(),
            queue.pop().expect("second of two").priority(),
        ];
        remaining.sort_unstable();
        assert_eq!(remaining, vec![mid.priority(), high.priority()]);
    }

    #[test]
    fn overflow_rejects_a_newcomer_that_does_not_outrank() {
        let mut queue = queue_of(2, &[5, 5]);
        let (newcomer, mut rx) = Waiter::new(5);

        assert_eq!(queue.push(newcomer), PushOutcome::Rejected);
        assert_eq!(rx.try_recv(), Ok(Err(AcquireError::Dropped)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn zero_capacity_always_rejects() {
        let mut queue = WaiterQueue::new(0);
        let (waiter, mut rx) = Waiter::new(i32::MAX);

        assert_eq!(queue.push(waiter), PushOutcome::Rejected);
        assert_eq!(rx.try_recv(), Ok(Err(AcquireError::Dropped)));
    }

    #[test]
    fn grant_consumes_the_verdict_slot() {
        let (waiter, mut rx) = Waiter::new(1);
        assert!(waiter.grant());
        assert!(!waiter.grant());
        assert_eq!(rx.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn grant_after_receiver_vanished_reports_failure() {
        let (waiter, rx) = Waiter::new(1);
        drop(rx);
        assert!(!waiter.grant());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Push(i32),
        Pop,
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (-8i32..8).prop_map(Op::Push),
            2 => Just(Op::Pop),
            1 => (0usize..16).prop_map(Op::Remove),
        ]
    }

    /// Model check: positions track indices, length respects capacity, every
    /// waiter sees exactly one terminal notification, and pops between
    /// pushes come out in non-increasing priority order.
    fn check_heap_consistency(queue: &WaiterQueue) {
        for (idx, waiter) in queue.heap.iter().enumerate() {
            assert_eq!(waiter.pos.load(Ordering::Relaxed), idx);
            if idx > 0 {
                let parent = (idx - 1) / 2;
                assert!(queue.heap[parent].priority() >= waiter.priority());
            }
        }
        assert!(queue.len() <= queue.capacity());
    }

    proptest! {
        #[test]
        fn random_operations_preserve_invariants(
            capacity in 0usize..8,
            ops in proptest::collection::vec(op_strategy(), 1..64),
        ) {
            let mut queue = WaiterQueue::new(capacity);
            // Receivers for waiters still owed a verdict, parallel to the
            // handles we retain for removal.
            let mut live: Vec<(Arc<Waiter>, oneshot::Receiver<Result<(), AcquireError>>)> =
                Vec::new();
            let mut last_popped: Option<i32> = None;

            for op in ops {
                match op {
                    Op::Push(priority) => {
                        let (waiter, rx) = Waiter::new(priority);
                        queue.push(Arc::clone(&waiter));
                        live.push((waiter, rx));
                        last_popped = None;
                    }
                    Op::Pop => {
                        if let Some(waiter) = queue.pop() {
                            if let Some(previous) = last_popped {
                                prop_assert!(previous >= waiter.priority());
                            }
                            last_popped = Some(waiter.priority());
                            prop_assert!(waiter.grant());
                        }
                    }
                    Op::Remove(pick) => {
                        if !live.is_empty() {
                            let (waiter, _rx) = &live[pick % live.len()];
                            queue.remove(waiter);
                            last_popped = None;
                        }
                    }
                }
                check_heap_consistency(&queue);
            }

            // Drain and account for every verdict: each waiter was granted,
            // dropped, or removed/cancelled, and never notified twice.
            while let Some(waiter) = queue.pop() {
                prop_assert!(waiter.grant());
            }
            for (_waiter, mut rx) in live {
                match rx.try_recv() {
                    Ok(Ok(())) | Ok(Err(AcquireError::Dropped)) => {}
                    // Removed before any verdict: the slot was never sent.
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
                    Ok(Err(other)) => prop_assert!(false, "unexpected verdict {other:?}"),
                }
            }
        }
    }
}
