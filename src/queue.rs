//! An unbounded multi-producer queue that never blocks its producers.
//!
//! This is the classic two-pointer linked list queue described by
//! Michael & Scott ("Simple, Fast, and Practical Non-Blocking and
//! Blocking Concurrent Queue Algorithms", PODC '96). The list always
//! holds one sentinel node; `head` points at it, and the first value
//! lives in the sentinel's successor. Popping a value turns the node
//! that carried it into the new sentinel.
//!
//! Retired sentinels are handed to `crossbeam_epoch`, which frees
//! them once no pinned thread can still be looking at them.
//!
//! The rate drivers use exactly one consumer per queue, but `pop` is
//! tolerant of racing consumers, too.

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

struct Node<T> {
    /// Uninitialized in the sentinel; initialized in every node
    /// after it.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Owned<Node<T>> {
        Owned::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        })
    }
}

/// A lock-free FIFO queue of `T`s.
///
/// # Example
/// ```
/// use admission_meter::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.push("a");
/// queue.push("b");
/// assert_eq!(Some("a"), queue.pop());
/// assert_eq!(Some("b"), queue.pop());
/// assert_eq!(None, queue.pop());
/// ```
pub struct LockFreeQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "LockFreeQueue{{empty: {}}}", self.is_empty())
    }
}

impl<T> LockFreeQueue<T> {
    /// Constructs an empty queue.
    pub fn new() -> Self {
        let queue = LockFreeQueue {
            head: Atomic::null(),
            tail: Atomic::null(),
        };
        // Nobody else can observe the queue yet.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Node::sentinel().into_shared(guard);
            queue.head.store(sentinel, Relaxed);
            queue.tail.store(sentinel, Relaxed);
        }
        queue
    }

    /// Appends `value` at the end of the queue.
    ///
    /// This never blocks: if another producer wins the race for the
    /// tail node, this one helps advance `tail` and tries again.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });
        loop {
            let tail = self.tail.load(Acquire, guard);
            // `tail` always points at a live node; see `new`.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Acquire, guard);
            if !next.is_null() {
                // `tail` lags behind a node that was already linked;
                // swing it forward and retry from there.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Release, Relaxed, guard);
                continue;
            }
            match tail_ref
                .next
                .compare_exchange(Shared::null(), node, Release, Relaxed, guard)
            {
                Ok(linked) => {
                    // If this fails, the next push or pop that sees the
                    // stale tail will advance it.
                    let _ = self
                        .tail
                        .compare_exchange(tail, linked, Release, Relaxed, guard);
                    return;
                }
                Err(lost) => node = lost.new,
            }
        }
    }

    /// Removes and returns the oldest value in the queue, or `None`
    /// if the queue is empty. Never blocks.
    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Acquire, guard);
            let tail = self.tail.load(Acquire, guard);
            let next = unsafe { head.deref() }.next.load(Acquire, guard);

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // A push is midway: its node is linked but `tail`
                // hasn't moved yet.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Release, Relaxed, guard);
                continue;
            }

            // head is strictly behind tail, so it must have a successor.
            let next_ref = match unsafe { next.as_ref() } {
                Some(node) => node,
                None => corrupted("head trails tail but has no successor"),
            };
            if self
                .head
                .compare_exchange(head, next, Release, Relaxed, guard)
                .is_ok()
            {
                unsafe {
                    // `next` is the new sentinel; its value moves out
                    // and must never be read again.
                    let value = next_ref.value.as_ptr().read();
                    guard.defer_destroy(head);
                    return Some(value);
                }
            }
        }
    }

    /// Returns `true` if there was nothing to pop at the time of the
    /// call.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Acquire, guard);
        unsafe { head.deref() }.next.load(Acquire, guard).is_null()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Relaxed, guard);
            // The sentinel's value is uninitialized (or was moved
            // out); every node after it still owns its value.
            let mut is_sentinel = true;
            while let Some(node_ref) = node.as_ref() {
                let next = node_ref.next.load(Relaxed, guard);
                let mut owned = node.into_owned();
                if !is_sentinel {
                    owned.value.assume_init_drop();
                }
                drop(owned);
                is_sentinel = false;
                node = next;
            }
        }
    }
}

#[cold]
fn corrupted(invariant: &str) -> ! {
    tracing::error!(invariant, "lock-free queue corrupted, aborting");
    std::process::abort()
}
