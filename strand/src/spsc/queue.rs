//! Core unbounded SPSC queue algorithm.
//!
//! A singly linked list with a dummy head node. The consumer advances `head`;
//! the producer appends at `tail` and recycles nodes the consumer has moved
//! past, so a steady-state queue allocates nothing. No operation uses a
//! read-modify-write instruction: loads and stores only.
//!
//! Nodes between `first` and `head_copy` are free for reuse. `head_copy` is a
//! producer-local snapshot of `head`, refreshed only when the cached range
//! runs out.
//!
//! # Safety
//!
//! The types in this module have unsafe APIs because they require the caller to
//! uphold the SPSC invariant: exactly one producer and one consumer, with no
//! concurrent access to either role.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

/// Role marker: Fields with this role are owned exclusively by the producer.
pub struct ProducerRole;

/// Role marker: Node payloads whose ownership transfers via the SPSC protocol.
pub struct SlotRole;

/// Interior-mutable cell with a role marker for nominal type safety.
#[repr(transparent)]
pub struct SpscCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> SpscCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}

// SAFETY: each cell is accessed by a single role at a time. Payload hand-off
// is ordered by the Release store of `next` and the Acquire load on the other
// side; producer cells are never touched by the consumer.
unsafe impl<T: Send, Role> Sync for SpscCell<T, Role> {}
unsafe impl<T: Send, Role> Send for SpscCell<T, Role> {}

/// Cell owned exclusively by the producer.
pub type ProducerCell<T> = SpscCell<T, ProducerRole>;

/// Payload cell whose ownership follows the list links.
pub type SlotCell<T> = SpscCell<T, SlotRole>;

pub struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: SlotCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn alloc() -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: SlotCell::new(MaybeUninit::uninit()),
        }))
    }
}

/// Producer-side cursors.
struct ProducerState<T> {
    /// Last node in the list.
    tail: *mut Node<T>,
    /// Oldest node; nodes up to `head_copy` are recyclable.
    first: *mut Node<T>,
    /// Cached copy of the consumer's `head`.
    head_copy: *mut Node<T>,
}

/// Unbounded single-producer single-consumer queue.
pub struct Queue<T> {
    /// Dummy node; its successor is the next value to pop.
    /// Owned by consumer, read by producer.
    head: CachePadded<AtomicPtr<Node<T>>>,

    producer: CachePadded<ProducerCell<ProducerState<T>>>,

    /// Called on every value still queued when the queue is dropped.
    release: Option<fn(T)>,
}

// SAFETY: see `SpscCell`; raw node pointers are owned by the queue.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self::with_release(None)
    }

    /// `release` runs on each undelivered value at drop time.
    pub fn with_release(release: Option<fn(T)>) -> Self {
        let dummy = Node::alloc();
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            producer: CachePadded::new(ProducerCell::new(ProducerState {
                tail: dummy,
                first: dummy,
                head_copy: dummy,
            })),
            release,
        }
    }

    /// Appends a value. Never fails.
    ///
    /// # Safety
    ///
    /// Must only be called by the single producer.
    pub unsafe fn push(&self, value: T) {
        // SAFETY: producer-only state, caller is the producer.
        let state = unsafe { &mut *self.producer.get() };
        // SAFETY: same.
        let node = unsafe { self.alloc_node(state) };

        // SAFETY: `node` is unreachable by the consumer until linked below.
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*(*node).value.get()).write(value);
            (*state.tail).next.store(node, Ordering::Release);
        }
        state.tail = node;
    }

    /// Takes a node for the producer: a recycled one if the consumer has moved
    /// past it, a fresh allocation otherwise.
    unsafe fn alloc_node(&self, state: &mut ProducerState<T>) -> *mut Node<T> {
        if state.first != state.head_copy {
            return unsafe { Self::recycle(state) };
        }
        state.head_copy = self.head.load(Ordering::Acquire);
        if state.first != state.head_copy {
            return unsafe { Self::recycle(state) };
        }
        Node::alloc()
    }

    unsafe fn recycle(state: &mut ProducerState<T>) -> *mut Node<T> {
        let node = state.first;
        // SAFETY: `node` precedes the consumer's head, so its `next` was set by
        // the producer and the consumer no longer reads it.
        state.first = unsafe { (*node).next.load(Ordering::Relaxed) };
        node
    }

    /// Removes the oldest value, or returns `None` if the queue is empty.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    pub unsafe fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: `head` is the consumer-owned dummy node.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // SAFETY: the Acquire load above pairs with the producer's Release
        // store, so the payload is initialized. It is read exactly once:
        // `next` becomes the new dummy.
        let value = unsafe { (*(*next).value.get()).assume_init_read() };
        self.head.store(next, Ordering::Release);

        Some(value)
    }

    /// Racy emptiness check, valid from the consumer side.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: the head node is only freed by `Drop`.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes both roles. Values live in the nodes
        // after `head`; every node from `first` on belongs to the queue.
        unsafe {
            let state = &*self.producer.get();
            if let Some(release) = self.release {
                let mut cur = (*self.head.load(Ordering::Relaxed)).next.load(Ordering::Relaxed);
                while !cur.is_null() {
                    release((*(*cur).value.get()).assume_init_read());
                    cur = (*cur).next.load(Ordering::Relaxed);
                }
            }

            let mut cur = state.first;
            while !cur.is_null() {
                let next = (*cur).next.load(Ordering::Relaxed);
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let q = Queue::<u64>::new();
        unsafe {
            assert_eq!(q.pop(), None);
            q.push(1);
            q.push(2);
            assert_eq!(q.pop(), Some(1));
            assert_eq!(q.pop(), Some(2));
            assert_eq!(q.pop(), None);
        }
    }

    #[test]
    fn test_nodes_are_recycled() {
        let q = Queue::<u64>::new();
        unsafe {
            q.push(1);
            assert_eq!(q.pop(), Some(1));

            // The old dummy is behind the consumer now.
            let recyclable = (*q.producer.get()).first;
            q.push(2);
            assert_eq!((*q.producer.get()).tail, recyclable);
            assert_eq!(q.pop(), Some(2));
        }
    }

    #[test]
    fn test_release_runs_on_undelivered() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static RELEASED: AtomicUsize = AtomicUsize::new(0);

        fn release(v: usize) {
            RELEASED.fetch_add(v, Ordering::Relaxed);
        }

        let q = Queue::<usize>::with_release(Some(release));
        unsafe {
            q.push(1);
            q.push(10);
            q.push(100);
            assert_eq!(q.pop(), Some(1));
        }
        drop(q);

        assert_eq!(RELEASED.load(Ordering::Relaxed), 110);
    }
}
