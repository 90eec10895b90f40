//! Intrusive lock-free multi-producer single-consumer queue.
//!
//! Nodes embed a [`Links`] header and are handed over as `Box<T>`: the queue
//! owns every node from `push` until the consumer takes it back. Producers
//! never block each other (one swap per push). The consumer may observe a node
//! that has been swapped into the tail but not yet linked; it spins on that
//! transient state, which only lasts for the two instructions of the
//! producer's push.
//!
//! Consumer operations are `unsafe`: exactly one thread at a time may act as
//! the consumer. The scheduler's serial queues guarantee this by construction
//! (only the producer that saw the empty-to-non-empty transition starts a
//! drain, and the drain runs until the queue closes again).

use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// Link header embedded in every queue node.
#[derive(Debug)]
pub struct Links {
    next: AtomicPtr<Links>,
}

impl Links {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::new()
    }
}

/// A type that can be linked into an [`MpscQueue`].
///
/// The usual implementation puts `Links` as the first field of a
/// `#[repr(C)]` struct, which makes `from_links` a plain pointer cast:
///
/// ```
/// use std::ptr::NonNull;
/// use strand::mpsc::{Linked, Links};
///
/// #[repr(C)]
/// struct Entry {
///     links: Links,
///     value: u32,
/// }
///
/// unsafe impl Linked for Entry {
///     fn links(&self) -> &Links {
///         &self.links
///     }
///
///     unsafe fn from_links(links: NonNull<Links>) -> NonNull<Self> {
///         links.cast()
///     }
/// }
/// ```
///
/// # Safety
///
/// `links` must always return the same embedded header, and `from_links` must
/// be its exact inverse.
pub unsafe trait Linked {
    fn links(&self) -> &Links;

    /// Recovers the node from a pointer to its embedded header.
    ///
    /// # Safety
    ///
    /// `links` must have been obtained from [`Linked::links`] on a live node.
    unsafe fn from_links(links: NonNull<Links>) -> NonNull<Self>;
}

/// Intrusive MPSC queue. See the module documentation.
pub struct MpscQueue<T: Linked> {
    /// Sentinel; its `next` is the first pending node. Consumer-owned except
    /// when a producer links the first node after the queue was empty.
    stub: NonNull<Links>,
    /// Last linked (or being linked) node. Equal to `stub` when empty.
    tail: CachePadded<AtomicPtr<Links>>,
    _owns: PhantomData<Box<T>>,
}

// SAFETY: nodes move between threads as `Box<T>`; all shared state is atomic.
unsafe impl<T: Linked + Send> Send for MpscQueue<T> {}
// SAFETY: `push` is safe from any thread; consumer access is gated by `unsafe`.
unsafe impl<T: Linked + Send> Sync for MpscQueue<T> {}

impl<T: Linked> MpscQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let stub = NonNull::from(Box::leak(Box::new(Links::new())));
        Self {
            stub,
            tail: CachePadded::new(AtomicPtr::new(stub.as_ptr())),
            _owns: PhantomData,
        }
    }

    /// Appends `node`. Safe from any number of threads.
    ///
    /// Returns `true` when the queue was empty before this push. Exactly one
    /// push observes each empty-to-non-empty transition, which is what the
    /// serial queues use to decide who schedules the drain.
    pub fn push(&self, node: Box<T>) -> bool {
        let node = Box::into_raw(node);
        // SAFETY: `node` is a live allocation we own until it is published.
        let links = unsafe { ptr::from_ref((*node).links()).cast_mut() };

        // SAFETY: same as above.
        unsafe { (*links).next.store(ptr::null_mut(), Ordering::Relaxed) };

        let prev = self.tail.swap(links, Ordering::AcqRel);

        // SAFETY: `prev` stays alive until its `next` is linked: the consumer
        // only frees a node once it either closed the queue on it (then the
        // swap above would have returned the stub) or saw its `next` set.
        unsafe { (*prev).next.store(links, Ordering::Release) };

        prev == self.stub.as_ptr()
    }

    /// Racy emptiness peek for the consumer: may report empty while a push is
    /// still in flight, never reports non-empty for an empty queue.
    #[inline]
    #[must_use]
    pub fn looks_empty(&self) -> bool {
        // SAFETY: the stub lives as long as the queue.
        unsafe { self.stub.as_ref().next.load(Ordering::Relaxed).is_null() }
    }

    /// Begins draining the queue.
    ///
    /// Returns `None` if there is nothing to drain. Otherwise the returned
    /// [`Drain`] must be run to completion: alternate [`Drain::fast`] and
    /// [`Drain::end`] until `end` returns `None`. Abandoning a drain leaks the
    /// remaining nodes and leaves the queue open.
    ///
    /// # Safety
    ///
    /// The caller must be the only consumer of this queue for the whole
    /// lifetime of the drain.
    pub unsafe fn drain_start(&self) -> Option<Drain<'_, T>> {
        // SAFETY: the stub lives as long as the queue.
        let stub = unsafe { self.stub.as_ref() };

        let head = stub.next.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        stub.next.store(ptr::null_mut(), Ordering::Relaxed);

        Some(Drain { queue: self, head })
    }

    /// Drains every pending node, passing each to `f` in FIFO order and then
    /// freeing it. Returns the number of nodes visited.
    ///
    /// Nodes pushed while the drain is running are part of the same drain;
    /// the call returns only once the queue has been closed.
    ///
    /// # Safety
    ///
    /// Same as [`drain_start`](Self::drain_start).
    pub unsafe fn drain_with(&self, mut f: impl FnMut(&T)) -> usize {
        // SAFETY: forwarded from the caller.
        let Some(mut drain) = (unsafe { self.drain_start() }) else {
            return 0;
        };

        let mut count = 0;
        loop {
            let last = drain.fast(|node| {
                count += 1;
                f(&node);
            });
            count += 1;
            f(last);

            match drain.end(drop) {
                Some(next) => drain = next,
                None => return count,
            }
        }
    }

    /// Pops a single node.
    ///
    /// With `block` set, a node that is visible but still being linked is
    /// waited for. Without it, that state yields `None`. `None` is also
    /// returned while a [`Drain`] is in progress.
    ///
    /// # Safety
    ///
    /// The caller must be the only consumer of this queue. Nested calls from
    /// the same thread are fine.
    pub unsafe fn pop(&self, block: bool) -> Option<Box<T>> {
        // SAFETY: the stub lives as long as the queue.
        let stub = unsafe { self.stub.as_ref() };

        let head = stub.next.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }

        // SAFETY: `head` is a published node owned by the queue.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if !next.is_null() {
            stub.next.store(next, Ordering::Relaxed);
            // SAFETY: `head` is unlinked and no producer will touch it again.
            return Some(unsafe { Self::node(head) });
        }

        // SAFETY: `head` is a published node owned by the queue.
        if unsafe { self.pop_slow(head, block) } {
            // SAFETY: `pop_slow` detached `head` from the queue.
            Some(unsafe { Self::node(head) })
        } else {
            None
        }
    }

    /// `head` is the only visible node. Detach it, either by closing the
    /// queue on it or by waiting for its successor to be linked.
    unsafe fn pop_slow(&self, head: *mut Links, block: bool) -> bool {
        // SAFETY: the stub lives as long as the queue.
        let stub = unsafe { self.stub.as_ref() };

        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            stub.next.store(ptr::null_mut(), Ordering::Relaxed);
            if self
                .tail
                .compare_exchange(tail, self.stub.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            // A producer got in; it links behind `head`, not the stub.
            stub.next.store(head, Ordering::Relaxed);
        }

        // SAFETY: `head` is still owned by the queue.
        let Some(next) = (unsafe { Self::wait_next(head, block) }) else {
            return false;
        };
        stub.next.store(next, Ordering::Relaxed);
        true
    }

    /// Loads `node.next`, spinning until it is linked if `block` is set.
    unsafe fn wait_next(node: *mut Links, block: bool) -> Option<*mut Links> {
        let backoff = Backoff::new();
        loop {
            // SAFETY: caller guarantees `node` is live.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if !next.is_null() {
                return Some(next);
            }
            if !block {
                return None;
            }
            backoff.snooze();
        }
    }

    /// # Safety
    ///
    /// `links` must be the header of a node pushed into this queue and no
    /// longer reachable by producers or other consumer paths.
    unsafe fn node(links: *mut Links) -> Box<T> {
        // SAFETY: forwarded from the caller; nodes come from `Box::into_raw`.
        unsafe { Box::from_raw(T::from_links(NonNull::new_unchecked(links)).as_ptr()) }
    }
}

impl<T: Linked> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes producers and consumers; every
        // reachable node was pushed through `Box::into_raw`.
        unsafe {
            let mut cur = self.stub.as_ref().next.load(Ordering::Acquire);
            while !cur.is_null() {
                let next = (*cur).next.load(Ordering::Acquire);
                drop(Self::node(cur));
                cur = next;
            }
            drop(Box::from_raw(self.stub.as_ptr()));
        }
    }
}

/// An in-progress drain, created by [`MpscQueue::drain_start`].
pub struct Drain<'a, T: Linked> {
    queue: &'a MpscQueue<T>,
    head: *mut Links,
}

impl<T: Linked> Drain<'_, T> {
    /// Hands every node that already has a successor to `f`, and returns the
    /// last visible node, which must stay in place until [`end`](Self::end).
    ///
    /// Producers may still be linking behind the returned node, so it is only
    /// borrowed.
    pub fn fast(&mut self, mut f: impl FnMut(Box<T>)) -> &T {
        let mut h = self.head;
        loop {
            // SAFETY: `h` is owned by this drain.
            let next = unsafe { (*h).next.load(Ordering::Acquire) };
            if next.is_null() {
                break;
            }
            // SAFETY: `h` has a successor, so no producer will write to it.
            f(unsafe { MpscQueue::<T>::node(h) });
            h = next;
        }
        self.head = h;

        // SAFETY: `h` stays alive until `end`; producers only touch its
        // atomic `next`.
        unsafe { T::from_links(NonNull::new_unchecked(h)).as_ref() }
    }

    /// Finishes a drain round.
    ///
    /// Frees the last node through `free`. Returns `None` when the queue was
    /// closed on that node (the drain is over), or `Some(drain)` when more
    /// nodes arrived and the caller must run another [`fast`](Self::fast)
    /// round.
    pub fn end(self, free: impl FnOnce(Box<T>)) -> Option<Self> {
        let h = self.head;
        let queue = self.queue;

        let closed = queue.tail.load(Ordering::Acquire) == h
            && queue
                .tail
                .compare_exchange(h, queue.stub.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

        let rest = if closed {
            None
        } else {
            // SAFETY: `h` is not the tail, so its successor is being linked.
            let next = unsafe { MpscQueue::<T>::wait_next(h, true) };
            next.map(|head| Drain { queue, head })
        };

        // SAFETY: `h` is either closed off or has a successor; nobody else
        // references it.
        free(unsafe { MpscQueue::<T>::node(h) });

        rest
    }
}
