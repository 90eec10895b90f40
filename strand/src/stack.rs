//! Lock-free push-only stack with batch removal.
//!
//! There is no single-element pop: consumers detach the whole list with one
//! swap, so the classic Treiber ABA problem cannot occur.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

pub(crate) struct TakeStack<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: values move between threads through the stack.
unsafe impl<T: Send> Send for TakeStack<T> {}
// SAFETY: pushes and takes only go through atomics; `iter` is `unsafe`.
unsafe impl<T: Send> Sync for TakeStack<T> {}

impl<T> TakeStack<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `value` and returns a pointer to it. The pointer is valid until
    /// the value is taken or the stack dropped.
    pub(crate) fn push(&self, value: T) -> NonNull<T> {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not published yet.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        // SAFETY: `node` is a live allocation.
        unsafe { NonNull::new_unchecked(&raw mut (*node).value) }
    }

    /// Detaches every pushed value, most recent first.
    pub(crate) fn take_all(&self) -> TakeAll<T> {
        TakeAll {
            cur: self.head.swap(ptr::null_mut(), Ordering::SeqCst),
        }
    }

    /// Pairs with the SeqCst `pending` accesses of `SyncGroup::notify` and
    /// `SyncState::job_done`; must stay SeqCst.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// Walks the stack without detaching it, most recent first.
    ///
    /// # Safety
    ///
    /// No `take_all` may run while the iterator or any reference it yielded is
    /// alive.
    pub(crate) unsafe fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _stack: self,
        }
    }
}

impl<T> Drop for TakeStack<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

/// Owning iterator over a detached list.
pub(crate) struct TakeAll<T> {
    cur: *mut Node<T>,
}

impl<T> Iterator for TakeAll<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: the list was detached by `take_all` and is exclusively ours.
        let node = unsafe { Box::from_raw(self.cur) };
        self.cur = node.next;
        Some(node.value)
    }
}

impl<T> Drop for TakeAll<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

pub(crate) struct Iter<'a, T> {
    cur: *mut Node<T>,
    _stack: &'a TakeStack<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: nodes stay alive while no `take_all` runs (caller contract);
        // `next` is immutable once a node is published.
        let node = unsafe { &*self.cur };
        self.cur = node.next;
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_take_all_is_lifo() {
        let stack = TakeStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.take_all().collect::<Vec<_>>(), vec![3, 2, 1]);
        assert!(stack.is_empty());
        assert_eq!(stack.take_all().count(), 0);
    }

    #[test]
    fn test_iter_keeps_values() {
        let stack = TakeStack::new();
        stack.push("a");
        stack.push("b");

        let seen: Vec<_> = unsafe { stack.iter() }.copied().collect();
        assert_eq!(seen, vec!["b", "a"]);
        assert!(!stack.is_empty());
    }

    #[test]
    fn test_concurrent_push() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1000;

        let stack = Arc::new(TakeStack::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        stack.push(t * PER_THREAD + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<_> = stack.take_all().collect();
        all.sort_unstable();
        assert_eq!(all, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    }
}
