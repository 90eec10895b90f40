//! Unbounded lock-free SPSC queue for word-sized values.
//!
//! # Overview
//!
//! - [`channel`] - queue of `Copy` values no wider than a pointer
//! - [`ptr_channel`] - queue that moves `Box<U>` ownership across threads
//! - Unbounded: the producer never fails; consumed nodes are recycled by the
//!   producer so a queue in steady state does not allocate
//!
//! # Example
//!
//! ```
//! use strand::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64>();
//!
//! tx.push(42);
//! assert_eq!(rx.pop(), Some(42));
//! assert_eq!(rx.pop(), None);
//! ```

mod queue;

use std::cell::Cell;
use std::hint;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use minstant::Instant;

use crate::evc::Timeout;
use queue::Queue;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

struct WordCheck<T>(PhantomData<T>);

impl<T> WordCheck<T> {
    /// Compile-time assertion that payloads fit in a machine word.
    const OK: () = assert!(
        size_of::<T>() <= size_of::<usize>(),
        "SPSC payloads must fit in a machine word"
    );
}

/// Write end of the SPSC queue.
///
/// `Producer` is [`Send`] but **not** [`Sync`]: it can move to another thread,
/// but `&Producer` cannot be shared, so there is never more than one pusher.
pub struct Producer<T: Copy + Send> {
    queue: Arc<Queue<T>>,
    _unsync: PhantomUnsync,
}

/// Read end of the SPSC queue. Same thread-safety rules as [`Producer`].
pub struct Consumer<T: Copy + Send> {
    queue: Arc<Queue<T>>,
    _unsync: PhantomUnsync,
}

/// Creates an unbounded SPSC channel.
///
/// # Panics
///
/// Fails to compile if `T` is wider than `usize`.
#[must_use]
pub fn channel<T: Copy + Send>() -> (Producer<T>, Consumer<T>) {
    let () = WordCheck::<T>::OK;

    let queue = Arc::new(Queue::new());
    (
        Producer {
            queue: Arc::clone(&queue),
            _unsync: PhantomData,
        },
        Consumer {
            queue,
            _unsync: PhantomData,
        },
    )
}

impl<T: Copy + Send> Producer<T> {
    /// Appends a value. Never blocks and never fails.
    #[inline]
    pub fn push(&self, value: T) {
        // SAFETY: `Producer` is the only handle allowed to push and it is
        // `!Sync`, so calls are never concurrent.
        unsafe { self.queue.push(value) }
    }
}

impl<T: Copy + Send> Consumer<T> {
    /// Removes the oldest value, or returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: `Consumer` is the only handle allowed to pop and it is
        // `!Sync`.
        unsafe { self.queue.pop() }
    }

    /// Spins until a value arrives or the timeout elapses.
    pub fn pop_blocking(&self, timeout: impl Into<Timeout>) -> Option<T> {
        let deadline = timeout.into().deadline();

        loop {
            if let Some(value) = self.pop() {
                return Some(value);
            }
            if let Some(dl) = deadline
                && Instant::now() >= dl
            {
                return None;
            }
            hint::spin_loop();
        }
    }

    /// Returns `true` if no value is ready. Racy with respect to the producer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Write end of a [`ptr_channel`].
pub struct PtrProducer<U: Send> {
    queue: Arc<Queue<usize>>,
    _owns: PhantomData<Box<U>>,
    _unsync: PhantomUnsync,
}

/// Read end of a [`ptr_channel`].
pub struct PtrConsumer<U: Send> {
    queue: Arc<Queue<usize>>,
    _owns: PhantomData<Box<U>>,
    _unsync: PhantomUnsync,
}

fn release_box<U>(raw: usize) {
    // SAFETY: every value in a pointer queue came from `Box::into_raw` and was
    // never delivered.
    drop(unsafe { Box::from_raw(raw as *mut U) });
}

/// Creates an unbounded SPSC channel carrying boxed values.
///
/// Each box travels as a single pointer. Boxes still queued when both ends are
/// dropped are freed.
///
/// ```
/// use strand::spsc;
///
/// let (tx, rx) = spsc::ptr_channel::<String>();
/// tx.push_ptr(Box::new("hello".to_string()));
/// assert_eq!(rx.pop_ptr().as_deref().map(String::as_str), Some("hello"));
/// ```
#[must_use]
pub fn ptr_channel<U: Send>() -> (PtrProducer<U>, PtrConsumer<U>) {
    let queue = Arc::new(Queue::with_release(Some(release_box::<U>)));
    (
        PtrProducer {
            queue: Arc::clone(&queue),
            _owns: PhantomData,
            _unsync: PhantomData,
        },
        PtrConsumer {
            queue,
            _owns: PhantomData,
            _unsync: PhantomData,
        },
    )
}

impl<U: Send> PtrProducer<U> {
    #[inline]
    pub fn push_ptr(&self, value: Box<U>) {
        // SAFETY: single producer, see `Producer::push`.
        unsafe { self.queue.push(Box::into_raw(value) as usize) }
    }
}

impl<U: Send> PtrConsumer<U> {
    #[inline]
    #[must_use]
    pub fn pop_ptr(&self) -> Option<Box<U>> {
        // SAFETY: single consumer; the value was produced by `push_ptr`.
        unsafe { self.queue.pop().map(|raw| Box::from_raw(raw as *mut U)) }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pop_blocking_with_huge_timeout() {
        let (tx, rx) = channel::<u32>();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.push(7);
        });

        assert_eq!(rx.pop_blocking(Duration::MAX), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn test_basic_push_pop() {
        let (tx, rx) = channel::<u32>();

        assert!(rx.is_empty());
        tx.push(1);
        tx.push(2);
        assert!(!rx.is_empty());

        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_pop_blocking_timeout() {
        let (_tx, rx) = channel::<u64>();
        let start = std::time::Instant::now();

        assert_eq!(rx.pop_blocking(Duration::from_millis(10)), None);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_cross_thread_order() {
        const COUNT: u64 = 100_000;
        let (tx, rx) = channel::<u64>();

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                tx.push(i);
            }
        });

        for expected in 0..COUNT {
            assert_eq!(rx.pop_blocking(Timeout::Infinite), Some(expected));
        }
        producer.join().unwrap();
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_ptr_channel_transfers_ownership() {
        let (tx, rx) = ptr_channel::<Vec<u8>>();

        let handle = thread::spawn(move || {
            for i in 0..100u8 {
                tx.push_ptr(Box::new(vec![i; 4]));
            }
        });
        handle.join().unwrap();

        for i in 0..100u8 {
            assert_eq!(*rx.pop_ptr().unwrap(), vec![i; 4]);
        }
        assert!(rx.pop_ptr().is_none());
    }

    #[test]
    fn test_ptr_channel_frees_undelivered() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (tx, rx) = ptr_channel::<Tracked>();
        tx.push_ptr(Box::new(Tracked));
        tx.push_ptr(Box::new(Tracked));
        tx.push_ptr(Box::new(Tracked));
        drop(rx.pop_ptr());
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        drop(tx);
        drop(rx);
        assert_eq!(DROPS.load(Ordering::Relaxed), 3);
    }
}
