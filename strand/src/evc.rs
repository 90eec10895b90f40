//! Eventcount: a wait/wake primitive keyed on a monotonic counter.
//!
//! An eventcount lets a thread wait on a condition that is updated and checked
//! without a lock, without losing a wakeup that lands between the check and
//! the sleep. The usage pattern is:
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use strand::evc::{EventCount, Timeout};
//!
//! let ec = EventCount::new();
//! let ready = AtomicBool::new(false);
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         ready.store(true, Ordering::Release);
//!         ec.signal();
//!     });
//!
//!     while !ready.load(Ordering::Acquire) {
//!         let key = ec.get();
//!         if ready.load(Ordering::Acquire) {
//!             break;
//!         }
//!         ec.wait(key, Timeout::Infinite);
//!     }
//! });
//! ```
//!
//! # Ordering
//!
//! Every signal increments the key *before* looking for waiters, and every
//! waiter registers itself *before* re-reading the key. Both sides use
//! sequentially consistent operations, so either the waiter sees the new key
//! and does not park, or the signaler sees the waiter and wakes it.
//!
//! The mutex/condvar pair is only used for parking: signals skip it entirely
//! while no waiter is registered.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration. A zero duration polls.
    Duration(Duration),
}

impl Timeout {
    /// A timeout that never blocks.
    pub const POLL: Self = Self::Duration(Duration::ZERO);

    /// Absolute deadline for this timeout. `None` means no deadline, which
    /// includes durations too large to represent.
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Instant::now().checked_add(d),
        }
    }

    /// What is left of a timeout that expires at `deadline`, or `None` once
    /// it has passed.
    pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Self> {
        let Some(dl) = deadline else {
            return Some(Self::Infinite);
        };
        let now = Instant::now();
        (now < dl).then(|| Self::Duration(dl.duration_since(now)))
    }

    fn is_poll(self) -> bool {
        matches!(self, Self::Duration(d) if d.is_zero())
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Snapshot of an eventcount, obtained with [`EventCount::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Key(u64);

impl Key {
    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Monotonic-key wait/wake primitive.
pub struct EventCount {
    key: AtomicU64,
    waiters: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl EventCount {
    /// Creates an eventcount with key 0 and no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: AtomicU64::new(0),
            waiters: AtomicU32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Returns the current key.
    ///
    /// Issues a full fence, so the condition checked after this call observes
    /// every update published before a signal keyed on the returned value.
    /// The fence is not free: only call this once the fast-path check failed.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Key {
        fence(Ordering::SeqCst);
        Key(self.key.load(Ordering::SeqCst))
    }

    /// Blocks while the key still equals `key`, for at most `timeout`.
    ///
    /// Returns `true` if the key changed (before the call or while parked) and
    /// `false` if the timeout elapsed first. [`Timeout::POLL`] never parks.
    pub fn wait(&self, key: Key, timeout: impl Into<Timeout>) -> bool {
        let timeout = timeout.into();

        fence(Ordering::SeqCst);
        if self.key.load(Ordering::SeqCst) != key.0 {
            return true;
        }
        if timeout.is_poll() {
            return false;
        }
        let deadline = timeout.deadline();

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let changed = {
            let mut guard = self.lock.lock();
            loop {
                if self.key.load(Ordering::SeqCst) != key.0 {
                    break true;
                }
                match deadline {
                    None => self.cond.wait(&mut guard),
                    Some(dl) => {
                        let now = Instant::now();
                        if now >= dl {
                            break false;
                        }
                        let _ = self.cond.wait_for(&mut guard, dl.duration_since(now));
                    }
                }
            }
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        changed
    }

    /// Wakes up to `n` parked waiters.
    pub fn signal_n(&self, n: usize) {
        self.key.fetch_add(1, Ordering::SeqCst);

        if n == 0 || self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _guard = self.lock.lock();
        if n == usize::MAX {
            self.cond.notify_all();
        } else {
            for _ in 0..n {
                if !self.cond.notify_one() {
                    break;
                }
            }
        }
    }

    /// Wakes at most one waiter.
    #[inline]
    pub fn signal(&self) {
        self.signal_n(1);
    }

    /// Wakes every waiter.
    #[inline]
    pub fn broadcast(&self) {
        self.signal_n(usize::MAX);
    }

    /// Like [`signal`](Self::signal), but skipped when no waiter is seen by a
    /// relaxed peek.
    ///
    /// Racy by nature: a waiter registering concurrently may be missed. Only
    /// use it where waiters re-check their condition on a bounded schedule or
    /// a later strict signal is guaranteed.
    #[inline]
    pub fn signal_relaxed(&self) {
        if self.waiters.load(Ordering::Relaxed) != 0 {
            self.signal();
        }
    }

    /// Like [`broadcast`](Self::broadcast), with the same caveat as
    /// [`signal_relaxed`](Self::signal_relaxed).
    #[inline]
    pub fn broadcast_relaxed(&self) {
        if self.waiters.load(Ordering::Relaxed) != 0 {
            self.broadcast();
        }
    }

    /// Number of threads currently parked or about to park. Racy.
    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl Default for EventCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCount")
            .field("key", &self.key.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
