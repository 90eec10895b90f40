//! Per-thread data scoped to a sync group.
//!
//! Each context keeps at most one cached instance, created lazily on first
//! [`acquire`](ThreadData::acquire). Jobs of a group accumulate into their
//! thread's instance without synchronization, and once the group is idle
//! [`collect`](ThreadData::collect) folds all instances together.
//!
//! Foreign threads draw from a shared pool of spare instances instead of a
//! per-context slot.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::SyncState;
use crate::stack::TakeStack;
use crate::trace::debug;

struct Slot<T> {
    in_use: AtomicBool,
    value: UnsafeCell<T>,
}

impl<T> Slot<T> {
    fn claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

struct TdInner<T> {
    group: Arc<SyncState>,
    new_td: Box<dyn Fn() -> T + Send + Sync>,
    delete_td: Box<dyn Fn(T) + Send + Sync>,
    /// Cached instance per context id; null while acquired or not yet created.
    cached: Box<[CachePadded<AtomicPtr<Slot<T>>>]>,
    /// Released instances without a context slot.
    spare: Mutex<Vec<NonNull<Slot<T>>>>,
    /// Every instance ever created. Only freed on drop.
    all: TakeStack<Slot<T>>,
}

// SAFETY: an instance is only touched by the thread holding its claim
// (`in_use`), and ownership moves between threads through atomics or the
// spare pool's mutex.
unsafe impl<T: Send> Send for TdInner<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for TdInner<T> {}

impl<T> Drop for TdInner<T> {
    fn drop(&mut self) {
        let mut deleted = 0usize;
        for slot in self.all.take_all() {
            (self.delete_td)(slot.value.into_inner());
            deleted += 1;
        }
        debug!(instances = deleted, "thread data deleted");
        let _ = deleted;
    }
}

/// Per-thread instances of `T`, created by [`SyncGroup::declare_td`].
///
/// [`SyncGroup::declare_td`]: super::SyncGroup::declare_td
pub struct ThreadData<T: Send + 'static> {
    inner: Arc<TdInner<T>>,
}

impl<T: Send + 'static> Clone for ThreadData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> ThreadData<T> {
    pub(super) fn new(
        group: Arc<SyncState>,
        new_td: Box<dyn Fn() -> T + Send + Sync>,
        delete_td: Box<dyn Fn(T) + Send + Sync>,
    ) -> Self {
        let contexts = group.handle.parallelism();
        Self {
            inner: Arc::new(TdInner {
                group,
                new_td,
                delete_td,
                cached: (0..contexts)
                    .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
                    .collect(),
                spare: Mutex::new(Vec::new()),
                all: TakeStack::new(),
            }),
        }
    }

    /// Borrows this thread's instance, creating it on first use.
    ///
    /// Acquiring again on the same thread before the guard drops yields a
    /// second instance.
    pub fn acquire(&self) -> TdGuard<'_, T> {
        let inner = &*self.inner;
        let ctx = inner.group.handle.thread_id();

        let cached = match ctx {
            Some(id) => NonNull::new(inner.cached[id].swap(ptr::null_mut(), Ordering::Acquire)),
            None => inner.spare.lock().pop(),
        };
        let slot = cached.unwrap_or_else(|| {
            inner.all.push(Slot {
                in_use: AtomicBool::new(false),
                value: UnsafeCell::new((inner.new_td)()),
            })
        });

        // SAFETY: slots live until `TdInner` drops, which `&self` prevents.
        let claimed = unsafe { slot.as_ref() }.claim();
        assert!(claimed, "thread data instance is already in use");

        TdGuard {
            td: self,
            slot,
            ctx,
        }
    }

    /// Visits every instance created so far.
    ///
    /// Call once the group's jobs are done.
    ///
    /// # Panics
    ///
    /// Panics if an instance is acquired while collecting.
    pub fn collect(&self, mut f: impl FnMut(&mut T)) {
        debug_assert_eq!(
            self.inner.group.pending(),
            0,
            "thread data collected while jobs are pending"
        );

        // SAFETY: `all` is only detached when `TdInner` drops.
        for slot in unsafe { self.inner.all.iter() } {
            assert!(slot.claim(), "thread data instance in use during collect");
            // SAFETY: the claim above gives exclusive access.
            f(unsafe { &mut *slot.value.get() });
            slot.release();
        }
    }
}

/// Exclusive access to one thread's instance. Returns it on drop.
pub struct TdGuard<'a, T: Send + 'static> {
    td: &'a ThreadData<T>,
    slot: NonNull<Slot<T>>,
    ctx: Option<usize>,
}

impl<T: Send + 'static> Deref for TdGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the instance's claim.
        unsafe { &*self.slot.as_ref().value.get() }
    }
}

impl<T: Send + 'static> DerefMut for TdGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the instance's claim.
        unsafe { &mut *self.slot.as_ref().value.get() }
    }
}

impl<T: Send + 'static> Drop for TdGuard<'_, T> {
    fn drop(&mut self) {
        let inner = &*self.td.inner;
        // SAFETY: the slot outlives the guard.
        unsafe { self.slot.as_ref() }.release();

        let displaced = match self.ctx {
            Some(id) => NonNull::new(inner.cached[id].swap(self.slot.as_ptr(), Ordering::Release)),
            None => Some(self.slot),
        };
        if let Some(slot) = displaced {
            inner.spare.lock().push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn runtime(workers: usize) -> Runtime {
        Runtime::spawn(RuntimeConfig {
            workers,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_instance_is_reused_per_context() {
        let rt = runtime(1);
        let syn = rt.sync_group();
        let created = Arc::new(AtomicUsize::new(0));
        let td = {
            let created = Arc::clone(&created);
            syn.declare_td(
                move || {
                    created.fetch_add(1, Ordering::Relaxed);
                    0u32
                },
                |_| {},
            )
        };

        for _ in 0..10 {
            *td.acquire() += 1;
        }

        assert_eq!(created.load(Ordering::Relaxed), 1);
        let mut total = 0;
        td.collect(|v| total += *v);
        assert_eq!(total, 10);
    }

    #[test]
    fn test_foreign_threads_share_spares() {
        let rt = runtime(1);
        let syn = rt.sync_group();
        let td = syn.declare_td(|| 0u64, |_| {});

        for _ in 0..4 {
            let td = td.clone();
            thread::spawn(move || *td.acquire() += 1).join().unwrap();
        }

        let mut instances = 0;
        let mut total = 0;
        td.collect(|v| {
            instances += 1;
            total += *v;
        });
        assert_eq!(instances, 1);
        assert_eq!(total, 4);
    }

    #[test]
    fn test_delete_runs_for_every_instance() {
        let rt = runtime(2);
        let syn = rt.sync_group();
        let deleted = Arc::new(AtomicUsize::new(0));
        let td = {
            let deleted = Arc::clone(&deleted);
            syn.declare_td(
                || 1usize,
                move |v| {
                    deleted.fetch_add(v, Ordering::Relaxed);
                },
            )
        };

        {
            let td = td.clone();
            rt.for_each(100, move |_| {
                let _guard = td.acquire();
            });
        }

        let mut instances = 0;
        td.collect(|_| instances += 1);
        assert!(instances >= 1 && instances <= rt.parallelism());

        drop(td);
        assert_eq!(deleted.load(Ordering::Relaxed), instances);
    }
}
