//! Sync groups: fork/join tracking for scheduled jobs.
//!
//! A [`SyncGroup`] counts the jobs scheduled through it. Waiting on a group
//! blocks until every one of them has completed, and a waiting context keeps
//! running other jobs meanwhile, so nested fork/join does not starve the
//! runtime. Completion notifications and per-thread scratch data
//! ([`ThreadData`]) hang off the same group.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use strand::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
//! let syn = runtime.sync_group();
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..16 {
//!     let hits = Arc::clone(&hits);
//!     syn.schedule(move |_| {
//!         hits.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//! syn.wait();
//! assert_eq!(hits.load(Ordering::Relaxed), 16);
//! ```
//!
//! # Lifetime
//!
//! The group returned by [`SyncGroup::new`] is the *owner*. Clones (including
//! the ones held by in-flight jobs) are plain references. Dropping the owner
//! waits for outstanding jobs and then spins until every clone is gone, so
//! clones must not be parked somewhere long-lived.

mod thread_data;

pub use thread_data::{TdGuard, ThreadData};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

use crate::evc::{EventCount, Timeout};
use crate::job::{Job, JobRef};
use crate::queue::SerialQueue;
use crate::runtime::Handle;
use crate::stack::TakeStack;
use crate::trace::trace;

/// Upper bound on a waiter's park before it looks for runnable jobs again.
///
/// Submissions only wake idle workers. A waiter parked on its group would not
/// see a job injected by a foreign thread while every context is waiting.
const HELP_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct Notify {
    queue: Option<SerialQueue>,
    job: JobRef,
}

pub(crate) struct SyncState {
    pending: CachePadded<AtomicU32>,
    refcnt: AtomicU32,
    events: EventCount,
    notify: TakeStack<Notify>,
    pub(crate) handle: Handle,
}

impl SyncState {
    pub(crate) fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    fn job_done(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "sync group job completed twice");

        if prev == 1 {
            self.events.broadcast();
            self.fire_notify();
        } else {
            // Lets `wait_until` re-check its condition.
            self.events.broadcast_relaxed();
        }
    }

    fn fire_notify(&self) {
        if self.notify.is_empty() {
            return;
        }
        for Notify { queue, job } in self.notify.take_all() {
            trace!("firing sync group notification");
            self.handle.queue_ref(queue.as_ref(), job);
        }
    }
}

/// Tracks a set of jobs. See the module documentation.
pub struct SyncGroup {
    state: Arc<SyncState>,
    owner: bool,
}

impl SyncGroup {
    /// Creates a group with no pending jobs. The returned value is the owner.
    #[must_use]
    pub fn new(handle: &Handle) -> Self {
        Self {
            state: Arc::new(SyncState {
                pending: CachePadded::new(AtomicU32::new(0)),
                refcnt: AtomicU32::new(1),
                events: EventCount::new(),
                notify: TakeStack::new(),
                handle: handle.clone(),
            }),
            owner: true,
        }
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.state.handle
    }

    /// Jobs scheduled but not yet completed.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.state.pending()
    }

    /// Registers one job with the group. The job counts as done when the
    /// returned token is dropped.
    ///
    /// Useful for work tracked by the group but not run by the scheduler.
    #[must_use]
    pub fn job_prepare(&self) -> PendingJob {
        let group = self.clone();
        group.state.pending.fetch_add(1, Ordering::SeqCst);
        PendingJob { group }
    }

    /// Schedules `f` as a job of this group.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce(&SyncGroup) + Send + 'static,
    {
        let pending = self.job_prepare();
        self.state.handle.submit(JobRef::grouped_fn(f, pending));
    }

    /// Schedules a [`Job`] as part of this group.
    pub fn schedule_job(&self, job: Box<dyn Job>) {
        let pending = self.job_prepare();
        self.state.handle.submit(JobRef::grouped(job, pending));
    }

    /// Queues `f` on `q` as a job of this group.
    pub fn queue<F>(&self, q: Option<&SerialQueue>, f: F)
    where
        F: FnOnce(&SyncGroup) + Send + 'static,
    {
        let pending = self.job_prepare();
        self.state.handle.queue_ref(q, JobRef::grouped_fn(f, pending));
    }

    /// Queues a [`Job`] on `q` as part of this group.
    pub fn queue_job(&self, q: Option<&SerialQueue>, job: Box<dyn Job>) {
        let pending = self.job_prepare();
        self.state.handle.queue_ref(q, JobRef::grouped(job, pending));
    }

    /// Blocks until every job of the group has completed, running other jobs
    /// in the meantime.
    pub fn wait(&self) {
        self.wait_while(|| self.state.pending() == 0);
    }

    /// Like [`wait`](Self::wait), but returns as soon as `cond` holds.
    ///
    /// `cond` is re-evaluated whenever one of the group's jobs completes.
    pub fn wait_until(&self, mut cond: impl FnMut() -> bool) {
        self.wait_while(&mut cond);
    }

    fn wait_while(&self, mut done: impl FnMut() -> bool) {
        if done() {
            return;
        }

        let _waiter = self.clone();
        let state = &*self.state;
        let handle = &state.handle;

        loop {
            if let Some(job) = handle.find_job() {
                handle.execute(job);
                if done() {
                    return;
                }
                continue;
            }

            let key = state.events.get();
            if done() {
                return;
            }
            state.events.wait(key, HELP_POLL_INTERVAL);
            if done() {
                return;
            }
        }
    }

    /// Blocks without helping until the group is idle or `timeout` elapses.
    /// Returns `true` if the group is idle.
    pub fn wait_timeout(&self, timeout: impl Into<Timeout>) -> bool {
        let deadline = timeout.into().deadline();
        let state = &*self.state;

        loop {
            if state.pending() == 0 {
                return true;
            }
            let key = state.events.get();
            if state.pending() == 0 {
                return true;
            }
            // Intermediate job completions also bump the key.
            let Some(left) = Timeout::remaining(deadline) else {
                return false;
            };
            state.events.wait(key, left);
        }
    }

    /// Queues `f` on `q` once the group has no pending jobs.
    ///
    /// Fires immediately if the group is already idle. Each notification
    /// fires exactly once.
    pub fn notify<F>(&self, q: Option<&SerialQueue>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.notify.push(Notify {
            queue: q.cloned(),
            job: JobRef::from_fn(f),
        });
        if self.state.pending.load(Ordering::SeqCst) == 0 {
            self.state.fire_notify();
        }
    }

    /// Declares per-thread data scoped to this group.
    ///
    /// `new_td` creates an instance the first time a thread needs one;
    /// `delete_td` receives every instance when the last [`ThreadData`] handle
    /// is dropped.
    pub fn declare_td<T, N, D>(&self, new_td: N, delete_td: D) -> ThreadData<T>
    where
        T: Send + 'static,
        N: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        ThreadData::new(Arc::clone(&self.state), Box::new(new_td), Box::new(delete_td))
    }

    /// Waits for the group when dropped, also during unwinding.
    pub(crate) fn wait_guard(&self) -> WaitGuard<'_> {
        WaitGuard(self)
    }
}

impl Clone for SyncGroup {
    fn clone(&self) -> Self {
        let prev = self.state.refcnt.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "sync group retained after teardown");
        Self {
            state: Arc::clone(&self.state),
            owner: false,
        }
    }
}

impl Drop for SyncGroup {
    fn drop(&mut self) {
        let state = &*self.state;
        if !self.owner {
            let prev = state.refcnt.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 1, "sync group released after teardown");
            return;
        }

        if state.pending() != 0 {
            debug_assert!(thread::panicking(), "sync group dropped with jobs in flight");
            self.wait();
        }

        let backoff = Backoff::new();
        while state.refcnt.load(Ordering::Acquire) != 1 {
            backoff.snooze();
        }
        state.refcnt.store(0, Ordering::Release);
    }
}

/// Completion token for one job of a [`SyncGroup`].
pub struct PendingJob {
    group: SyncGroup,
}

impl PendingJob {
    #[must_use]
    pub fn group(&self) -> &SyncGroup {
        &self.group
    }

    /// Marks the job as done. Same as dropping the token.
    pub fn done(self) {}
}

impl Drop for PendingJob {
    fn drop(&mut self) {
        self.group.state.job_done();
    }
}

pub(crate) struct WaitGuard<'a>(&'a SyncGroup);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::sync::atomic::AtomicUsize;

    fn runtime(workers: usize) -> Runtime {
        Runtime::spawn(RuntimeConfig {
            workers,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_wait_for_all_jobs() {
        let rt = runtime(3);
        let syn = rt.sync_group();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..500 {
            let hits = Arc::clone(&hits);
            syn.schedule(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        syn.wait();

        assert_eq!(syn.pending(), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn test_nested_fork_join() {
        let rt = runtime(2);
        let syn = rt.sync_group();
        let leaves = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let leaves = Arc::clone(&leaves);
            syn.schedule(move |outer| {
                let inner = SyncGroup::new(outer.handle());
                for _ in 0..8 {
                    let leaves = Arc::clone(&leaves);
                    inner.schedule(move |_| {
                        leaves.fetch_add(1, Ordering::Relaxed);
                    });
                }
                inner.wait();
            });
        }
        syn.wait();

        assert_eq!(leaves.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_jobs_can_extend_their_group() {
        let rt = runtime(2);
        let syn = rt.sync_group();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = Arc::clone(&hits);
            syn.schedule(move |syn| {
                for _ in 0..10 {
                    let hits = Arc::clone(&hits);
                    syn.schedule(move |_| {
                        hits.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
        syn.wait();

        assert_eq!(hits.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_notify_racing_last_job_fires_once() {
        const ROUNDS: usize = 200;
        let rt = runtime(2);
        let fired = Arc::new(AtomicUsize::new(0));

        for round in 1..=ROUNDS {
            let syn = rt.sync_group();
            syn.schedule(|_| {});
            {
                let fired = Arc::clone(&fired);
                syn.notify(None, move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                });
            }
            syn.wait();

            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
            while fired.load(Ordering::SeqCst) < round {
                assert!(std::time::Instant::now() < deadline, "notification lost in round {round}");
                if let Some(job) = rt.find_job() {
                    rt.execute(job);
                } else {
                    std::thread::yield_now();
                }
            }
            assert_eq!(fired.load(Ordering::SeqCst), round);
        }
    }

    #[test]
    fn test_notify_fires_once_after_completion() {
        let rt = runtime(2);
        let syn = rt.sync_group();
        let done = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        let token = syn.job_prepare();
        {
            let done = Arc::clone(&done);
            let fired = Arc::clone(&fired);
            syn.notify(None, move || {
                assert_eq!(done.load(Ordering::SeqCst), 1);
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        done.store(1, Ordering::SeqCst);
        token.done();
        syn.wait();

        let other = rt.sync_group();
        other.wait_until(|| fired.load(Ordering::SeqCst) == 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notify_on_idle_group_fires_immediately() {
        let rt = runtime(1);
        let q = rt.queue_create();
        let syn = rt.sync_group();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = Arc::clone(&fired);
            syn.notify(Some(&q), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        rt.queue_sync(Some(&q), || {});

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_until_sees_progress() {
        let rt = runtime(2);
        let syn = rt.sync_group();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let hits = Arc::clone(&hits);
            syn.schedule(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        syn.wait_until(|| hits.load(Ordering::SeqCst) >= 5);
        assert!(hits.load(Ordering::SeqCst) >= 5);
        syn.wait();
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let rt = runtime(1);
        let syn = rt.sync_group();
        syn.schedule(|_| panic!("job failure"));
        syn.wait();
        assert_eq!(syn.pending(), 0);
    }

    #[test]
    fn test_wait_timeout_on_manual_job() {
        let rt = runtime(1);
        let syn = rt.sync_group();
        let token = syn.job_prepare();

        assert!(!syn.wait_timeout(Duration::from_millis(10)));
        drop(token);
        assert!(syn.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_timeout_across_partial_completion() {
        let rt = runtime(1);
        let syn = rt.sync_group();
        let first = syn.job_prepare();
        let second = syn.job_prepare();

        let finisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(first);
            std::thread::sleep(Duration::from_millis(40));
            drop(second);
        });

        assert!(syn.wait_timeout(Duration::MAX));
        assert_eq!(syn.pending(), 0);
        finisher.join().unwrap();
    }
}
