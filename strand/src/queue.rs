//! Serial queues.
//!
//! A [`SerialQueue`] runs its jobs one at a time, in submission order, on
//! whichever context picks up its drain job. The queue is an intrusive
//! [`MpscQueue`]: the push that finds it empty schedules a single drain job,
//! and that drain keeps running until it closes the queue again. Pushes that
//! land while a drain is running join that drain.
//!
//! The *main queue* is never drained by workers. Its jobs run on the main
//! context when it calls [`Handle::drain_main`] or
//! [`Handle::drain_main_timeout`].

use std::cell::Cell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::evc::Timeout;
use crate::job::{Job, JobRef};
use crate::mpsc::{Linked, Links, MpscQueue};
use crate::runtime::Handle;
use crate::runtime::context;
use crate::sync::SyncGroup;
use crate::trace::{debug, trace};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[repr(C)]
struct QueuedJob {
    links: Links,
    job: Cell<Option<JobRef>>,
}

// SAFETY: `links` is the first field of a `#[repr(C)]` struct.
unsafe impl Linked for QueuedJob {
    fn links(&self) -> &Links {
        &self.links
    }

    unsafe fn from_links(links: NonNull<Links>) -> NonNull<Self> {
        links.cast()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Main,
    Serial,
}

/// Asserts that at most one thread is inside a begin/end section.
struct ExclusiveCheck {
    lock: AtomicBool,
    tag: u64,
}

impl ExclusiveCheck {
    fn new(tag: u64) -> Self {
        Self {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    fn begin(&self) {
        let res = self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "serial queue {} ran two jobs at once", self.tag);
    }

    fn end(&self) {
        let res = self
            .lock
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "serial queue {} exclusive check failed (end)", self.tag);
    }
}

pub(crate) struct QueueInner {
    id: u64,
    kind: QueueKind,
    jobs: MpscQueue<QueuedJob>,
    running: ExclusiveCheck,
}

/// Handle to a serial queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

impl SerialQueue {
    fn with_kind(kind: QueueKind) -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(QueueInner {
                id,
                kind,
                jobs: MpscQueue::new(),
                running: ExclusiveCheck::new(id),
            }),
        }
    }

    pub(crate) fn main() -> Self {
        Self::with_kind(QueueKind::Main)
    }

    #[must_use]
    pub fn is_main(&self) -> bool {
        self.inner.kind == QueueKind::Main
    }

    /// Returns `true` when called from a job running on this queue.
    #[must_use]
    pub fn is_current(&self) -> bool {
        ptr::eq(context::current_queue(), Arc::as_ptr(&self.inner))
    }

    /// Pushes a job; returns `true` if the queue was idle.
    fn push(&self, job: JobRef) -> bool {
        self.inner.jobs.push(Box::new(QueuedJob {
            links: Links::new(),
            job: Cell::new(Some(job)),
        }))
    }

    /// Runs jobs until the queue is closed again.
    fn drain(&self, handle: &Handle) {
        let inner = &*self.inner;
        let _scope = context::enter_queue(Arc::as_ptr(&self.inner));

        // SAFETY: this drain was scheduled by the push that found the queue
        // idle, and no other drain is scheduled until this one closes it.
        let ran = unsafe {
            inner.jobs.drain_with(|node| {
                if let Some(job) = node.job.take() {
                    inner.running.begin();
                    handle.execute(job);
                    inner.running.end();
                }
            })
        };
        trace!(queue = inner.id, jobs = ran, "serial queue drained");
        let _ = ran;
    }
}

impl PartialEq for SerialQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SerialQueue {}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl Handle {
    /// Creates a new serial queue.
    #[must_use]
    pub fn queue_create(&self) -> SerialQueue {
        let q = SerialQueue::with_kind(QueueKind::Serial);
        debug!(queue = q.inner.id, "serial queue created");
        q
    }

    /// Releases `q`, optionally waiting for the jobs already queued on it.
    ///
    /// # Panics
    ///
    /// Panics if `q` is the main queue.
    pub fn queue_destroy(&self, q: SerialQueue, wait: bool) {
        assert!(!q.is_main(), "the main queue cannot be destroyed");
        if wait {
            self.queue_sync(Some(&q), || {});
        }
        debug!(queue = q.inner.id, "serial queue destroyed");
    }

    /// The queue whose jobs run on the main context.
    #[must_use]
    pub fn main_queue(&self) -> &SerialQueue {
        &self.shared.main_queue
    }

    /// Returns `true` when called from a job running on `q`.
    #[must_use]
    pub fn is_on_queue(&self, q: &SerialQueue) -> bool {
        q.is_current()
    }

    /// Queues a closure on `q`, or schedules it normally when `q` is `None`.
    pub fn queue<F>(&self, q: Option<&SerialQueue>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_ref(q, JobRef::from_fn(f));
    }

    /// Queues a [`Job`] on `q`, or schedules it normally when `q` is `None`.
    pub fn queue_job(&self, q: Option<&SerialQueue>, job: Box<dyn Job>) {
        self.queue_ref(q, JobRef::new(job));
    }

    pub(crate) fn queue_ref(&self, q: Option<&SerialQueue>, job: JobRef) {
        let Some(q) = q else {
            self.submit(job);
            return;
        };

        if !q.push(job) {
            return;
        }
        match q.inner.kind {
            QueueKind::Main => self.shared.main_events.signal(),
            QueueKind::Serial => {
                let queue = q.clone();
                let handle = self.clone();
                self.submit(JobRef::from_fn(move || queue.drain(&handle)));
            }
        }
    }

    /// Runs `f` on `q` and returns once it has run. `f` may borrow from the
    /// caller.
    ///
    /// Runs inline when already on `q`, when `q` is the main queue and this
    /// is the main context, or when `q` is `None`. Otherwise the calling
    /// thread helps run jobs while it waits.
    pub fn queue_sync<F>(&self, q: Option<&SerialQueue>, f: F)
    where
        F: FnOnce() + Send,
    {
        let Some(q) = q else {
            f();
            return;
        };
        if q.is_current() || (q.is_main() && self.is_main_thread()) {
            f();
            return;
        }

        let syn = SyncGroup::new(self);
        let f: Box<dyn FnOnce() + Send + '_> = Box::new(f);
        // SAFETY: the job owning `f` belongs to `syn`, and `guard` waits for
        // it, on return and on unwind, before the borrows in `f` end.
        let f: Box<dyn FnOnce() + Send + 'static> = unsafe { mem::transmute(f) };
        let guard = syn.wait_guard();

        syn.queue(Some(q), move |_| f());

        drop(guard);
    }

    /// Runs one job from the main queue. Returns `false` if it was empty.
    ///
    /// Nested calls from a main-queue job are allowed.
    ///
    /// # Panics
    ///
    /// Panics when not called from the main context.
    pub fn drain_main(&self) -> bool {
        assert!(
            self.is_main_thread(),
            "the main queue can only be drained from the main context"
        );
        let main = &self.shared.main_queue;

        // SAFETY: only the main context consumes the main queue, and `pop`
        // tolerates nested calls from the same thread.
        let Some(node) = (unsafe { main.inner.jobs.pop(true) }) else {
            return false;
        };
        if let Some(job) = node.job.take() {
            let _scope = context::enter_queue(Arc::as_ptr(&main.inner));
            self.execute(job);
            self.count_main_job();
        }
        true
    }

    /// Like [`drain_main`](Self::drain_main), but blocks up to `timeout` for a
    /// job to arrive.
    pub fn drain_main_timeout(&self, timeout: impl Into<Timeout>) -> bool {
        let deadline = timeout.into().deadline();
        let events = &self.shared.main_events;

        loop {
            if self.drain_main() {
                return true;
            }
            let key = events.get();
            if self.drain_main() {
                return true;
            }
            // A wakeup may come from a push another drain already consumed;
            // keep waiting for an actual job until the deadline.
            let Some(left) = Timeout::remaining(deadline) else {
                return false;
            };
            events.wait(key, left);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn runtime(workers: usize) -> Runtime {
        Runtime::spawn(RuntimeConfig {
            workers,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_jobs_run_in_order() {
        let rt = runtime(3);
        let q = rt.queue_create();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..200 {
            let order = Arc::clone(&order);
            rt.queue(Some(&q), move || order.lock().push(i));
        }
        rt.queue_sync(Some(&q), || {});

        assert_eq!(*order.lock(), (0..200).collect::<Vec<_>>());
        rt.queue_destroy(q, true);
    }

    #[test]
    fn test_is_on_queue() {
        let rt = runtime(2);
        let q = rt.queue_create();
        let other = rt.queue_create();
        assert!(!rt.is_on_queue(&q));

        let seen = AtomicUsize::new(0);
        rt.queue_sync(Some(&q), || {
            assert!(rt.is_on_queue(&q));
            assert!(!rt.is_on_queue(&other));
            // Re-entrant sync on the same queue runs inline.
            rt.queue_sync(Some(&q), || {
                seen.fetch_add(1, Ordering::Relaxed);
            });
            seen.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert!(!rt.is_on_queue(&q));
    }

    #[test]
    fn test_none_queue_schedules_normally() {
        let rt = runtime(1);
        let hits = AtomicUsize::new(0);

        rt.queue_sync(None, || {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_main_queue_runs_on_main_context() {
        let rt = runtime(2);
        let main_id = rt.thread_id();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));

        let handle = rt.handle().clone();
        let producer = {
            let ran_on = Arc::clone(&ran_on);
            thread::spawn(move || {
                let inner = handle.clone();
                handle.queue(Some(handle.main_queue()), move || {
                    *ran_on.lock() = Some(inner.thread_id());
                });
            })
        };
        producer.join().unwrap();

        assert!(rt.drain_main_timeout(Duration::from_secs(10)));
        assert_eq!(*ran_on.lock(), Some(main_id));
        assert!(!rt.drain_main());
        assert_eq!(rt.stats().main_jobs, 1);
    }

    #[test]
    fn test_drain_main_timeout_expires() {
        let rt = runtime(1);
        let start = std::time::Instant::now();

        assert!(!rt.drain_main_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!rt.drain_main_timeout(Timeout::POLL));
    }

    #[test]
    fn test_drain_main_timeout_outlives_empty_wakeup() {
        let rt = runtime(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let sender = {
            let handle = rt.handle().clone();
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                handle.shared.main_events.signal();
                thread::sleep(Duration::from_millis(60));
                handle.queue(Some(handle.main_queue()), move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                });
            })
        };

        assert!(rt.drain_main_timeout(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        sender.join().unwrap();
    }

    #[test]
    fn test_drain_main_timeout_accepts_huge_duration() {
        let rt = runtime(1);
        let sender = {
            let handle = rt.handle().clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                handle.queue(Some(handle.main_queue()), || {});
            })
        };

        assert!(rt.drain_main_timeout(Duration::MAX));
        sender.join().unwrap();
    }

    #[test]
    fn test_main_queue_sync_inline_on_main() {
        let rt = runtime(1);
        let mut value = 0;
        rt.queue_sync(Some(rt.main_queue()), || value += 1);
        assert_eq!(value, 1);
    }

    #[test]
    #[should_panic(expected = "main context")]
    fn test_drain_main_off_main_context_panics() {
        let rt = runtime(1);
        let handle = rt.handle().clone();
        let res = thread::spawn(move || handle.drain_main()).join();
        if let Err(payload) = res {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    #[should_panic(expected = "cannot be destroyed")]
    fn test_main_queue_cannot_be_destroyed() {
        let rt = runtime(1);
        rt.queue_destroy(rt.main_queue().clone(), false);
    }
}
