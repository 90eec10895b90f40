//! Work-stealing job runtime.
//!
//! A [`Runtime`] owns `workers` threads plus the thread that spawned it (the
//! *main context*). Every context has a bounded LIFO deque of jobs; idle
//! contexts steal from the others in FIFO order. Threads that are not contexts
//! of the runtime (foreign threads) submit through a shared injector queue.
//!
//! - Context ids: workers are `0..workers`, the main context is `workers`.
//! - A submission that finds its local deque full runs inline instead.
//! - Idle workers park on an [`EventCount`]; every submission signals it.
//! - Job panics are caught, logged and counted; the worker keeps going.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use strand::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
//! let total = AtomicUsize::new(0);
//!
//! runtime.for_each(100, |i| {
//!     total.fetch_add(i, Ordering::Relaxed);
//! });
//! assert_eq!(total.load(Ordering::Relaxed), 4950);
//!
//! runtime.shutdown();
//! ```

mod config;
pub(crate) mod context;
mod worker;

pub use config::{DEFAULT_MAX_LOCAL_JOBS, MAX_WORKERS, RuntimeConfig, RuntimeError};

use std::mem;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::CachePadded;

use crate::evc::EventCount;
use crate::job::{Job, JobRef};
use crate::queue::SerialQueue;
use crate::sync::SyncGroup;
use crate::trace::{debug, error, info, trace, warn};
use context::Context;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Attempts per victim before moving on when a steal keeps racing.
const STEAL_RETRIES: usize = 50;

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    stolen: AtomicU64,
    inlined: AtomicU64,
    panicked: AtomicU64,
    main_jobs: AtomicU64,
}

/// Snapshot of runtime activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Jobs run to completion or to a caught panic.
    pub executed: u64,
    /// Jobs taken from another context's deque.
    pub stolen: u64,
    /// Submissions that ran inline because the local deque was full.
    pub inlined: u64,
    /// Jobs that panicked.
    pub panicked: u64,
    /// Main-queue jobs run by the main context.
    pub main_jobs: u64,
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    workers: usize,
    max_local_jobs: usize,
    injector: Injector<JobRef>,
    /// Indexed by context id.
    stealers: Box<[Stealer<JobRef>]>,
    /// Idle workers park here.
    pub(crate) idle: EventCount,
    shutdown: AtomicBool,
    pub(crate) main_queue: SerialQueue,
    /// Signalled when the main queue becomes non-empty.
    pub(crate) main_events: EventCount,
    /// One slot per context, plus one shared by foreign threads.
    counters: Box<[CachePadded<Counters>]>,
}

impl Shared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drops every job still queued in the injector or a deque.
    fn discard_pending(&self) {
        fn drain(mut steal: impl FnMut() -> Steal<JobRef>) -> usize {
            let mut dropped = 0;
            loop {
                match steal() {
                    Steal::Success(job) => {
                        drop(job);
                        dropped += 1;
                    }
                    Steal::Empty => return dropped,
                    Steal::Retry => {}
                }
            }
        }

        let mut dropped = drain(|| self.injector.steal());
        for stealer in &self.stealers {
            dropped += drain(|| stealer.steal());
        }
        if dropped > 0 {
            warn!(dropped, "discarded jobs left at shutdown");
        }
    }
}

/// Cloneable handle to a running [`Runtime`].
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl Handle {
    /// This thread's context id, or `None` on a foreign thread.
    #[must_use]
    pub fn thread_id(&self) -> Option<usize> {
        context::id(self.shared.id)
    }

    /// Number of contexts: workers plus the main context.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.shared.workers + 1
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// Returns `true` on the thread that spawned the runtime.
    #[must_use]
    pub fn is_main_thread(&self) -> bool {
        self.thread_id() == Some(self.shared.workers)
    }

    /// Schedules a closure on the runtime.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(JobRef::from_fn(f));
    }

    /// Schedules a [`Job`] on the runtime.
    pub fn schedule_job(&self, job: Box<dyn Job>) {
        self.submit(JobRef::new(job));
    }

    /// Pushes `job` on this context's deque, the injector for foreign
    /// threads, or runs it inline if the deque is full.
    pub(crate) fn submit(&self, job: JobRef) {
        let overflow = context::with(self.shared.id, |ctx| match ctx {
            Some(ctx) if ctx.local.len() >= self.shared.max_local_jobs => Some(job),
            Some(ctx) => {
                ctx.local.push(job);
                None
            }
            None => {
                self.shared.injector.push(job);
                None
            }
        });

        match overflow {
            None => self.shared.idle.signal(),
            Some(job) => {
                trace!("local queue full, running job inline");
                self.counters().inlined.fetch_add(1, Ordering::Relaxed);
                self.execute(job);
            }
        }
    }

    /// Finds a runnable job: own deque first, then the injector, then the
    /// other contexts.
    pub(crate) fn find_job(&self) -> Option<JobRef> {
        let (id, job) = context::with(self.shared.id, |ctx| match ctx {
            Some(ctx) => (Some(ctx.id), ctx.local.pop()),
            None => (None, None),
        });
        job.or_else(|| self.steal(id))
    }

    fn steal(&self, id: Option<usize>) -> Option<JobRef> {
        let shared = &*self.shared;

        for _ in 0..STEAL_RETRIES {
            match shared.injector.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }

        let n = shared.stealers.len();
        let start = id.map_or(0, |id| id + 1);
        for offset in 0..n {
            let victim = (start + offset) % n;
            if Some(victim) == id {
                continue;
            }
            for _ in 0..STEAL_RETRIES {
                match shared.stealers[victim].steal() {
                    Steal::Success(job) => {
                        trace!(victim, "stole job");
                        self.counters().stolen.fetch_add(1, Ordering::Relaxed);
                        return Some(job);
                    }
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }

        None
    }

    /// Runs a job on the current thread and accounts for it.
    pub(crate) fn execute(&self, job: JobRef) {
        let ok = job.execute();
        let counters = self.counters();
        counters.executed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_main_job(&self) {
        self.counters().main_jobs.fetch_add(1, Ordering::Relaxed);
    }

    fn counters(&self) -> &Counters {
        let slot = self.thread_id().unwrap_or(self.parallelism());
        &self.shared.counters[slot]
    }

    /// Runs `f(0)` to `f(count - 1)` in parallel and returns when all calls
    /// have completed. `f` may borrow from the caller.
    ///
    /// The calling thread helps run jobs while it waits.
    pub fn for_each<F>(&self, count: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        if count == 0 {
            return;
        }

        let syn = SyncGroup::new(self);
        let f: &(dyn Fn(usize) + Sync) = &f;
        // SAFETY: every job holding `f` belongs to `syn`. `guard` waits for
        // all of them, on return and on unwind, before `f` goes out of scope.
        let f: &'static (dyn Fn(usize) + Sync) = unsafe { mem::transmute(f) };
        let guard = syn.wait_guard();

        for i in 0..count {
            syn.schedule(move |_| f(i));
        }

        drop(guard);
    }

    /// Creates a sync group tracking jobs on this runtime.
    #[must_use]
    pub fn sync_group(&self) -> SyncGroup {
        SyncGroup::new(self)
    }

    /// Sums the activity counters of every context.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.shared
            .counters
            .iter()
            .fold(Stats::default(), |mut acc, c| {
                acc.executed += c.executed.load(Ordering::Relaxed);
                acc.stolen += c.stolen.load(Ordering::Relaxed);
                acc.inlined += c.inlined.load(Ordering::Relaxed);
                acc.panicked += c.panicked.load(Ordering::Relaxed);
                acc.main_jobs += c.main_jobs.load(Ordering::Relaxed);
                acc
            })
    }
}

/// A running job scheduler. Dropping it shuts the workers down.
pub struct Runtime {
    handle: Handle,
    threads: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Starts the worker threads and makes the calling thread the main
    /// context.
    ///
    /// A thread can be the main context of a single runtime at a time; a
    /// stale context left by an earlier runtime is replaced.
    pub fn spawn(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            runtime = id,
            workers = config.workers,
            max_local_jobs = config.max_local_jobs,
            pin_workers = config.pin_workers,
            "starting runtime"
        );

        let parallelism = config.parallelism();
        let mut locals: Vec<_> = (0..parallelism).map(|_| Worker::new_lifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();

        let shared = Arc::new(Shared {
            id,
            workers: config.workers,
            max_local_jobs: config.max_local_jobs,
            injector: Injector::new(),
            stealers,
            idle: EventCount::new(),
            shutdown: AtomicBool::new(false),
            main_queue: SerialQueue::main(),
            main_events: EventCount::new(),
            counters: (0..=parallelism).map(|_| CachePadded::default()).collect(),
        });
        let handle = Handle { shared };

        if let Some(main) = locals.pop()
            && let Some(stale) = context::install(Context {
                runtime: id,
                id: config.workers,
                local: main,
            })
        {
            warn!(stale_runtime = stale.runtime, "replacing stale thread context");
        }

        let cores = if config.pin_workers {
            core_affinity::get_core_ids().filter(|cores| !cores.is_empty())
        } else {
            None
        };

        let mut runtime = Self {
            handle,
            threads: Vec::with_capacity(config.workers),
        };

        for (worker_id, local) in locals.into_iter().enumerate() {
            let core = cores.as_ref().map(|cores| cores[worker_id % cores.len()]);
            let mut builder = thread::Builder::new().name(format!("{}-{worker_id}", config.thread_name));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            debug!(worker = worker_id, "spawning worker thread");
            let handle = runtime.handle.clone();
            match builder.spawn(move || worker::run(handle, worker_id, local, core)) {
                Ok(thread) => runtime.threads.push(thread),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "failed to spawn worker");
                    // Dropping `runtime` joins the workers started so far.
                    return Err(RuntimeError::Spawn(e));
                }
            }
        }

        info!(runtime = id, "runtime started");
        Ok(runtime)
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops the workers and joins them.
    ///
    /// Jobs still queued are dropped without running; sync groups count them
    /// as done.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let shared = &self.handle.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(runtime = shared.id, "runtime shutdown initiated");

        shared.idle.broadcast();
        for thread in self.threads.drain(..) {
            debug!("waiting for worker thread to exit");
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }

        shared.discard_pending();
        if self.handle.is_main_thread() {
            drop(context::uninstall(shared.id));
        }

        info!(runtime = shared.id, "runtime shutdown complete");
    }
}

impl Deref for Runtime {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
