//! Per-thread scheduler context.
//!
//! A thread is a context of at most one runtime at a time: each worker
//! installs one at start-up, and the thread calling `Runtime::spawn` installs
//! the main context. The `RefCell` is only borrowed for queue operations,
//! never while a job runs, so jobs may freely schedule more jobs.

use std::cell::{Cell, RefCell};
use std::ptr;

use crossbeam_deque::Worker;

use crate::job::JobRef;
use crate::queue::QueueInner;

pub(crate) struct Context {
    pub(crate) runtime: u64,
    pub(crate) id: usize,
    pub(crate) local: Worker<JobRef>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
    static CURRENT_QUEUE: Cell<*const QueueInner> = const { Cell::new(ptr::null()) };
}

/// Installs `ctx` on this thread, returning the one it replaces.
pub(crate) fn install(ctx: Context) -> Option<Context> {
    CONTEXT.with_borrow_mut(|slot| slot.replace(ctx))
}

/// Removes this thread's context if it belongs to `runtime`.
pub(crate) fn uninstall(runtime: u64) -> Option<Context> {
    CONTEXT.with_borrow_mut(|slot| {
        if slot.as_ref().is_some_and(|ctx| ctx.runtime == runtime) {
            slot.take()
        } else {
            None
        }
    })
}

/// Runs `f` with this thread's context for `runtime`, or `None` if the thread
/// is foreign to it.
pub(crate) fn with<R>(runtime: u64, f: impl FnOnce(Option<&Context>) -> R) -> R {
    CONTEXT.with_borrow(|slot| f(slot.as_ref().filter(|ctx| ctx.runtime == runtime)))
}

/// Context id of this thread in `runtime`.
pub(crate) fn id(runtime: u64) -> Option<usize> {
    with(runtime, |ctx| ctx.map(|ctx| ctx.id))
}

/// Serial queue whose job is running on this thread, if any.
pub(crate) fn current_queue() -> *const QueueInner {
    CURRENT_QUEUE.get()
}

/// Marks `queue` as running on this thread until the guard drops.
pub(crate) fn enter_queue(queue: *const QueueInner) -> QueueScope {
    QueueScope {
        prev: CURRENT_QUEUE.replace(queue),
    }
}

pub(crate) struct QueueScope {
    prev: *const QueueInner,
}

impl Drop for QueueScope {
    fn drop(&mut self) {
        CURRENT_QUEUE.set(self.prev);
    }
}
