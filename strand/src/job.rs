//! Units of work.
//!
//! Anything implementing [`Job`] can be scheduled; closures are wrapped
//! internally. Internally every job travels as a [`JobRef`] (one box), and
//! jobs belonging to a [`SyncGroup`] carry a [`PendingJob`] that reports
//! completion when it is dropped, whether the job ran, panicked or was
//! discarded at shutdown.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::sync::{PendingJob, SyncGroup};
use crate::trace::error;

/// A unit of work.
///
/// `syn` is the group the job was scheduled through, if any.
pub trait Job: Send + 'static {
    fn run(self: Box<Self>, syn: Option<&SyncGroup>);
}

struct FnJob<F>(F);

impl<F> Job for FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>, _syn: Option<&SyncGroup>) {
        (self.0)();
    }
}

/// Closure job that receives its group.
struct GroupFnJob<F>(F);

impl<F> Job for GroupFnJob<F>
where
    F: FnOnce(&SyncGroup) + Send + 'static,
{
    fn run(self: Box<Self>, syn: Option<&SyncGroup>) {
        debug_assert!(syn.is_some(), "group job scheduled without its group");
        if let Some(syn) = syn {
            (self.0)(syn);
        }
    }
}

/// A job tracked by a sync group.
struct Grouped {
    job: Box<dyn Job>,
    pending: PendingJob,
}

impl Job for Grouped {
    fn run(self: Box<Self>, _syn: Option<&SyncGroup>) {
        let Self { job, pending } = *self;
        job.run(Some(pending.group()));
        // `pending` drops here and marks the job done.
    }
}

/// Type-erased job as it sits in the scheduler's queues.
pub(crate) struct JobRef(Box<dyn Job>);

impl JobRef {
    pub(crate) fn new(job: Box<dyn Job>) -> Self {
        Self(job)
    }

    pub(crate) fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(FnJob(f)))
    }

    /// Wraps `job` so that it completes `pending` after running.
    pub(crate) fn grouped(job: Box<dyn Job>, pending: PendingJob) -> Self {
        Self(Box::new(Grouped { job, pending }))
    }

    pub(crate) fn grouped_fn<F>(f: F, pending: PendingJob) -> Self
    where
        F: FnOnce(&SyncGroup) + Send + 'static,
    {
        Self::grouped(Box::new(GroupFnJob(f)), pending)
    }

    /// Runs the job, containing any panic it raises.
    ///
    /// Returns `false` if the job panicked. A panicking group job still counts
    /// as done.
    pub(crate) fn execute(self) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(move || self.0.run(None))) {
            Ok(()) => true,
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(panic = message, "job panicked");
                let _ = message;
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_job_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let job = {
            let hits = Arc::clone(&hits);
            JobRef::from_fn(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        };

        assert!(job.execute());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panic_is_contained() {
        let job = JobRef::from_fn(|| panic!("boom"));
        assert!(!job.execute());
    }

    #[test]
    fn test_custom_job() {
        struct Add(Arc<AtomicUsize>, usize);
        impl Job for Add {
            fn run(self: Box<Self>, syn: Option<&SyncGroup>) {
                assert!(syn.is_none());
                self.0.fetch_add(self.1, Ordering::Relaxed);
            }
        }

        let total = Arc::new(AtomicUsize::new(0));
        assert!(JobRef::new(Box::new(Add(Arc::clone(&total), 7))).execute());
        assert_eq!(total.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");

        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");

        let payload: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }
}
