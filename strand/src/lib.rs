//! Work-stealing job scheduler with serial queues and sync groups.
//!
//! - [`runtime`]: worker threads with bounded local deques and stealing
//! - [`queue`]: serial queues, including the main-thread queue
//! - [`sync`]: fork/join groups, completion notifications, per-thread data
//! - [`evc`], [`mpsc`], [`spsc`]: the lock-free building blocks, usable on
//!   their own

pub mod evc;
pub mod job;
pub mod mpsc;
pub mod queue;
pub mod runtime;
pub mod spsc;
pub mod sync;
pub mod trace;

mod stack;

pub use evc::{EventCount, Timeout};
pub use job::Job;
pub use queue::SerialQueue;
pub use runtime::{Handle, Runtime, RuntimeConfig, RuntimeError, Stats};
pub use sync::{PendingJob, SyncGroup, TdGuard, ThreadData};
pub use trace::init_tracing;
