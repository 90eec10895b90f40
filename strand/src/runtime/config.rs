//! Runtime configuration and errors.

use std::env;
use std::num::NonZeroUsize;
use std::thread;

use thiserror::Error;

use crate::trace::warn;

/// Default bound on a context's local job queue.
pub const DEFAULT_MAX_LOCAL_JOBS: usize = 256;

/// Upper bound on worker threads.
pub const MAX_WORKERS: usize = 1024;

/// Configuration for [`Runtime::spawn`](super::Runtime::spawn).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads. The spawning thread is an extra context on
    /// top of these. Zero is allowed: the spawning thread then runs every job
    /// itself while waiting.
    pub workers: usize,
    /// Bound on each context's local queue. Submissions beyond it run inline.
    pub max_local_jobs: usize,
    /// Worker thread name prefix; workers are named `{thread_name}-{id}`.
    pub thread_name: String,
    /// Worker stack size in bytes, or the platform default.
    pub stack_size: Option<usize>,
    /// Pin worker `i` to core `i % cores`.
    pub pin_workers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            workers: cores.saturating_sub(1).max(1),
            max_local_jobs: DEFAULT_MAX_LOCAL_JOBS,
            thread_name: "strand-worker".into(),
            stack_size: None,
            pin_workers: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `STRAND_WORKERS`, `STRAND_MAX_LOCAL_JOBS` and
    /// `STRAND_PIN_WORKERS`. Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = env_parse::<usize>("STRAND_WORKERS") {
            config.workers = workers;
        }
        if let Some(max) = env_parse::<usize>("STRAND_MAX_LOCAL_JOBS") {
            config.max_local_jobs = max;
        }
        if let Some(pin) = env_parse::<bool>("STRAND_PIN_WORKERS") {
            config.pin_workers = pin;
        }
        config
    }

    /// Total number of contexts: workers plus the spawning thread.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.workers + 1
    }

    pub(crate) fn validate(&self) -> Result<(), RuntimeError> {
        if self.workers > MAX_WORKERS {
            return Err(RuntimeError::InvalidConfig("too many workers"));
        }
        if self.max_local_jobs == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_local_jobs must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Errors raised while starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// The configuration was rejected.
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(&'static str),
}
