//! Tracing shim for the scheduler and its primitives.
//!
//! Enable with `--features tracing`. Without the feature every macro expands
//! to nothing, so the job submission hot path carries no logging cost.

/// Install a tracing subscriber with thread names and uptime timestamps.
///
/// Call this once at the start of a test or a binary. The filter defaults to
/// `strand=trace` and can be overridden with `RUST_LOG`.
/// Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=trace"));

    // A second call (another test in the same binary) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};
