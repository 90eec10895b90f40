//! Worker thread main loop.

use core_affinity::CoreId;
use crossbeam_deque::Worker;

use super::Handle;
use super::context::{self, Context};
use crate::evc::Timeout;
use crate::job::JobRef;
use crate::trace::{debug, info, warn};

pub(super) fn run(handle: Handle, id: usize, local: Worker<JobRef>, core: Option<CoreId>) {
    if let Some(core) = core {
        if core_affinity::set_for_current(core) {
            debug!(worker = id, core = core.id, "pinned worker");
        } else {
            warn!(worker = id, core = core.id, "failed to pin worker");
        }
    }

    let runtime = handle.shared.id;
    context::install(Context {
        runtime,
        id,
        local,
    });
    info!(worker = id, "worker started");

    let shared = &handle.shared;
    loop {
        if let Some(job) = handle.find_job() {
            handle.execute(job);
            continue;
        }

        let key = shared.idle.get();
        if let Some(job) = handle.find_job() {
            handle.execute(job);
            continue;
        }
        if shared.is_shutdown() {
            break;
        }
        shared.idle.wait(key, Timeout::Infinite);
    }

    // Anything still local is discarded; group jobs report done on drop.
    drop(context::uninstall(runtime));
    info!(worker = id, "worker exiting");
}
