use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mppexec_error::{ErrorKind, MppError, Result, ResultExt};
use tracing::{debug, warn};

use super::task::AbortCause;
use super::task_scheduler::TaskScheduler;

/// Abort every task whose deadline is at or before `now`.
///
/// Returns the number of tasks this call aborted directly (cascaded siblings
/// aren't counted).
pub fn abort_expired(scheduler: &TaskScheduler, now: Instant) -> usize {
    let mut aborted = 0;
    for task in scheduler.expired_tasks(now) {
        let err = MppError::with_kind(
            ErrorKind::TimedOut,
            format!("Fragment instance {} exceeded its deadline", task.id()),
        );
        if scheduler.to_aborted(&task, &err, AbortCause::TimedOut) {
            warn!(task_id = %task.id(), "task timed out");
            task.driver().close(&err);
            aborted += 1;
        }
    }
    aborted
}

/// Spawn the thread that periodically aborts expired tasks.
pub fn spawn_timeout_sweeper(
    scheduler: &Arc<TaskScheduler>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    let scheduler = scheduler.clone();
    std::thread::Builder::new()
        .name("mppexec_timeout".to_string())
        .spawn(move || {
            debug!("timeout sweeper started");
            while !scheduler.is_closed() {
                abort_expired(&scheduler, Instant::now());
                std::thread::sleep(interval);
            }
            debug!("timeout sweeper exiting");
        })
        .context("Failed to spawn timeout sweeper thread")
}
