use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mppexec_error::{MppError, Result, ResultExt};
use tracing::{debug, error, trace};

use super::priority::ExecutionContext;
use super::task::{AbortCause, DriverTask};
use super::task_scheduler::TaskScheduler;
use crate::driver::DriverProgress;
use crate::runtime::time::CpuTimer;

/// Spawn `num_threads` worker threads pulling from `scheduler`.
///
/// Workers exit once the scheduler is closed.
pub fn spawn_workers(
    scheduler: &Arc<TaskScheduler>,
    num_threads: usize,
    time_slice: Duration,
) -> Result<Vec<JoinHandle<()>>> {
    (0..num_threads)
        .map(|idx| {
            let scheduler = scheduler.clone();
            std::thread::Builder::new()
                .name(format!("mppexec_driver_{idx}"))
                .spawn(move || worker_loop(&scheduler, time_slice))
                .context("Failed to spawn driver worker thread")
        })
        .collect()
}

fn worker_loop(scheduler: &TaskScheduler, time_slice: Duration) {
    debug!("driver worker started");
    while let Some(task) = scheduler.poll_next() {
        run_task(scheduler, &task, time_slice);
    }
    debug!("driver worker exiting");
}

/// Run a single slice of a RUNNING task and move it to its next status.
pub(crate) fn run_task(scheduler: &TaskScheduler, task: &Arc<DriverTask>, time_slice: Duration) {
    trace!(task_id = %task.id(), "running task");

    let timer = CpuTimer::start();
    let result = panic::catch_unwind(AssertUnwindSafe(|| task.driver().process_for(time_slice)));
    let ctx = ExecutionContext {
        cpu_duration: timer.elapsed(),
        time_slice,
    };

    let result = match result {
        Ok(result) => result,
        Err(payload) => Err(MppError::new(format!(
            "Driver panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };

    // Transitions may fail here if the task was aborted while it was running
    // (timeout or sibling failure). That's fine, the abort already won.
    match result {
        Ok(DriverProgress::Yield) => {
            scheduler.running_to_ready(task, &ctx);
        }
        Ok(DriverProgress::Blocked(fut)) => {
            scheduler.running_to_blocked(task, &ctx, fut);
        }
        Ok(DriverProgress::Finished) => {
            scheduler.running_to_finished(task, &ctx);
        }
        Err(e) => {
            error!(task_id = %task.id(), %e, "driver failed");
            if scheduler.to_aborted(task, &e, AbortCause::DriverFailed) {
                task.driver().close(&e);
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
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::scheduler::priority::CpuTimePriority;
    use crate::scheduler::task::DriverTaskStatus;
    use crate::signal::Signal;
    use crate::testutil::{instance_id, CountingRegistry, ManualExecutor, MockDriver, MockStep};

    fn setup(steps: Vec<MockStep>) -> (Arc<TaskScheduler>, Arc<MockDriver>, Arc<DriverTask>) {
        let scheduler = TaskScheduler::new(
            Arc::new(CpuTimePriority),
            Arc::new(CountingRegistry::default()),
            Arc::new(ManualExecutor::default()),
        );
        let driver = Arc::new(MockDriver::with_steps(instance_id(3, 0), steps));
        let task = Arc::new(DriverTask::new(
            driver.clone(),
            Instant::now() + Duration::from_secs(60),
            DriverTaskStatus::Ready,
        ));
        scheduler.submit([task.clone()]).unwrap();
        (scheduler, driver, task)
    }

    fn poll_and_run(scheduler: &TaskScheduler) {
        let task = scheduler.poll_next().unwrap();
        run_task(scheduler, &task, Duration::from_millis(10));
    }

    #[test]
    fn yield_requeues() {
        let (scheduler, _, task) = setup(vec![MockStep::Yield, MockStep::Finish]);
        poll_and_run(&scheduler);
        assert_eq!(DriverTaskStatus::Ready, task.status());
        poll_and_run(&scheduler);
        assert_eq!(DriverTaskStatus::Finished, task.status());
    }

    #[test]
    fn blocked_parks_task() {
        let signal = Signal::new();
        let (scheduler, _, task) = setup(vec![MockStep::Block(signal.future())]);
        poll_and_run(&scheduler);
        assert_eq!(DriverTaskStatus::Blocked, task.status());
        assert!(scheduler.in_blocked_set(&task.id()));
    }

    #[test]
    fn error_aborts_and_closes() {
        let (scheduler, driver, task) = setup(vec![MockStep::Fail("bad input")]);
        poll_and_run(&scheduler);
        assert_eq!(DriverTaskStatus::Aborted, task.status());
        assert_eq!(Some(AbortCause::DriverFailed), task.abort_cause());
        assert_eq!(1, driver.close_count());
    }

    #[test]
    fn panic_aborts_and_closes() {
        let (scheduler, driver, task) = setup(vec![MockStep::Panic]);
        poll_and_run(&scheduler);
        assert_eq!(DriverTaskStatus::Aborted, task.status());
        assert_eq!(1, driver.close_count());
    }

    #[test]
    fn panic_message_from_payload() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("oops"));
        assert_eq!("oops", panic_message(payload.as_ref()));
        let payload: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!("unknown panic payload", panic_message(payload.as_ref()));
    }
}
