//! Cooperative scheduling of driver tasks onto a fixed set of worker threads.
//!
//! Drivers from many queries are multiplexed by priority (CPU time consumed so
//! far). A driver that can't make progress reports a future and gives its
//! thread back; completion of the future re-queues it.

pub mod priority;
pub mod queue;
pub mod task;
pub mod task_scheduler;
pub mod timeout;
pub mod worker;

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use self::priority::{CpuTimePriority, PriorityStrategy};
use self::task::{AbortCause, DriverTask, DriverTaskStatus};
use self::task_scheduler::{FragmentInstanceRegistry, TaskScheduler};
use crate::config::SchedulerConfig;
use crate::driver::Driver;
use crate::exchange::manager::ExchangeFailureHandler;
use crate::ids::{FragmentInstanceId, QueryId};
use crate::runtime::Executor;

/// Owns the task scheduler along with the threads driving it.
#[derive(Debug)]
pub struct DriverScheduler {
    scheduler: Arc<TaskScheduler>,
    query_timeout: Duration,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DriverScheduler {
    /// Create a scheduler using the default CPU time priority.
    ///
    /// `executor` runs continuations of blocked futures.
    pub fn new(
        config: &SchedulerConfig,
        registry: Arc<dyn FragmentInstanceRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        Self::with_priority_strategy(config, registry, executor, Arc::new(CpuTimePriority))
    }

    pub fn with_priority_strategy(
        config: &SchedulerConfig,
        registry: Arc<dyn FragmentInstanceRegistry>,
        executor: Arc<dyn Executor>,
        priority: Arc<dyn PriorityStrategy>,
    ) -> Result<Self> {
        let scheduler = TaskScheduler::new(priority, registry, executor);

        let mut threads =
            worker::spawn_workers(&scheduler, config.worker_threads, config.time_slice())?;
        threads.push(timeout::spawn_timeout_sweeper(
            &scheduler,
            config.timeout_sweep_interval(),
        )?);

        info!(
            worker_threads = %config.worker_threads,
            time_slice_ms = %config.time_slice_ms,
            "started driver scheduler"
        );

        Ok(DriverScheduler {
            scheduler,
            query_timeout: config.query_timeout(),
            threads: Mutex::new(threads),
        })
    }

    /// Wrap each driver in a READY task and queue it.
    ///
    /// Tasks get a deadline of the configured query timeout from now.
    pub fn submit_drivers(
        &self,
        drivers: impl IntoIterator<Item = Arc<dyn Driver>>,
    ) -> Result<Vec<Arc<DriverTask>>> {
        let ddl = Instant::now() + self.query_timeout;
        self.submit_drivers_with_deadline(drivers, ddl)
    }

    pub fn submit_drivers_with_deadline(
        &self,
        drivers: impl IntoIterator<Item = Arc<dyn Driver>>,
        ddl: Instant,
    ) -> Result<Vec<Arc<DriverTask>>> {
        let tasks: Vec<_> = drivers
            .into_iter()
            .map(|driver| Arc::new(DriverTask::new(driver, ddl, DriverTaskStatus::Ready)))
            .collect();
        self.scheduler.submit(tasks.iter().cloned())?;
        debug!(num_tasks = %tasks.len(), "submitted driver tasks");
        Ok(tasks)
    }

    /// Abort every task of a query.
    ///
    /// Aborting one task cascades to the rest of the query. Returns false if
    /// the query has no live tasks.
    pub fn abort_query(&self, query_id: &QueryId) -> bool {
        let first = self
            .scheduler
            .query_group(query_id)
            .and_then(|ids| ids.into_iter().find_map(|id| self.scheduler.task(&id)));
        let task = match first {
            Some(task) => task,
            None => return false,
        };

        let cause = MppError::with_kind(ErrorKind::Cancelled, format!("Query {query_id} cancelled"));
        if self
            .scheduler
            .to_aborted(&task, &cause, AbortCause::QueryCancelled)
        {
            task.driver().close(&cause);
            info!(%query_id, "query cancelled");
            true
        } else {
            false
        }
    }

    /// Get a live task by id.
    pub fn task(&self, id: &FragmentInstanceId) -> Option<Arc<DriverTask>> {
        self.scheduler.task(id)
    }

    pub fn task_scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Abort the task of a fragment instance because of a failure outside of
    /// its driver, e.g. an exchange that gave up on its peer.
    ///
    /// Returns false if the instance has no live task.
    pub fn fail_instance(&self, instance_id: &FragmentInstanceId, error: &MppError) -> bool {
        fail_instance(&self.scheduler, instance_id, error)
    }

    /// Failure handler for exchanges created on behalf of this scheduler's
    /// tasks.
    pub fn failure_handler(&self) -> Arc<dyn ExchangeFailureHandler> {
        Arc::new(TaskFailureHandler {
            scheduler: Arc::downgrade(&self.scheduler),
        })
    }

    /// Stop all threads and abort whatever is still live.
    ///
    /// Workers finish their current slice before exiting. Calling this more
    /// than once is fine.
    pub fn shutdown(&self) {
        self.scheduler.close();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }

        let cause = MppError::with_kind(ErrorKind::Aborted, "Scheduler shut down");
        for task in self.scheduler.live_tasks() {
            if self.scheduler.to_aborted(&task, &cause, AbortCause::Shutdown) {
                task.driver().close(&cause);
            }
        }
    }
}

fn fail_instance(scheduler: &TaskScheduler, instance_id: &FragmentInstanceId, error: &MppError) -> bool {
    let task = match scheduler.task(instance_id) {
        Some(task) => task,
        None => return false,
    };
    if scheduler.to_aborted(&task, error, AbortCause::DriverFailed) {
        warn!(task_id = %instance_id, %error, "fragment instance failed");
        task.driver().close(error);
        true
    } else {
        false
    }
}

/// Fails the task of an instance whose exchange failed.
///
/// Only holds a weak reference, exchanges outlive the scheduler during
/// shutdown.
#[derive(Debug)]
struct TaskFailureHandler {
    scheduler: Weak<TaskScheduler>,
}

impl ExchangeFailureHandler for TaskFailureHandler {
    fn on_exchange_failure(&self, instance_id: FragmentInstanceId, error: MppError) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            fail_instance(&scheduler, &instance_id, &error);
        }
    }
}

impl Drop for DriverScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use crate::testutil::{instance_id, wait_for, CountingRegistry, MockDriver, MockStep};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            worker_threads: 2,
            time_slice_ms: 5,
            query_timeout_ms: 60_000,
            timeout_sweep_interval_ms: 5,
        }
    }

    fn new_scheduler(config: &SchedulerConfig) -> (DriverScheduler, Arc<CountingRegistry>) {
        let registry = Arc::new(CountingRegistry::default());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let scheduler = DriverScheduler::new(config, registry.clone(), Arc::new(pool)).unwrap();
        (scheduler, registry)
    }

    #[test]
    fn runs_drivers_to_completion() {
        let (scheduler, _) = new_scheduler(&config());
        let driver = Arc::new(MockDriver::with_steps(
            instance_id(1, 0),
            vec![MockStep::Yield, MockStep::Yield, MockStep::Finish],
        ));
        let tasks = scheduler.submit_drivers([driver.clone() as _]).unwrap();

        assert!(wait_for(|| tasks[0].status() == DriverTaskStatus::Finished));
        assert_eq!(3, driver.process_count());
        assert!(scheduler.task(&tasks[0].id()).is_none());
    }

    #[test]
    fn blocked_driver_resumes_on_signal() {
        let (scheduler, _) = new_scheduler(&config());
        let signal = Signal::new();
        let driver = Arc::new(MockDriver::with_steps(
            instance_id(1, 0),
            vec![MockStep::Block(signal.future()), MockStep::Finish],
        ));
        let tasks = scheduler.submit_drivers([driver as _]).unwrap();

        assert!(wait_for(|| tasks[0].status() == DriverTaskStatus::Blocked));
        signal.set();
        assert!(wait_for(|| tasks[0].status() == DriverTaskStatus::Finished));
    }

    #[test]
    fn abort_query_cascades() {
        let (scheduler, registry) = new_scheduler(&config());
        let signal = Signal::new();
        let d1 = Arc::new(MockDriver::with_steps(
            instance_id(4, 0),
            vec![MockStep::Block(signal.future())],
        ));
        let d2 = Arc::new(MockDriver::with_steps(
            instance_id(4, 1),
            vec![MockStep::Block(signal.future())],
        ));
        let tasks = scheduler.submit_drivers([d1.clone() as _, d2.clone() as _]).unwrap();
        assert!(wait_for(|| tasks
            .iter()
            .all(|t| t.status() == DriverTaskStatus::Blocked)));

        assert!(scheduler.abort_query(&instance_id(4, 0).query_id));
        for task in &tasks {
            assert_eq!(DriverTaskStatus::Aborted, task.status());
        }
        assert_eq!(1, d1.close_count());
        assert_eq!(1, d2.close_count());
        assert_eq!(2, registry.count());

        assert!(!scheduler.abort_query(&instance_id(4, 0).query_id));
    }

    #[test]
    fn deadline_times_out_task() {
        let (scheduler, _) = new_scheduler(&config());
        let driver = Arc::new(MockDriver::with_steps(
            instance_id(2, 0),
            vec![MockStep::Block(Signal::new().future())],
        ));
        let tasks = scheduler
            .submit_drivers_with_deadline(
                [driver.clone() as _],
                Instant::now() + Duration::from_millis(30),
            )
            .unwrap();

        assert!(wait_for(|| tasks[0].status() == DriverTaskStatus::Aborted));
        assert_eq!(Some(AbortCause::TimedOut), tasks[0].abort_cause());
        assert_eq!(1, driver.close_count());
    }

    #[test]
    fn exchange_failure_fails_instance() {
        let (scheduler, registry) = new_scheduler(&config());
        let signal = Signal::new();
        let d1 = Arc::new(MockDriver::with_steps(
            instance_id(7, 0),
            vec![MockStep::Block(signal.future())],
        ));
        let d2 = Arc::new(MockDriver::with_steps(
            instance_id(7, 1),
            vec![MockStep::Block(signal.future())],
        ));
        let tasks = scheduler.submit_drivers([d1.clone() as _, d2.clone() as _]).unwrap();
        assert!(wait_for(|| tasks
            .iter()
            .all(|t| t.status() == DriverTaskStatus::Blocked)));

        let handler = scheduler.failure_handler();
        handler.on_exchange_failure(
            instance_id(7, 0),
            MppError::with_kind(ErrorKind::Transport, "peer went away"),
        );

        assert_eq!(Some(AbortCause::DriverFailed), tasks[0].abort_cause());
        assert_eq!(Some(AbortCause::CascadingAbort), tasks[1].abort_cause());
        assert_eq!(vec![ErrorKind::Transport], d1.close_causes());
        assert_eq!(vec![ErrorKind::Aborted], d2.close_causes());
        assert_eq!(2, registry.count());

        assert!(!scheduler.fail_instance(
            &instance_id(7, 0),
            &MppError::new("already aborted")
        ));
    }

    #[test]
    fn shutdown_aborts_live_tasks() {
        let (scheduler, _) = new_scheduler(&config());
        let driver = Arc::new(MockDriver::with_steps(
            instance_id(5, 0),
            vec![MockStep::Block(Signal::new().future())],
        ));
        let tasks = scheduler.submit_drivers([driver.clone() as _]).unwrap();
        assert!(wait_for(|| tasks[0].status() == DriverTaskStatus::Blocked));

        scheduler.shutdown();
        assert_eq!(Some(AbortCause::Shutdown), tasks[0].abort_cause());
        assert_eq!(1, driver.close_count());

        let err = scheduler
            .submit_drivers([Arc::new(MockDriver::new(instance_id(6, 0))) as _])
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidState, err.kind());

        // Second shutdown is a no-op.
        scheduler.shutdown();
    }
}
