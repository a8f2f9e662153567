use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::driver::Driver;
use crate::ids::{FragmentInstanceId, QueryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverTaskStatus {
    /// Waiting in the ready queue for a worker.
    Ready,
    /// Being executed by a worker.
    Running,
    /// Waiting on some future to complete.
    Blocked,
    Finished,
    Aborted,
}

impl DriverTaskStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

/// Why a task ended up aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortCause {
    /// The task's deadline passed.
    TimedOut,
    /// Another task in the same query was aborted.
    CascadingAbort,
    /// The query was cancelled from outside.
    QueryCancelled,
    /// The driver returned an error (or panicked).
    DriverFailed,
    /// The scheduler is shutting down.
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct TaskInner {
    pub(crate) status: DriverTaskStatus,
    /// Lower runs sooner.
    pub(crate) schedule_priority: f64,
    pub(crate) abort_cause: Option<AbortCause>,
}

/// The schedulable unit wrapping one driver.
///
/// Status and priority are only modified by the task scheduler while holding
/// its state lock.
pub struct DriverTask {
    id: FragmentInstanceId,
    driver: Arc<dyn Driver>,
    /// Deadline after which the task is forcibly aborted.
    ddl: Instant,
    pub(crate) inner: Mutex<TaskInner>,
}

impl DriverTask {
    pub fn new(driver: Arc<dyn Driver>, ddl: Instant, status: DriverTaskStatus) -> Self {
        DriverTask {
            id: driver.info(),
            driver,
            ddl,
            inner: Mutex::new(TaskInner {
                status,
                schedule_priority: 0.0,
                abort_cause: None,
            }),
        }
    }

    pub fn id(&self) -> FragmentInstanceId {
        self.id
    }

    pub fn query_id(&self) -> QueryId {
        self.id.query_id
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn ddl(&self) -> Instant {
        self.ddl
    }

    pub fn status(&self) -> DriverTaskStatus {
        self.inner.lock().status
    }

    pub fn schedule_priority(&self) -> f64 {
        self.inner.lock().schedule_priority
    }

    pub fn abort_cause(&self) -> Option<AbortCause> {
        self.inner.lock().abort_cause
    }
}

impl fmt::Debug for DriverTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DriverTask")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("schedule_priority", &inner.schedule_priority)
            .field("ddl", &self.ddl)
            .finish_non_exhaustive()
    }
}
