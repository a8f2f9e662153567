use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::Instant;

use hashbrown::HashMap;
use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::priority::{ExecutionContext, PriorityStrategy};
use super::queue::{IndexedQueue, PriorityKey};
use super::task::{AbortCause, DriverTask, DriverTaskStatus, TaskInner};
use crate::ids::{FragmentInstanceId, QueryId};
use crate::runtime::Executor;
use crate::signal::SignalFuture;

/// Gets told about every fragment instance the scheduler aborts so that
/// resources tied to the instance (exchange handles) can be released.
pub trait FragmentInstanceRegistry: Debug + Sync + Send {
    fn force_deregister_fragment_instance(&self, id: &FragmentInstanceId);
}

/// Bookkeeping for every non-terminal task.
///
/// A task is in `timeouts` and its query group iff it's non-terminal. It's in
/// `ready` iff READY and in `blocked` iff BLOCKED. A RUNNING task is in
/// neither.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub(crate) ready: IndexedQueue<PriorityKey>,
    pub(crate) blocked: HashMap<FragmentInstanceId, Arc<DriverTask>>,
    pub(crate) timeouts: IndexedQueue<Instant>,
    pub(crate) queries: HashMap<QueryId, HashMap<FragmentInstanceId, Arc<DriverTask>>>,
    pub(crate) closed: bool,
}

impl SchedulerState {
    fn remove_from_indices(&mut self, id: &FragmentInstanceId) {
        self.ready.remove(id);
        self.blocked.remove(id);
        self.timeouts.remove(id);
    }

    fn remove_from_query_group(&mut self, id: &FragmentInstanceId) {
        if let Some(group) = self.queries.get_mut(&id.query_id) {
            group.remove(id);
            if group.is_empty() {
                self.queries.remove(&id.query_id);
            }
        }
    }
}

/// State transitions for driver tasks.
///
/// Every transition checks the task's current status under the state lock. A
/// transition attempted from the wrong status is a no-op returning `false`.
/// Workers rely on this since a task can be aborted while it's running, or a
/// stale blocked future can fire after the task has finished.
#[derive(Debug)]
pub struct TaskScheduler {
    pub(crate) state: Mutex<SchedulerState>,
    ready_cv: Condvar,
    priority: Arc<dyn PriorityStrategy>,
    registry: Arc<dyn FragmentInstanceRegistry>,
    /// Executor that blocked-future continuations run on.
    executor: Arc<dyn Executor>,
    this: Weak<TaskScheduler>,
}

impl TaskScheduler {
    pub fn new(
        priority: Arc<dyn PriorityStrategy>,
        registry: Arc<dyn FragmentInstanceRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| TaskScheduler {
            state: Mutex::new(SchedulerState::default()),
            ready_cv: Condvar::new(),
            priority,
            registry,
            executor,
            this: this.clone(),
        })
    }

    /// Add new READY tasks to the ready queue, the timeout index and their
    /// query groups.
    pub fn submit(&self, tasks: impl IntoIterator<Item = Arc<DriverTask>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MppError::with_kind(
                ErrorKind::InvalidState,
                "Scheduler is shut down",
            ));
        }

        let tasks: Vec<_> = tasks.into_iter().collect();
        if let Some(task) = tasks
            .iter()
            .find(|task| task.status() != DriverTaskStatus::Ready)
        {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!(
                    "Task {} must be READY to be submitted, got {:?}",
                    task.id(),
                    task.status()
                ),
            ));
        }

        let count = tasks.len();
        for task in tasks {
            let priority = task.schedule_priority();
            let id = task.id();
            trace!(task_id = %id, "submitting task");
            state.timeouts.push(task.ddl(), task.clone());
            state
                .queries
                .entry(id.query_id)
                .or_default()
                .insert(id, task.clone());
            state.ready.push(PriorityKey(priority), task);
        }

        drop(state);
        match count {
            0 => (),
            1 => {
                self.ready_cv.notify_one();
            }
            _ => {
                self.ready_cv.notify_all();
            }
        }

        Ok(())
    }

    /// Wait for the next ready task and move it to RUNNING.
    ///
    /// Returns `None` once the scheduler is closed.
    pub fn poll_next(&self) -> Option<Arc<DriverTask>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            match state.ready.pop() {
                Some(task) => {
                    let mut inner = task.inner.lock();
                    if inner.status == DriverTaskStatus::Ready {
                        inner.status = DriverTaskStatus::Running;
                        drop(inner);
                        return Some(task);
                    }
                }
                None => self.ready_cv.wait(&mut state),
            }
        }
    }

    /// BLOCKED -> READY.
    pub fn blocked_to_ready(&self, task: &Arc<DriverTask>) -> bool {
        let mut state = self.state.lock();
        let mut inner = task.inner.lock();
        if inner.status != DriverTaskStatus::Blocked {
            return false;
        }

        state.blocked.remove(&task.id());
        inner.status = DriverTaskStatus::Ready;
        state
            .ready
            .push(PriorityKey(inner.schedule_priority), task.clone());
        drop(inner);
        drop(state);

        self.ready_cv.notify_one();
        true
    }

    /// READY -> RUNNING.
    pub fn ready_to_running(&self, task: &Arc<DriverTask>) -> bool {
        let mut state = self.state.lock();
        let mut inner = task.inner.lock();
        if inner.status != DriverTaskStatus::Ready {
            return false;
        }

        state.ready.remove(&task.id());
        inner.status = DriverTaskStatus::Running;
        true
    }

    /// RUNNING -> READY, after the driver used up its time slice.
    pub fn running_to_ready(&self, task: &Arc<DriverTask>, ctx: &ExecutionContext) -> bool {
        let mut state = self.state.lock();
        let mut inner = task.inner.lock();
        if inner.status != DriverTaskStatus::Running {
            return false;
        }

        self.update_priority(&mut inner, ctx);
        inner.status = DriverTaskStatus::Ready;
        state
            .ready
            .push(PriorityKey(inner.schedule_priority), task.clone());
        drop(inner);
        drop(state);

        self.ready_cv.notify_one();
        true
    }

    /// RUNNING -> BLOCKED.
    ///
    /// Completion (or cancellation) of `blocked` moves the task back to READY.
    pub fn running_to_blocked(
        &self,
        task: &Arc<DriverTask>,
        ctx: &ExecutionContext,
        blocked: SignalFuture,
    ) -> bool {
        {
            let mut state = self.state.lock();
            let mut inner = task.inner.lock();
            if inner.status != DriverTaskStatus::Running {
                return false;
            }

            self.update_priority(&mut inner, ctx);
            inner.status = DriverTaskStatus::Blocked;
            state.blocked.insert(task.id(), task.clone());
        }

        // Registered after the task is in the blocked set, so a future that's
        // already done still finds it there.
        let this = self.this.clone();
        let task = task.clone();
        blocked.add_listener(self.executor.clone(), move || {
            if let Some(scheduler) = this.upgrade() {
                scheduler.blocked_to_ready(&task);
            }
        });

        true
    }

    /// RUNNING -> FINISHED.
    pub fn running_to_finished(&self, task: &Arc<DriverTask>, ctx: &ExecutionContext) -> bool {
        let mut state = self.state.lock();
        let mut inner = task.inner.lock();
        if inner.status != DriverTaskStatus::Running {
            return false;
        }

        self.update_priority(&mut inner, ctx);
        inner.status = DriverTaskStatus::Finished;
        drop(inner);

        let id = task.id();
        state.remove_from_indices(&id);
        state.remove_from_query_group(&id);
        debug!(task_id = %id, "task finished");

        true
    }

    /// Any non-terminal status -> ABORTED.
    ///
    /// Every other non-terminal task in the same query is aborted as well and
    /// has its driver closed. The driver of `task` itself is not closed here,
    /// that's left to the caller which already owns the failure.
    ///
    /// Returns `false` if `task` was already terminal.
    pub fn to_aborted(
        &self,
        task: &Arc<DriverTask>,
        cause: &MppError,
        abort_cause: AbortCause,
    ) -> bool {
        let id = task.id();
        let siblings = {
            let mut state = self.state.lock();
            {
                let mut inner = task.inner.lock();
                if inner.status.is_terminal() {
                    return false;
                }
                inner.status = DriverTaskStatus::Aborted;
                inner.abort_cause = Some(abort_cause);
            }
            state.remove_from_indices(&id);

            let group = state.queries.remove(&id.query_id).unwrap_or_default();
            let mut siblings = Vec::with_capacity(group.len());
            for (sibling_id, sibling) in group {
                if sibling_id == id {
                    continue;
                }
                let mut inner = sibling.inner.lock();
                if inner.status.is_terminal() {
                    continue;
                }
                inner.status = DriverTaskStatus::Aborted;
                inner.abort_cause = Some(AbortCause::CascadingAbort);
                drop(inner);

                state.remove_from_indices(&sibling_id);
                siblings.push(sibling);
            }

            siblings
        };

        debug!(task_id = %id, ?abort_cause, siblings = %siblings.len(), %cause, "task aborted");

        self.registry.force_deregister_fragment_instance(&id);
        if siblings.is_empty() {
            return true;
        }

        let sibling_cause = MppError::with_kind(
            ErrorKind::Aborted,
            format!("Aborted because fragment instance {id} of the same query failed: {cause}"),
        );
        for sibling in siblings {
            self.registry
                .force_deregister_fragment_instance(&sibling.id());
            sibling.driver().close(&sibling_cause);
        }

        true
    }

    /// Non-terminal tasks whose deadline is at or before `now`, earliest
    /// first.
    pub fn expired_tasks(&self, now: Instant) -> Vec<Arc<DriverTask>> {
        let state = self.state.lock();
        state
            .timeouts
            .iter_ordered()
            .take_while(|(ddl, _)| *ddl <= now)
            .map(|(_, task)| task.clone())
            .collect()
    }

    /// Every non-terminal task.
    pub fn live_tasks(&self) -> Vec<Arc<DriverTask>> {
        let state = self.state.lock();
        state.timeouts.iter().cloned().collect()
    }

    pub fn task(&self, id: &FragmentInstanceId) -> Option<Arc<DriverTask>> {
        self.state.lock().timeouts.get(id).cloned()
    }

    /// Stop handing out tasks. Wakes up every worker waiting in `poll_next`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn in_ready_queue(&self, id: &FragmentInstanceId) -> bool {
        self.state.lock().ready.contains(id)
    }

    pub fn in_blocked_set(&self, id: &FragmentInstanceId) -> bool {
        self.state.lock().blocked.contains_key(id)
    }

    pub fn in_timeout_index(&self, id: &FragmentInstanceId) -> bool {
        self.state.lock().timeouts.contains(id)
    }

    /// Members of a query group, `None` if the group doesn't exist.
    pub fn query_group(&self, query_id: &QueryId) -> Option<Vec<FragmentInstanceId>> {
        self.state
            .lock()
            .queries
            .get(query_id)
            .map(|group| group.keys().copied().collect())
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    fn update_priority(&self, inner: &mut TaskInner, ctx: &ExecutionContext) {
        inner.schedule_priority = self.priority.next_priority(inner.schedule_priority, ctx);
    }
}
