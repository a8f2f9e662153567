pub mod time;

use std::fmt::Debug;
use std::sync::Arc;

use rayon::ThreadPool;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs on some other thread.
///
/// Signal continuations and exchange network calls are dispatched through
/// this so that they never run on the call stack of whoever completed the
/// signal (which is likely holding a lock).
pub trait Executor: Debug + Sync + Send {
    /// Spawn a job. Must not block, and must not run the job inline.
    fn spawn(&self, job: Job);
}

impl Executor for ThreadPool {
    fn spawn(&self, job: Job) {
        ThreadPool::spawn(self, job)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn spawn(&self, job: Job) {
        self.as_ref().spawn(job)
    }
}
