use std::fmt::Debug;
use std::time::Duration;

use mppexec_error::{MppError, Result};

use crate::ids::FragmentInstanceId;
use crate::signal::SignalFuture;

/// What a driver reported at the end of a time slice.
#[derive(Debug)]
pub enum DriverProgress {
    /// The slice ran out but the driver still has work it can do right away.
    Yield,

    /// The driver can't make progress until the future completes. The task
    /// is parked and re-queued by the future's completion.
    Blocked(SignalFuture),

    /// The driver produced all of its output.
    Finished,
}

/// A pipeline of operators realizing one fragment instance.
///
/// The scheduler knows nothing about what the operators compute. It only
/// steps the driver for bounded slices and closes it when the instance is
/// torn down.
pub trait Driver: Debug + Sync + Send {
    /// The fragment instance this driver executes.
    fn info(&self) -> FragmentInstanceId;

    /// Run for at most roughly `time_slice`.
    ///
    /// A driver must yield or block voluntarily, there's no preemption. An
    /// error aborts the task (and every other task in the same query).
    fn process_for(&self, time_slice: Duration) -> Result<DriverProgress>;

    /// Release all resources held by the driver because its fragment
    /// instance failed with `cause`.
    ///
    /// May be called while another thread is inside `process_for`.
    fn close(&self, cause: &MppError);
}
