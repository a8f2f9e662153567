use std::fmt::Debug;
use std::time::Duration;

use crate::runtime::time::CpuDuration;

/// Produced by a worker after running a driver for one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionContext {
    pub cpu_duration: CpuDuration,
    pub time_slice: Duration,
}

/// Maps observed CPU usage onto a schedule priority. Lower runs sooner.
pub trait PriorityStrategy: Debug + Sync + Send {
    fn next_priority(&self, current: f64, ctx: &ExecutionContext) -> f64;
}

/// Priority is the accumulated CPU seconds a task has consumed, so CPU-heavy
/// tasks sink below light ones in the ready queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTimePriority;

impl PriorityStrategy for CpuTimePriority {
    fn next_priority(&self, current: f64, ctx: &ExecutionContext) -> f64 {
        current + ctx.cpu_duration.cpu.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_cpu_seconds() {
        let strategy = CpuTimePriority;
        let ctx = ExecutionContext {
            cpu_duration: CpuDuration {
                wall: Duration::from_millis(900),
                cpu: Duration::from_millis(500),
            },
            time_slice: Duration::from_secs(1),
        };

        let p = strategy.next_priority(0.0, &ctx);
        let p = strategy.next_priority(p, &ctx);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_cpu_keeps_priority() {
        let p = CpuTimePriority.next_priority(0.0, &ExecutionContext::default());
        assert_eq!(0.0, p);
    }
}
