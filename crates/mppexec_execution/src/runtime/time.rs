use std::time::{Duration, Instant};

/// Wall and CPU time spent between two points on the same thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuDuration {
    pub wall: Duration,
    pub cpu: Duration,
}

/// Measures wall and thread CPU time for one slice of driver execution.
///
/// Must be started and stopped on the same thread since the CPU clock is per
/// thread.
#[derive(Debug)]
pub struct CpuTimer {
    wall_start: Instant,
    cpu_start: Option<Duration>,
}

impl CpuTimer {
    pub fn start() -> Self {
        CpuTimer {
            wall_start: Instant::now(),
            cpu_start: current_thread_cpu_time(),
        }
    }

    pub fn elapsed(&self) -> CpuDuration {
        let wall = self.wall_start.elapsed();
        let cpu = match (self.cpu_start, current_thread_cpu_time()) {
            (Some(start), Some(now)) => now.saturating_sub(start),
            // No thread clock, wall time is the best we have.
            _ => wall,
        };
        CpuDuration { wall, cpu }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
fn current_thread_cpu_time() -> Option<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 || ts.tv_sec < 0 || ts.tv_nsec < 0 {
        return None;
    }
    Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn current_thread_cpu_time() -> Option<Duration> {
    None
}
