use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;

use crate::runtime::{Executor, Job};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalStatus {
    Pending,
    Set,
    Cancelled,
}

struct SignalState {
    status: SignalStatus,
    wakers: Vec<Waker>,
    listeners: Vec<(Arc<dyn Executor>, Job)>,
}

struct SignalInner {
    state: Mutex<SignalState>,
}

/// A manually completed one-shot signal.
///
/// Completing (or cancelling) the signal wakes every task awaiting a
/// [`SignalFuture`] for it and dispatches registered listeners onto their
/// executors. Listeners never run on the completer's call stack.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    status: SignalStatus::Pending,
                    wakers: Vec::new(),
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Create a signal that's already set.
    pub fn completed() -> Self {
        let signal = Self::new();
        signal.set();
        signal
    }

    /// Set the signal. Returns false if the signal was already done.
    pub fn set(&self) -> bool {
        self.finish(SignalStatus::Set)
    }

    /// Cancel the signal. Returns false if the signal was already done.
    pub fn cancel(&self) -> bool {
        self.finish(SignalStatus::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().status != SignalStatus::Pending
    }

    pub fn is_set(&self) -> bool {
        self.inner.state.lock().status == SignalStatus::Set
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().status == SignalStatus::Cancelled
    }

    /// Get a read-only handle to this signal.
    ///
    /// Dropping or polling the handle never affects the signal itself.
    pub fn future(&self) -> SignalFuture {
        SignalFuture {
            inner: self.inner.clone(),
        }
    }

    /// Run `f` on `executor` once the signal is done (set or cancelled).
    pub fn add_listener<F>(&self, executor: Arc<dyn Executor>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        add_listener(&self.inner, executor, Box::new(f))
    }

    fn finish(&self, status: SignalStatus) -> bool {
        let (wakers, listeners) = {
            let mut state = self.inner.state.lock();
            if state.status != SignalStatus::Pending {
                return false;
            }
            state.status = status;
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.listeners),
            )
        };

        for waker in wakers {
            waker.wake();
        }
        for (executor, job) in listeners {
            executor.spawn(job);
        }

        true
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("status", &self.inner.state.lock().status)
            .finish_non_exhaustive()
    }
}

fn add_listener(inner: &SignalInner, executor: Arc<dyn Executor>, job: Job) {
    let mut state = inner.state.lock();
    if state.status == SignalStatus::Pending {
        state.listeners.push((executor, job));
        return;
    }
    drop(state);
    executor.spawn(job);
}

/// Read-only handle to a [`Signal`].
///
/// Resolves to `Ok(())` when the signal is set, and to a `Cancelled` error when
/// the signal is cancelled.
#[derive(Clone)]
pub struct SignalFuture {
    inner: Arc<SignalInner>,
}

impl SignalFuture {
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().status != SignalStatus::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().status == SignalStatus::Cancelled
    }

    /// Run `f` on `executor` once the signal is done (set or cancelled).
    pub fn add_listener<F>(&self, executor: Arc<dyn Executor>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        add_listener(&self.inner, executor, Box::new(f))
    }

    /// Check if both handles point to the same signal.
    pub fn same_signal(&self, other: &SignalFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Future for SignalFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        match state.status {
            SignalStatus::Set => Poll::Ready(Ok(())),
            SignalStatus::Cancelled => Poll::Ready(Err(MppError::with_kind(
                ErrorKind::Cancelled,
                "Signal cancelled",
            ))),
            SignalStatus::Pending => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for SignalFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFuture")
            .field("status", &self.inner.state.lock().status)
            .finish_non_exhaustive()
    }
}
