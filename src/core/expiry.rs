// Cancellable, reschedulable one-shot timer backed by a dedicated worker thread.
//
// Lock order: callers may arm the timer while holding the buffer lock. The worker never
// holds its own state lock while running the callback, so the callback may take the
// buffer lock and re-arm.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::core::clock::Clock;
use crate::core::error::{Error, ErrorKind};

/// Outcome of one timer callback, reported to an [`ExpiryListener`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExpiryEvent {
    /// The buffer sat idle for at least the TTL and was cleared.
    Cleared { discarded: usize, idle: Duration },
    /// A write landed since the timer was armed; it fires again at `deadline`.
    Rescheduled { deadline: Duration },
}

/// Observer of timer callbacks. Runs on the timer thread with the buffer lock held, so
/// implementations must not block.
pub trait ExpiryListener: Send + Sync {
    fn on_expiry(&self, event: &ExpiryEvent);
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Duration>,
    cancelled: bool,
}

/// Shared arming handle; the device keeps one so writes can push the deadline out.
#[derive(Debug, Default)]
pub(crate) struct TimerControl {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl TimerControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the next firing time, replacing any earlier one. Returns false once cancelled.
    pub(crate) fn arm(&self, deadline: Duration) -> bool {
        let mut state = self.lock_state();
        if state.cancelled {
            return false;
        }
        state.deadline = Some(deadline);
        self.changed.notify_all();
        true
    }

    pub(crate) fn deadline(&self) -> Option<Duration> {
        self.lock_state().deadline
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled
    }

    fn lock_state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Blocks until the deadline passes (true) or the timer is cancelled (false).
    // Consumes the deadline, so the timer is dormant until re-armed.
    fn wait_due(&self, clock: &dyn Clock) -> bool {
        let mut state = self.lock_state();
        loop {
            if state.cancelled {
                return false;
            }
            match state.deadline {
                Some(deadline) => {
                    let now = clock.now();
                    if now >= deadline {
                        state.deadline = None;
                        return true;
                    }
                    let slice = clock.wait_slice(deadline - now);
                    let (next, _) = self
                        .changed
                        .wait_timeout(state, slice)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = next;
                }
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

pub(crate) struct ExpiryTimer {
    control: Arc<TimerControl>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ExpiryTimer {
    /// Starts the worker. `callback` runs on the worker thread each time the deadline
    /// passes; it receives the control so it can re-arm.
    pub(crate) fn spawn<F>(
        name: &str,
        control: Arc<TimerControl>,
        clock: Arc<dyn Clock>,
        mut callback: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(&TimerControl) + Send + 'static,
    {
        let worker_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while worker_control.wait_due(clock.as_ref()) {
                    callback(&worker_control);
                }
                tracing::debug!("expiry timer worker exiting");
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn expiry timer thread")
                    .with_source(err)
            })?;
        let worker_id = handle.thread().id();
        Ok(Self {
            control,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Cancels the timer and blocks until the worker, including any in-flight callback,
    /// has finished. Idempotent. Called from the callback itself it cannot join, so it
    /// only marks the timer cancelled.
    pub(crate) fn cancel_sync(&self) {
        {
            let mut state = self.control.lock_state();
            state.cancelled = true;
            state.deadline = None;
            self.control.changed.notify_all();
        }
        if thread::current().id() == self.worker_id {
            tracing::warn!("expiry timer cancelled from its own callback; not joining");
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("expiry timer worker panicked");
            }
        }
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.cancel_sync();
    }
}
