// Interruptible mutual exclusion: a condvar gate whose waiters can be aborted by an interrupt flag.
//
// The gate is the lock. The inner `Mutex<T>` only hands out safe `&mut T` access and is never
// contended, since a caller reaches it only while holding the gate.
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};

// Upper bound on how long an interrupt can go unnoticed by a blocked waiter.
const INTERRUPT_POLL: Duration = Duration::from_millis(5);

/// Pending-interrupt signal for a caller that may block on the buffer lock.
///
/// Raising the flag aborts the caller's current (or next contended) lock wait. The aborted
/// wait consumes the interrupt, so a retry proceeds normally.
#[derive(Clone, Default)]
pub struct InterruptFlag {
    pending: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pending)
    }

    pub fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

impl fmt::Debug for InterruptFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptFlag")
            .field("pending", &self.is_pending())
            .finish()
    }
}

pub(crate) struct InterruptibleMutex<T> {
    held: Mutex<bool>,
    released: Condvar,
    value: Mutex<T>,
}

impl<T> InterruptibleMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            value: Mutex::new(value),
        }
    }

    /// Blocks until the lock is free. Used by the expiry timer and snapshots, which are
    /// never interrupted.
    pub(crate) fn lock(&self) -> LockGuard<'_, T> {
        let mut held = self.gate();
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
        drop(held);
        self.enter()
    }

    /// Blocks until the lock is free or `interrupt` is raised while waiting.
    ///
    /// An uncontended acquisition never looks at the flag.
    pub(crate) fn lock_interruptible(
        &self,
        interrupt: &InterruptFlag,
    ) -> Result<LockGuard<'_, T>, Error> {
        let mut held = self.gate();
        while *held {
            if interrupt.take() {
                return Err(Error::new(ErrorKind::Interrupted)
                    .with_message("lock wait interrupted")
                    .with_hint("Retry the operation."));
            }
            let (next, _) = self
                .released
                .wait_timeout(held, INTERRUPT_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            held = next;
        }
        *held = true;
        drop(held);
        Ok(self.enter())
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        *self.gate()
    }

    fn gate(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> LockGuard<'_, T> {
        LockGuard {
            value: self.value.lock().unwrap_or_else(PoisonError::into_inner),
            _permit: Permit { owner: self },
        }
    }
}

// Field order matters: the value guard drops before the permit reopens the gate.
pub(crate) struct LockGuard<'a, T> {
    value: MutexGuard<'a, T>,
    _permit: Permit<'a, T>,
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

struct Permit<'a, T> {
    owner: &'a InterruptibleMutex<T>,
}

impl<T> Drop for Permit<'_, T> {
    fn drop(&mut self) {
        *self.owner.gate() = false;
        // Wake everyone: an interrupted waiter may have been the one picked.
        self.owner.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{InterruptFlag, InterruptibleMutex};
    use crate::core::error::ErrorKind;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn uncontended_lock_ignores_pending_interrupt() {
        let lock = InterruptibleMutex::new(0u32);
        let flag = InterruptFlag::new();
        flag.raise();

        let mut guard = lock.lock_interruptible(&flag).expect("uncontended lock");
        *guard += 1;
        drop(guard);

        assert!(flag.is_pending());
        assert!(!lock.is_held());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn interrupt_aborts_contended_wait_and_is_consumed() {
        let lock = Arc::new(InterruptibleMutex::new(Vec::<u8>::new()));
        let flag = InterruptFlag::new();
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.lock();
                guard.push(1);
                held_tx.send(()).expect("send held");
                release_rx.recv().expect("recv release");
            })
        };
        held_rx.recv().expect("holder has lock");

        let waiter = {
            let lock = Arc::clone(&lock);
            let flag = flag.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = lock.lock_interruptible(&flag).map(|guard| guard.len());
                (result.map_err(|err| err.kind()), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.raise();
        let (result, waited) = waiter.join().expect("waiter thread");
        assert_eq!(result, Err(ErrorKind::Interrupted));
        assert!(waited < Duration::from_secs(2));
        assert!(!flag.is_pending());

        release_tx.send(()).expect("release holder");
        holder.join().expect("holder thread");

        let guard = lock.lock_interruptible(&flag).expect("retry after release");
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let lock = Arc::new(InterruptibleMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                let flag = InterruptFlag::new();
                for _ in 0..500 {
                    let mut guard = lock.lock_interruptible(&flag).expect("lock");
                    let current = *guard;
                    thread::yield_now();
                    *guard = current + 1;
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(*lock.lock(), 8 * 500);
    }

    #[test]
    fn panicking_holder_releases_the_gate() {
        let lock = Arc::new(InterruptibleMutex::new(5u8));
        let panicked = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock();
                panic!("holder panics");
            })
            .join()
        };
        assert!(panicked.is_err());
        assert!(!lock.is_held());
        assert_eq!(*lock.lock(), 5);
    }
}
