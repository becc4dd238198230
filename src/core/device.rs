// Device: owner of one buffer store, its lock, its expiry timer, and open-policy bookkeeping.
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{Error, ErrorKind};
use crate::core::expiry::{ExpiryEvent, ExpiryListener, ExpiryTimer, TimerControl};
use crate::core::lock::InterruptibleMutex;
use crate::core::session::Session;
use crate::core::store::{BufferStore, StoreState};

/// Whether more than one session may be open at a time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OpenPolicy {
    /// Any number of sessions share the buffer; the lock alone keeps it consistent.
    #[default]
    Shared,
    /// One session at a time; further opens fail with `Busy` until it closes.
    Exclusive,
}

impl FromStr for OpenPolicy {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "shared" => Ok(OpenPolicy::Shared),
            "exclusive" => Ok(OpenPolicy::Exclusive),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("invalid open policy")
                .with_hint("Use shared|exclusive.")),
        }
    }
}

impl fmt::Display for OpenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenPolicy::Shared => write!(f, "shared"),
            OpenPolicy::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceOptions {
    pub capacity: usize,
    pub ttl: Duration,
    pub open_policy: OpenPolicy,
    pub zero_on_clear: bool,
}

impl DeviceOptions {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            open_policy: OpenPolicy::Shared,
            zero_on_clear: false,
        }
    }

    pub fn with_open_policy(mut self, open_policy: OpenPolicy) -> Self {
        self.open_policy = open_policy;
        self
    }

    pub fn with_zero_on_clear(mut self, zero_on_clear: bool) -> Self {
        self.zero_on_clear = zero_on_clear;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.capacity == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("capacity must be positive")
                .with_hint("Use a capacity of at least 1 byte."));
        }
        if i64::try_from(self.capacity).is_err() {
            return Err(Error::new(ErrorKind::Usage).with_message("capacity is too large"));
        }
        if self.ttl.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("ttl must be positive")
                .with_hint("Use a duration like 500ms or 10s."));
        }
        Ok(())
    }
}

/// Read-only view of the store taken under the lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreSnapshot {
    pub capacity: usize,
    pub length: usize,
    pub state: StoreState,
    pub idle: Duration,
    pub deadline: Option<Duration>,
    pub open_sessions: usize,
    pub data: Vec<u8>,
}

pub(crate) struct DeviceShared {
    pub(crate) options: DeviceOptions,
    pub(crate) store: InterruptibleMutex<BufferStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timer: Arc<TimerControl>,
    pub(crate) listener: Option<Arc<dyn ExpiryListener>>,
    open_sessions: AtomicUsize,
    next_session_id: AtomicU64,
}

impl DeviceShared {
    pub(crate) fn release_session(&self, session_id: u64) {
        let previous = self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(session = session_id, open = previous.saturating_sub(1), "session closed");
    }

    // Timer callback body. Staleness is judged only after the lock is held so a write
    // that raced the wakeup is always seen.
    fn expire(&self, control: &TimerControl) {
        let mut store = self.store.lock();
        let now = self.clock.now();
        let idle = now.saturating_sub(store.last_activity());
        let event = if idle >= self.options.ttl {
            let discarded = store.clear();
            if discarded > 0 {
                tracing::info!(discarded, idle_ms = idle.as_millis() as u64, "buffer cleared after idle ttl");
            }
            ExpiryEvent::Cleared { discarded, idle }
        } else {
            let deadline = store.last_activity().saturating_add(self.options.ttl);
            control.arm(deadline);
            tracing::trace!(deadline_ms = deadline.as_millis() as u64, "expiry rescheduled");
            ExpiryEvent::Rescheduled { deadline }
        };
        if let Some(listener) = &self.listener {
            listener.on_expiry(&event);
        }
    }
}

/// Owner of one TTL-bounded buffer.
///
/// Sessions hold only weak references; dropping (or shutting down) the device cancels the
/// expiry timer synchronously and then releases the store.
pub struct Device {
    shared: Arc<DeviceShared>,
    timer: ExpiryTimer,
}

impl Device {
    pub fn create(options: DeviceOptions) -> Result<Self, Error> {
        Self::create_with(options, Arc::new(SystemClock::new()), None)
    }

    pub fn create_with(
        options: DeviceOptions,
        clock: Arc<dyn Clock>,
        listener: Option<Arc<dyn ExpiryListener>>,
    ) -> Result<Self, Error> {
        options.validate()?;

        let now = clock.now();
        let control = Arc::new(TimerControl::new());
        let shared = Arc::new(DeviceShared {
            options,
            store: InterruptibleMutex::new(BufferStore::new(
                options.capacity,
                options.zero_on_clear,
                now,
            )),
            clock: Arc::clone(&clock),
            timer: Arc::clone(&control),
            listener,
            open_sessions: AtomicUsize::new(0),
            next_session_id: AtomicU64::new(1),
        });

        let weak: Weak<DeviceShared> = Arc::downgrade(&shared);
        let timer = ExpiryTimer::spawn("ttlbuf-expiry", Arc::clone(&control), clock, move |ctl| {
            if let Some(shared) = weak.upgrade() {
                shared.expire(ctl);
            }
        })?;
        control.arm(now.saturating_add(options.ttl));

        tracing::debug!(
            capacity = options.capacity,
            ttl_ms = options.ttl.as_millis() as u64,
            policy = %options.open_policy,
            "device created"
        );
        Ok(Self { shared, timer })
    }

    pub fn options(&self) -> DeviceOptions {
        self.shared.options
    }

    pub fn open(&self) -> Result<Session, Error> {
        let shared = &self.shared;
        match shared.options.open_policy {
            OpenPolicy::Shared => {
                shared.open_sessions.fetch_add(1, Ordering::SeqCst);
            }
            OpenPolicy::Exclusive => {
                shared
                    .open_sessions
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .map_err(|_| {
                        Error::new(ErrorKind::Busy)
                            .with_message("device already open")
                            .with_hint("Close the other session first, or use the shared policy.")
                    })?;
            }
        }
        let id = shared.next_session_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session = id, "session opened");
        Ok(Session::new(id, Arc::downgrade(shared)))
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let store = self.shared.store.lock();
        let now = self.shared.clock.now();
        StoreSnapshot {
            capacity: store.capacity(),
            length: store.len(),
            state: store.state(),
            idle: now.saturating_sub(store.last_activity()),
            deadline: self.shared.timer.deadline(),
            open_sessions: self.open_sessions(),
            data: store.read_at(0, store.len()).to_vec(),
        }
    }

    /// Cancels the expiry timer (waiting out any in-flight callback) and releases the
    /// store. Sessions still open afterwards fail with `NoDevice`.
    pub fn shutdown(self) {
        drop(self);
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &DeviceShared {
        &self.shared
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.timer.cancel_sync();
        tracing::debug!(open = self.open_sessions(), "device shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::{Device, DeviceOptions, OpenPolicy};
    use crate::core::clock::ManualClock;
    use crate::core::error::ErrorKind;
    use crate::core::expiry::{ExpiryEvent, ExpiryListener};
    use crate::core::store::StoreState;
    use std::sync::{Arc, mpsc};
    use std::time::Duration;

    struct Recorder(mpsc::Sender<ExpiryEvent>);

    impl ExpiryListener for Recorder {
        fn on_expiry(&self, event: &ExpiryEvent) {
            let _ = self.0.send(*event);
        }
    }

    #[test]
    fn options_are_validated() {
        let err = Device::create(DeviceOptions::new(0, Duration::from_secs(1)))
            .err()
            .expect("zero capacity");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = Device::create(DeviceOptions::new(8, Duration::ZERO))
            .err()
            .expect("zero ttl");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn exclusive_policy_rejects_second_open() {
        let options =
            DeviceOptions::new(8, Duration::from_secs(5)).with_open_policy(OpenPolicy::Exclusive);
        let device = Device::create(options).expect("device");

        let first = device.open().expect("first open");
        let err = device.open().err().expect("second open");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(device.open_sessions(), 1);

        first.close();
        assert_eq!(device.open_sessions(), 0);
        let again = device.open().expect("open after close");
        drop(again);
        assert_eq!(device.open_sessions(), 0);
    }

    #[test]
    fn shared_policy_allows_many_sessions() {
        let device = Device::create(DeviceOptions::new(8, Duration::from_secs(5))).expect("device");
        let sessions: Vec<_> = (0..4).map(|_| device.open().expect("open")).collect();
        assert_eq!(device.open_sessions(), 4);
        let ids: Vec<_> = sessions.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        drop(sessions);
        assert_eq!(device.open_sessions(), 0);
    }

    #[test]
    fn snapshot_reports_state_and_timer() {
        let clock = Arc::new(ManualClock::new());
        let device = Device::create_with(
            DeviceOptions::new(16, Duration::from_millis(1000)),
            clock.clone(),
            None,
        )
        .expect("device");
        let snapshot = device.snapshot();
        assert_eq!(snapshot.capacity, 16);
        assert_eq!(snapshot.length, 0);
        assert_eq!(snapshot.state, StoreState::Empty);
        assert_eq!(snapshot.deadline, Some(Duration::from_millis(1000)));

        let mut session = device.open().expect("open");
        clock.advance(Duration::from_millis(300));
        session.write(b"abc").expect("write");
        clock.advance(Duration::from_millis(200));

        let snapshot = device.snapshot();
        assert_eq!(snapshot.length, 3);
        assert_eq!(snapshot.state, StoreState::Active);
        assert_eq!(snapshot.idle, Duration::from_millis(200));
        assert_eq!(snapshot.deadline, Some(Duration::from_millis(1300)));
        assert_eq!(snapshot.open_sessions, 1);
        assert_eq!(snapshot.data, b"abc");
    }

    #[test]
    fn stale_wakeup_reschedules_from_last_activity() {
        let clock = Arc::new(ManualClock::new());
        let (tx, rx) = mpsc::channel();
        let listener: Arc<dyn ExpiryListener> = Arc::new(Recorder(tx));
        let device = Device::create_with(
            DeviceOptions::new(8, Duration::from_millis(100)),
            clock.clone(),
            Some(listener),
        )
        .expect("device");
        let mut session = device.open().expect("open");
        clock.advance(Duration::from_millis(40));
        session.write(b"ab").expect("write");

        // A wakeup that lost the race with the write must not clear.
        let shared = device.shared();
        shared.expire(&shared.timer);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).expect("event"),
            ExpiryEvent::Rescheduled {
                deadline: Duration::from_millis(140)
            }
        );
        assert_eq!(shared.timer.deadline(), Some(Duration::from_millis(140)));
        assert_eq!(device.snapshot().length, 2);
    }

    #[test]
    fn sessions_outliving_the_device_get_no_device() {
        let device = Device::create(DeviceOptions::new(8, Duration::from_secs(5))).expect("device");
        let mut session = device.open().expect("open");
        device.shutdown();

        let err = session.write(b"x").expect_err("device gone");
        assert_eq!(err.kind(), ErrorKind::NoDevice);
        session.close();
    }

    #[test]
    fn open_policy_round_trips_through_text() {
        assert_eq!("shared".parse::<OpenPolicy>().expect("shared"), OpenPolicy::Shared);
        assert_eq!(
            "exclusive".parse::<OpenPolicy>().expect("exclusive"),
            OpenPolicy::Exclusive
        );
        assert_eq!(OpenPolicy::Exclusive.to_string(), "exclusive");
        assert!("many".parse::<OpenPolicy>().is_err());
    }
}
