// Monotonic time sources: the system clock and a manually advanced clock for simulated time.
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

// Real-time slice the timer blocks for between reads of a manual clock.
const MANUAL_POLL: Duration = Duration::from_millis(1);

/// Time source shared by the store (activity stamps) and the expiry timer.
///
/// Timestamps are offsets from the clock's own origin; only differences are meaningful.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;

    /// How long (in real time) a waiter may block before re-reading `now`, given the
    /// remaining time to its deadline as measured by this clock.
    fn wait_slice(&self, remaining: Duration) -> Duration {
        remaining
    }
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) -> Duration {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.saturating_add(by);
        *now
    }

    /// Moves the clock to `to`; never moves it backwards.
    pub fn set(&self, to: Duration) -> Duration {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if to > *now {
            *now = to;
        }
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_slice(&self, _remaining: Duration) -> Duration {
        MANUAL_POLL
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, SystemClock};
    use std::time::Duration;

    #[test]
    fn manual_clock_moves_only_forward() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Duration::from_millis(250));
        clock.set(Duration::from_millis(100));
        assert_eq!(clock.now(), Duration::from_millis(250));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn manual_clock_polls_in_short_real_slices() {
        let clock = ManualClock::new();
        assert!(clock.wait_slice(Duration::from_secs(3600)) <= Duration::from_millis(1));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
        assert_eq!(clock.wait_slice(Duration::from_millis(7)), Duration::from_millis(7));
    }
}
