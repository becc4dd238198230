// Fixed-capacity byte region with a logical length and last-activity stamp.
// Every method assumes the caller holds the device lock.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl FromStr for Whence {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "set" => Ok(Whence::Set),
            "cur" => Ok(Whence::Cur),
            "end" => Ok(Whence::End),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("invalid whence")
                .with_hint("Use set|cur|end.")),
        }
    }
}

impl fmt::Display for Whence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Whence::Set => write!(f, "set"),
            Whence::Cur => write!(f, "cur"),
            Whence::End => write!(f, "end"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreState {
    Empty,
    Active,
}

impl StoreState {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreState::Empty => "empty",
            StoreState::Active => "active",
        }
    }
}

pub(crate) struct BufferStore {
    bytes: Box<[u8]>,
    length: usize,
    last_activity: Duration,
    zero_on_clear: bool,
}

impl BufferStore {
    pub(crate) fn new(capacity: usize, zero_on_clear: bool, now: Duration) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            length: 0,
            last_activity: now,
            zero_on_clear,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }

    pub(crate) fn last_activity(&self) -> Duration {
        self.last_activity
    }

    pub(crate) fn state(&self) -> StoreState {
        if self.length == 0 {
            StoreState::Empty
        } else {
            StoreState::Active
        }
    }

    /// Copies as much of `data` as fits at `offset`. Fails with `NoSpace`, leaving the store
    /// untouched, when nothing can be copied: `offset` at or past capacity, or empty `data`.
    ///
    /// A write that starts past the current length zero-fills the gap, so bytes left over
    /// from before a clear never become readable.
    pub(crate) fn write_at(
        &mut self,
        offset: usize,
        data: &[u8],
        now: Duration,
    ) -> Result<usize, Error> {
        let capacity = self.capacity();
        if offset >= capacity {
            return Err(Error::new(ErrorKind::NoSpace)
                .with_message("buffer full or offset at capacity")
                .with_offset(offset as i64));
        }
        let n = (capacity - offset).min(data.len());
        if n == 0 {
            return Err(Error::new(ErrorKind::NoSpace)
                .with_message("nothing to write")
                .with_offset(offset as i64));
        }
        if offset > self.length {
            self.bytes[self.length..offset].fill(0);
        }
        self.bytes[offset..offset + n].copy_from_slice(&data[..n]);
        self.length = self.length.max(offset + n);
        self.last_activity = now;
        Ok(n)
    }

    /// Valid bytes from `offset`, at most `max_len`. Empty at or past the data length.
    pub(crate) fn read_at(&self, offset: usize, max_len: usize) -> &[u8] {
        if offset >= self.length {
            return &[];
        }
        let n = (self.length - offset).min(max_len);
        &self.bytes[offset..offset + n]
    }

    /// Drops all valid data and returns how many bytes were discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.length;
        if self.zero_on_clear {
            self.bytes[..discarded].fill(0);
        }
        self.length = 0;
        discarded
    }

    pub(crate) fn validate_seek(&self, raw: i64) -> Result<usize, Error> {
        match usize::try_from(raw) {
            Ok(offset) if offset <= self.capacity() => Ok(offset),
            _ => Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("seek outside buffer")
                .with_offset(raw)),
        }
    }

    /// Raw target offset for a seek. `End` is relative to the data length, not capacity.
    pub(crate) fn resolve_whence(
        &self,
        whence: Whence,
        rel: i64,
        cursor: usize,
    ) -> Result<i64, Error> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => cursor,
            Whence::End => self.length,
        };
        i64::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(rel))
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidArgument).with_message("seek offset overflows")
            })
    }

    #[cfg(test)]
    pub(crate) fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferStore, StoreState, Whence};
    use crate::core::error::ErrorKind;
    use std::time::Duration;

    fn store(capacity: usize) -> BufferStore {
        BufferStore::new(capacity, false, Duration::ZERO)
    }

    #[test]
    fn write_extends_length_to_high_water_mark() {
        let mut store = store(16);
        let now = Duration::from_millis(5);
        assert_eq!(store.write_at(0, b"HELLO", now).expect("write"), 5);
        assert_eq!(store.len(), 5);
        assert_eq!(store.last_activity(), now);

        // Overwriting inside the valid region keeps the high-water mark.
        assert_eq!(store.write_at(0, b"hi", now).expect("write"), 2);
        assert_eq!(store.len(), 5);
        assert_eq!(store.read_at(0, 16), b"hiLLO");

        assert_eq!(store.write_at(10, b"XY", now).expect("write"), 2);
        assert_eq!(store.len(), 12);
        assert_eq!(store.state(), StoreState::Active);
    }

    #[test]
    fn write_is_clipped_at_capacity() {
        let mut store = store(8);
        assert_eq!(store.write_at(6, b"abcdef", Duration::ZERO).expect("write"), 2);
        assert_eq!(store.len(), 8);
        assert_eq!(store.read_at(6, 10), b"ab");
    }

    #[test]
    fn write_at_capacity_is_no_space_and_atomic() {
        let mut store = store(4);
        store.write_at(0, b"abcd", Duration::from_millis(1)).expect("fill");

        let err = store
            .write_at(4, b"z", Duration::from_millis(9))
            .expect_err("no space");
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert_eq!(store.len(), 4);
        assert_eq!(store.read_at(0, 4), b"abcd");
        assert_eq!(store.last_activity(), Duration::from_millis(1));
    }

    #[test]
    fn empty_write_is_no_space_and_changes_nothing() {
        let mut store = store(4);
        let err = store
            .write_at(2, b"", Duration::from_millis(3))
            .expect_err("empty write");
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert_eq!(err.offset(), Some(2));
        assert_eq!(store.len(), 0);
        assert_eq!(store.last_activity(), Duration::ZERO);
        assert_eq!(store.state(), StoreState::Empty);
    }

    #[test]
    fn read_never_exposes_stale_bytes() {
        let mut store = store(8);
        store.write_at(0, b"abcdef", Duration::ZERO).expect("write");
        store.clear();
        store.write_at(0, b"xy", Duration::ZERO).expect("write");

        assert_eq!(store.read_at(0, 8), b"xy");
        assert!(store.read_at(2, 8).is_empty());
        assert!(store.read_at(7, 8).is_empty());
        assert_eq!(store.read_at(1, 0), b"");
    }

    #[test]
    fn write_past_length_hides_pre_clear_bytes() {
        let mut store = store(8);
        store.write_at(0, b"secret", Duration::ZERO).expect("write");
        store.clear();
        store.write_at(4, b"xy", Duration::ZERO).expect("write");
        assert_eq!(store.len(), 6);
        assert_eq!(store.read_at(0, 8), b"\0\0\0\0xy");
    }

    #[test]
    fn clear_reports_discarded_and_optionally_zeroes() {
        let mut plain = store(4);
        plain.write_at(0, b"abc", Duration::ZERO).expect("write");
        assert_eq!(plain.clear(), 3);
        assert_eq!(plain.len(), 0);
        assert_eq!(&plain.raw_bytes()[..3], b"abc");

        let mut zeroing = BufferStore::new(4, true, Duration::ZERO);
        zeroing.write_at(0, b"abc", Duration::ZERO).expect("write");
        assert_eq!(zeroing.clear(), 3);
        assert_eq!(zeroing.raw_bytes(), &[0u8; 4]);
    }

    #[test]
    fn seek_end_is_relative_to_data_length() {
        let mut store = store(16);
        store.write_at(0, b"HELLO", Duration::ZERO).expect("write");
        assert_eq!(store.resolve_whence(Whence::End, 0, 0).expect("resolve"), 5);
        assert_eq!(store.resolve_whence(Whence::End, -2, 0).expect("resolve"), 3);
        assert_eq!(store.resolve_whence(Whence::Cur, 4, 3).expect("resolve"), 7);
        assert_eq!(store.resolve_whence(Whence::Set, 9, 3).expect("resolve"), 9);
    }

    #[test]
    fn seek_bounds_include_capacity() {
        let store = store(16);
        assert_eq!(store.validate_seek(0).expect("zero"), 0);
        assert_eq!(store.validate_seek(16).expect("capacity"), 16);
        assert_eq!(
            store.validate_seek(17).expect_err("past capacity").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            store.validate_seek(-1).expect_err("negative").kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn seek_overflow_is_invalid() {
        let store = store(16);
        let err = store
            .resolve_whence(Whence::Cur, i64::MAX, 1)
            .expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn whence_parses_case_insensitively() {
        assert_eq!("SET".parse::<Whence>().expect("set"), Whence::Set);
        assert_eq!("cur".parse::<Whence>().expect("cur"), Whence::Cur);
        assert_eq!(" End ".parse::<Whence>().expect("end"), Whence::End);
        assert_eq!(
            "middle".parse::<Whence>().expect_err("bad").kind(),
            ErrorKind::Usage
        );
    }
}
