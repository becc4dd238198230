// Per-open handle: a private cursor plus a weak link back to the device.
use std::fmt;
use std::io;
use std::sync::Weak;

use crate::core::access::{self, Caller};
use crate::core::device::DeviceShared;
use crate::core::error::{Error, ErrorKind};
use crate::core::lock::InterruptFlag;
use crate::core::store::Whence;

/// One caller's view of a device.
///
/// The cursor is private to the session and only moves by the bytes a call actually
/// transferred, or by a successful seek. Any number of sessions can be used from
/// different threads at once; a single session is driven by one thread at a time.
pub struct Session {
    id: u64,
    cursor: usize,
    device: Weak<DeviceShared>,
    interrupt: InterruptFlag,
}

impl Session {
    pub(crate) fn new(id: u64, device: Weak<DeviceShared>) -> Self {
        Self {
            id,
            cursor: 0,
            device,
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Flag that aborts this session's contended lock waits when raised.
    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Replaces the interrupt flag, e.g. with one wired to SIGINT.
    pub fn set_interrupt(&mut self, interrupt: InterruptFlag) {
        self.interrupt = interrupt;
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.set_interrupt(interrupt);
        self
    }

    /// Up to `max_len` valid bytes from the cursor. Empty at end of data.
    pub fn read(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        self.with_device(|shared, caller| access::read(shared, caller, max_len))
    }

    /// Like [`Session::read`], copying into `buf`.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.with_device(|shared, caller| access::read_into(shared, caller, buf))
    }

    /// Writes as much of `data` as fits before capacity. `NoSpace` when the cursor is
    /// already at capacity or `data` is empty.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.with_device(|shared, caller| access::write(shared, caller, data))
    }

    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<usize, Error> {
        self.with_device(|shared, caller| access::seek(shared, caller, whence, offset))
    }

    /// Discards all valid data. The cursor is left where it was.
    pub fn clear(&mut self) -> Result<usize, Error> {
        self.with_device(access::clear)
    }

    pub fn close(self) {}

    fn with_device<R>(
        &mut self,
        op: impl FnOnce(&DeviceShared, Caller<'_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let shared = self.device.upgrade().ok_or_else(|| {
            Error::new(ErrorKind::NoDevice)
                .with_message("device has been shut down")
                .with_hint("Open a session on a live device.")
        })?;
        let caller = Caller {
            session_id: self.id,
            cursor: &mut self.cursor,
            interrupt: &self.interrupt,
        };
        op(&shared, caller)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(shared) = self.device.upgrade() {
            shared.release_session(self.id);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("attached", &(self.device.strong_count() > 0))
            .finish()
    }
}

impl io::Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf)?)
    }
}

impl io::Write for Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Session::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for Session {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (whence, offset) = match pos {
            io::SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset).map_err(|_| {
                    Error::new(ErrorKind::InvalidArgument)
                        .with_message("seek outside buffer")
                })?;
                (Whence::Set, offset)
            }
            io::SeekFrom::Current(offset) => (Whence::Cur, offset),
            io::SeekFrom::End(offset) => (Whence::End, offset),
        };
        let target = Session::seek(self, whence, offset)?;
        Ok(target as u64)
    }
}
