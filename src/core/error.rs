// Structured error kinds for buffer operations, with POSIX errno and exit-code mappings.
use std::error::Error as StdError;
use std::fmt;
use std::io;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Interrupted,
    NoSpace,
    InvalidArgument,
    Busy,
    NoDevice,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    offset: Option<i64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn errno(&self) -> i32 {
        to_errno(self.kind)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::Interrupted => io::ErrorKind::Interrupted,
            ErrorKind::NoSpace => io::ErrorKind::StorageFull,
            ErrorKind::InvalidArgument | ErrorKind::Usage => io::ErrorKind::InvalidInput,
            ErrorKind::Busy => io::ErrorKind::ResourceBusy,
            ErrorKind::NoDevice => io::ErrorKind::NotConnected,
            ErrorKind::Internal | ErrorKind::Io => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Interrupted => 3,
        ErrorKind::NoSpace => 4,
        ErrorKind::InvalidArgument => 5,
        ErrorKind::Busy => 6,
        ErrorKind::NoDevice => 7,
        ErrorKind::Io => 8,
    }
}

pub fn to_errno(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Interrupted => libc::EINTR,
        ErrorKind::NoSpace => libc::ENOSPC,
        ErrorKind::InvalidArgument | ErrorKind::Usage => libc::EINVAL,
        ErrorKind::Busy => libc::EBUSY,
        ErrorKind::NoDevice => libc::ENODEV,
        ErrorKind::Internal | ErrorKind::Io => libc::EIO,
    }
}
