//! Purpose: Define the public Rust API boundary for ttlbuf.
//! Exports: Device/session types, options, clocks, expiry events, and errors.
//! Role: Additive-only surface; hides the store, lock internals, and timer worker.
//! Invariants: This module is the only supported path to the core types.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::device::{Device, DeviceOptions, OpenPolicy, StoreSnapshot};
pub use crate::core::error::{Error, ErrorKind, to_errno};
pub use crate::core::expiry::{ExpiryEvent, ExpiryListener};
pub use crate::core::lock::InterruptFlag;
pub use crate::core::session::Session;
pub use crate::core::store::{StoreState, Whence};
