// Core modules: buffer store, interruptible lock, expiry timer, device and sessions.
pub(crate) mod access;
pub mod clock;
pub mod device;
pub mod error;
pub mod expiry;
pub mod lock;
pub mod session;
pub mod store;
