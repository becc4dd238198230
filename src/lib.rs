//! Purpose: Library crate for a concurrent, TTL-bounded byte buffer used by the `ttlbuf` CLI and tests.
//! Exports: `api` (stable surface), `core` (store, lock, timer, device, sessions), `notice`.
//! Role: Everything the binary does goes through `api`; `core` stays an implementation detail.
//! Invariants: One lock guards each buffer; the expiry timer is cancelled before a device is freed.
pub mod api;
pub mod core;
pub mod notice;
