//! SimApprover core, as a library crate for integration testing.
//!
//! Re-exports the modules exercised by the tests in `tests/`; the binary in
//! `main.rs` is a thin terminal frontend over these.

pub mod api;
pub mod backlog;
pub mod config;
pub mod proto;
pub mod session;
pub mod uplink;
