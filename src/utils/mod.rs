//! Shared helpers for binaries and network clients.

pub mod bootstrap;
pub mod retry;
