//! Shared helpers: host bootstrap and retry policies.

pub mod bootstrap;
pub mod retry;
