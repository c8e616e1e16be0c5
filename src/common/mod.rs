//! Shared utilities used by both the broker core and the server binary.

pub mod logger;
pub mod time;
