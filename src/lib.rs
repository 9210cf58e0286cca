#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod bundle;
pub mod config;
pub mod digest;
pub mod invocation;
#[cfg(target_os = "macos")]
pub mod launch;
pub mod macho;
pub mod mapping;
pub mod result;
pub mod session;
pub mod state;
