//! Interposing library inserted into the launcher process.
//!
//! dyld applies the `__DATA,__interpose` table of every inserted image to all
//! other images, so from load time on each open/close/read/fstat and page
//! digest call in the process, codesign's own and those made inside system
//! libraries alike, is routed through [`hooks`].
#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

#[cfg(target_os = "macos")]
mod hooks;
#[cfg(target_os = "macos")]
mod interpose;

#[cfg(target_os = "macos")]
pub use hooks::autopen_main;
