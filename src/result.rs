use simple_error::SimpleError;
use std::result;
use thiserror::Error;

pub type Result<T> = result::Result<T, SimpleError>;

/// Contract violations observed while substituting digests.
///
/// Each of these means the host stopped behaving the way the substitution
/// assumes, and continuing would hand it digests that do not belong to the
/// bytes it thinks it hashed. They are never recovered from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Fatal {
    #[error("digest update of {got} bytes, expected {expected}")]
    UnexpectedUpdateLength { expected: usize, got: usize },
    #[error("cannot advance digests past end of binary ({count} blocks)")]
    CursorOverrun { count: usize },
    #[error("a substitution session is already active on fd {fd}")]
    SessionAlreadyActive { fd: i32 },
    #[error("digests were already computed for {path}, refusing to compute twice")]
    DigestsAlreadyComputed { path: String },
    #[error("cannot precompute digests: {0}")]
    Precompute(String),
}

/// Log a violation and take the process down.
pub fn abort_on(fatal: Fatal) -> ! {
    log::error!("{}", fatal);
    std::process::abort()
}
