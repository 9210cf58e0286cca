//! Replacements for the interposed functions.
//!
//! Calls made from this image are not interposed by dyld, so calling
//! `libc::read` and friends here reaches the real implementations.

use autopen::digest::{DigestSequence, DIGEST_LEN};
use autopen::result::abort_on;
use autopen::session::{FinalOutcome, ReadOutcome, UpdateOutcome};
use autopen::state;
use libc::{c_char, c_int, c_uint, c_void, mode_t, size_t, ssize_t};
use log::{error, trace, warn};
use nix::unistd::{lseek, Whence};
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

extern "C" {
    // CommonCrypto, part of libSystem
    pub fn CCDigestUpdate(ctx: *mut c_void, data: *const c_void, len: size_t) -> c_int;
    pub fn CCDigestFinal(ctx: *mut c_void, out: *mut u8) -> c_int;
}

fn errno() -> c_int {
    unsafe { *libc::__error() }
}

fn set_errno(value: c_int) {
    unsafe { *libc::__error() = value }
}

/// Called by `autopen_open_bridge` in bridge.c with the mode unpacked.
#[no_mangle]
pub unsafe extern "C" fn autopen_open(path: *const c_char, oflag: c_int, mode: mode_t) -> c_int {
    let fd = libc::open(path, oflag, mode as c_uint);
    if fd < 0 || path.is_null() {
        return fd;
    }
    let saved = errno();
    let path = Path::new(OsStr::from_bytes(CStr::from_ptr(path).to_bytes()));
    state::with(|s| s.on_open(fd, path));
    trace!("open({}) = {}", path.display(), fd);
    set_errno(saved);
    fd
}

#[no_mangle]
pub unsafe extern "C" fn autopen_close(fd: c_int) -> c_int {
    state::with(|s| s.on_close(fd));
    libc::close(fd)
}

#[no_mangle]
pub unsafe extern "C" fn autopen_fstat(fd: c_int, buf: *mut libc::stat) -> c_int {
    if state::with(|s| s.skip_stat()).unwrap_or(false) {
        return 0;
    }
    libc::fstat(fd, buf)
}

#[no_mangle]
pub unsafe extern "C" fn autopen_read(fd: c_int, buf: *mut c_void, nbyte: size_t) -> ssize_t {
    match state::with(|s| s.on_read(fd, nbyte, DigestSequence::compute)) {
        None | Some(Ok(ReadOutcome::Real)) => {}
        Some(Ok(ReadOutcome::Synthetic(n))) => {
            trace!("read({}, {}) = {} (synthetic)", fd, nbyte, n);
            return n as ssize_t;
        }
        Some(Ok(ReadOutcome::RestoreAndReal { fd: ended, position })) => {
            if let Err(e) = lseek(ended, position as libc::off_t, Whence::SeekSet) {
                warn!("cannot restore fd {} to offset {}: {}", ended, position, e);
            }
        }
        Some(Err(fatal)) => abort_on(fatal),
    }
    libc::read(fd, buf, nbyte)
}

#[no_mangle]
pub unsafe extern "C" fn autopen_digest_update(
    ctx: *mut c_void,
    data: *const c_void,
    len: size_t,
) -> c_int {
    match state::with(|s| s.on_digest_update(len)) {
        Some(Ok(UpdateOutcome::Skipped)) => 0,
        Some(Err(fatal)) => abort_on(fatal),
        None | Some(Ok(UpdateOutcome::Real)) => CCDigestUpdate(ctx, data, len),
    }
}

#[no_mangle]
pub unsafe extern "C" fn autopen_digest_final(ctx: *mut c_void, out: *mut u8) -> c_int {
    match state::with(|s| s.on_digest_final()) {
        Some(Ok(FinalOutcome::Substituted(digest))) => {
            ptr::copy_nonoverlapping(digest.as_ptr(), out, DIGEST_LEN);
            0
        }
        Some(Err(fatal)) => abort_on(fatal),
        None | Some(Ok(FinalOutcome::Real)) => CCDigestFinal(ctx, out),
    }
}

/// Entry point the launcher looks up once this library is inserted.
///
/// # Safety
/// Must be called with the arguments the process' C `main` received.
#[no_mangle]
pub unsafe extern "C" fn autopen_main(
    argc: c_int,
    argv: *mut *const c_char,
    envp: *const *const c_char,
    apple: *const *const c_char,
) -> c_int {
    match autopen::launch::run(argc, argv, envp, apple) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}
