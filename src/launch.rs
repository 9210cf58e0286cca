//! Hands control to the real signing tool from inside our process.
//!
//! codesign is a platform binary, so the dynamic loader refuses to insert
//! libraries into it. Instead we load it into the process that already carries
//! the interposing library and jump straight to its `LC_MAIN` entry point.

use libc::{c_char, c_int, c_void, RTLD_LAZY, RTLD_LOCAL};
use log::{debug, info, warn};
use simple_error::{bail, require_with, try_with};
use std::ffi::{CStr, CString, OsStr};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::slice;
use std::time::Instant;

use crate::bundle;
use crate::config::Config;
use crate::invocation::Invocation;
use crate::macho;
use crate::result::Result;
use crate::state;

pub type EntryPoint = unsafe extern "C" fn(
    argc: c_int,
    argv: *const *const c_char,
    envp: *const *const c_char,
    apple: *const *const c_char,
) -> c_int;

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_name(image_index: u32) -> *const c_char;
    fn _dyld_get_image_header(image_index: u32) -> *const c_void;
}

struct Library {
    handle: *mut c_void,
}

impl Library {
    fn open(path: &CStr) -> Result<Library> {
        let handle = unsafe { libc::dlopen(path.as_ptr(), RTLD_LOCAL | RTLD_LAZY) };
        if handle.is_null() {
            bail!("dlopen {} failed: {}", path.to_string_lossy(), dlerror());
        }
        Ok(Library { handle })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if unsafe { libc::dlclose(self.handle) } != 0 {
            warn!("dlclose failed: {}", dlerror());
        }
    }
}

fn dlerror() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        return String::from("unknown error");
    }
    unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
}

/// Load address of the image dyld registered under `path`.
fn image_header(path: &CStr) -> Option<*const c_void> {
    let count = unsafe { _dyld_image_count() };
    (0..count).find_map(|i| {
        let name = unsafe { _dyld_get_image_name(i) };
        if name.is_null() || unsafe { CStr::from_ptr(name) } != path {
            return None;
        }
        Some(unsafe { _dyld_get_image_header(i) })
    })
}

unsafe fn args_of<'a>(argc: c_int, argv: *const *const c_char) -> Vec<&'a OsStr> {
    if argv.is_null() || argc <= 0 {
        return Vec::new();
    }
    slice::from_raw_parts(argv, argc as usize)
        .iter()
        .filter(|a| !a.is_null())
        .map(|a| OsStr::from_bytes(CStr::from_ptr(*a).to_bytes()))
        .collect()
}

/// Loads `host` and runs its `main` with our argument vector.
///
/// # Safety
/// `argv`, `envp` and `apple` must be the vectors the process was started
/// with.
pub unsafe fn hand_off(
    host: &Path,
    cpu_type: macho::CpuType,
    argc: c_int,
    argv: *const *const c_char,
    envp: *const *const c_char,
    apple: *const *const c_char,
) -> Result<c_int> {
    let offset = macho::resolve_entry_offset(host, cpu_type)?;
    let c_host = try_with!(
        CString::new(host.as_os_str().as_bytes()),
        "{} contains a nul byte",
        host.display()
    );
    let library = Library::open(&c_host)?;
    let header = require_with!(
        image_header(&c_host),
        "cannot find loaded image of {}",
        host.display()
    );
    let address = header as usize + offset as usize;
    debug!("jumping to {} entry at {:#x}", host.display(), address);

    let entry: EntryPoint = mem::transmute(address);
    let code = entry(argc, argv, envp, apple);
    drop(library);
    Ok(code)
}

/// Everything between the launcher and the host's `main`: validate the
/// command line, find the binary that will be signed, start intercepting
/// and hand off.
///
/// # Safety
/// `argv` must point to `argc` writable entries followed by a null entry, as
/// passed to a C `main`. `envp` and `apple` are forwarded as-is.
pub unsafe fn run(
    argc: c_int,
    argv: *mut *const c_char,
    envp: *const *const c_char,
    apple: *const *const c_char,
) -> Result<c_int> {
    let config = Config::from_env()?;
    config.setup_logging();
    let start = Instant::now();

    let invocation = Invocation::from_args(&args_of(argc, argv))?;
    let bundle_path = invocation.bundle_path()?;
    let target = bundle::target_path(&bundle_path)?;

    let host = try_with!(
        CString::new(config.host_tool.as_os_str().as_bytes()),
        "{} contains a nul byte",
        config.host_tool.display()
    );
    // the host sees itself as argv[0]
    *argv = host.as_ptr();

    state::init(target);
    let res = hand_off(&config.host_tool, config.cpu_type, argc, argv, envp, apple);
    state::teardown();

    info!("signing took {:?}", start.elapsed());
    res
}
