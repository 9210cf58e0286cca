//! Drop-in replacement for `codesign` that serves precomputed page digests.
//!
//! The launcher re-executes itself with the interposing library inserted and
//! then calls into that library, which loads and runs the real codesign.
#![cfg_attr(target_os = "macos", no_main)]
#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

#[cfg(target_os = "macos")]
mod launcher {
    use libc::{c_char, c_int};
    use log::{debug, error};
    use simple_error::{bail, try_with};
    use std::env;
    use std::ffi::CStr;
    use std::mem;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use autopen::config::{Config, INJECTED_ENV};
    use autopen::result::Result;

    const MAIN_SYMBOL: &[u8] = b"autopen_main\0";

    type PreloadMain = unsafe extern "C" fn(
        argc: c_int,
        argv: *mut *const c_char,
        envp: *const *const c_char,
        apple: *const *const c_char,
    ) -> c_int;

    /// Replaces the current process with itself, this time with the
    /// interposing library inserted. Only returns on failure.
    fn reexec_with_preload(config: &Config) -> Result<()> {
        if env::var_os(INJECTED_ENV).is_some() {
            bail!(
                "{} is set but autopen_main is missing, was the preload library inserted?",
                INJECTED_ENV
            );
        }
        let preload = config.preload_path()?;
        if !preload.exists() {
            bail!("preload library {} not found", preload.display());
        }
        let exe = try_with!(env::current_exe(), "cannot locate current executable");
        debug!("re-executing {} with {}", exe.display(), preload.display());

        let err = Command::new(&exe)
            .args(env::args_os().skip(1))
            .env("DYLD_INSERT_LIBRARIES", &preload)
            .env(INJECTED_ENV, "1")
            .exec();
        bail!("cannot execute {}: {}", exe.display(), err)
    }

    fn preload_main() -> Option<PreloadMain> {
        let name = unsafe { CStr::from_bytes_with_nul_unchecked(MAIN_SYMBOL) };
        let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if sym.is_null() {
            return None;
        }
        Some(unsafe { mem::transmute::<*mut libc::c_void, PreloadMain>(sym) })
    }

    #[no_mangle]
    pub extern "C" fn main(
        argc: c_int,
        argv: *mut *const c_char,
        envp: *const *const c_char,
        apple: *const *const c_char,
    ) -> c_int {
        let config = match Config::from_env() {
            Ok(c) => c,
            Err(e) => {
                let _ = env_logger::try_init();
                error!("{}", e);
                return 1;
            }
        };
        config.setup_logging();

        match preload_main() {
            Some(run) => unsafe { run(argc, argv, envp, apple) },
            None => {
                if let Err(e) = reexec_with_preload(&config) {
                    error!("{}", e);
                }
                1
            }
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn main() {
    env_logger::init();
    log::error!("autopen only runs on macOS");
    std::process::exit(1);
}
