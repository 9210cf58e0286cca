use simple_error::{bail, require_with, try_with};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::macho::{CpuType, HOST_CPU};
use crate::result::Result;

pub const DEFAULT_HOST_TOOL: &str = "/usr/bin/codesign";
pub const DEFAULT_LOG_FILTER: &str = "warn";
/// File name of the interposing library, expected next to the launcher.
pub const PRELOAD_NAME: &str = "libautopen_preload.dylib";

pub const HOST_TOOL_ENV: &str = "AUTOPEN_HOST_TOOL";
pub const ARCH_ENV: &str = "AUTOPEN_ARCH";
pub const LOG_ENV: &str = "AUTOPEN_LOG";
pub const PRELOAD_ENV: &str = "AUTOPEN_PRELOAD";
/// Set by the launcher on the re-executed process.
pub const INJECTED_ENV: &str = "AUTOPEN_INJECTED";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Signing tool we load and jump into.
    pub host_tool: PathBuf,
    /// Slice of `host_tool` whose entry point we resolve.
    pub cpu_type: CpuType,
    /// env_logger filter string
    pub log_filter: String,
    pub preload: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Config::from_lookup(|key| env::var_os(key))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let host_tool = lookup(HOST_TOOL_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_TOOL));

        let cpu_type = match lookup(ARCH_ENV) {
            None => HOST_CPU,
            Some(name) => {
                let name = require_with!(name.to_str(), "{} is not valid utf-8", ARCH_ENV);
                require_with!(
                    CpuType::from_name(name),
                    "unsupported {} '{}', expected arm64 or x86_64",
                    ARCH_ENV,
                    name
                )
            }
        };

        let log_filter = match lookup(LOG_ENV) {
            None => DEFAULT_LOG_FILTER.to_string(),
            Some(filter) => match filter.into_string() {
                Ok(f) => f,
                Err(_) => bail!("{} is not valid utf-8", LOG_ENV),
            },
        };

        Ok(Config {
            host_tool,
            cpu_type,
            log_filter,
            preload: lookup(PRELOAD_ENV).map(PathBuf::from),
        })
    }

    /// Explicit preload path, or [`PRELOAD_NAME`] next to the running
    /// executable.
    pub fn preload_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.preload {
            return Ok(path.clone());
        }
        let exe = try_with!(env::current_exe(), "cannot locate current executable");
        let dir = require_with!(exe.parent(), "{} has no parent", exe.display());
        Ok(dir.join(PRELOAD_NAME))
    }

    pub fn setup_logging(&self) {
        // the preload library and the launcher each carry their own logger
        let _ = env_logger::Builder::new()
            .parse_filters(&self.log_filter)
            .try_init();
    }
}
