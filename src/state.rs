//! Process-wide interception state.
//!
//! Interposed functions are called by code that cannot pass us any context,
//! so the bookkeeping lives in one process-scoped record. It is created by
//! [`init`] before control is handed to the host, reached only through
//! [`with`], and dropped by [`teardown`]. Until `init` runs every
//! interposed call is forwarded untouched.

use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::digest::{DigestSequence, BLOCK_SIZE};
use crate::result::{self, Fatal};
use crate::session::{FinalOutcome, Phase, ReadOutcome, Session, UpdateOutcome};

/// codesign writes the signed binary to `<binary>.cstemp` and renames it
/// over the original when done.
pub const TEMP_SUFFIX: &str = ".cstemp";

#[derive(Debug)]
pub struct InterceptionState {
    target: PathBuf,
    temp_path: PathBuf,
    /// descriptors opened on `temp_path`
    interesting: HashSet<RawFd>,
    /// every descriptor opened since init; numbers get reused after close
    paths: HashMap<RawFd, PathBuf>,
    phase: Phase,
    precomputed: bool,
}

impl InterceptionState {
    pub fn new(target: PathBuf) -> InterceptionState {
        let mut temp = OsString::from(target.as_os_str());
        temp.push(TEMP_SUFFIX);
        InterceptionState {
            target,
            temp_path: PathBuf::from(temp),
            interesting: HashSet::new(),
            paths: HashMap::new(),
            phase: Phase::Idle,
            precomputed: false,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn is_interesting(&self, fd: RawFd) -> bool {
        self.interesting.contains(&fd)
    }

    pub fn path_of(&self, fd: RawFd) -> Option<&Path> {
        self.paths.get(&fd).map(PathBuf::as_path)
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Records a descriptor returned by a successful `open`.
    pub fn on_open(&mut self, fd: RawFd, path: &Path) {
        if path == self.temp_path {
            debug!("fd {} is the signing output {}", fd, path.display());
            self.interesting.insert(fd);
        } else {
            // a reused descriptor number must not inherit interest
            self.interesting.remove(&fd);
        }
        self.paths.insert(fd, path.to_path_buf());
    }

    pub fn on_close(&mut self, fd: RawFd) {
        self.interesting.remove(&fd);
        self.paths.remove(&fd);
        self.phase.on_close(fd);
    }

    /// `fstat` is skipped while a session is live. codesign stats the file
    /// over and over during the hashing pass and ignores the results.
    pub fn skip_stat(&self) -> bool {
        self.phase.is_live()
    }

    /// Decides how a `read` is answered. The first page-sized read on a
    /// descriptor of interest runs `compute` over its path and starts the
    /// session.
    pub fn on_read<F>(&mut self, fd: RawFd, len: usize, compute: F) -> Result<ReadOutcome, Fatal>
    where
        F: FnOnce(&Path) -> result::Result<DigestSequence>,
    {
        if len == BLOCK_SIZE && self.phase.is_idle() && self.interesting.contains(&fd) {
            self.begin_session(fd, compute)?;
        }
        let outcome = self.phase.on_read(fd, len);
        if let ReadOutcome::RestoreAndReal { fd: ended, .. } = outcome {
            // real I/O for the rest of this descriptor's lifetime
            self.interesting.remove(&ended);
        }
        Ok(outcome)
    }

    fn begin_session<F>(&mut self, fd: RawFd, compute: F) -> Result<(), Fatal>
    where
        F: FnOnce(&Path) -> result::Result<DigestSequence>,
    {
        let path = match self.paths.get(&fd) {
            Some(p) => p.clone(),
            None => {
                return Err(Fatal::Precompute(format!(
                    "no path recorded for fd {}",
                    fd
                )))
            }
        };
        if self.precomputed {
            return Err(Fatal::DigestsAlreadyComputed {
                path: path.display().to_string(),
            });
        }
        self.precomputed = true;
        let digests = compute(&path).map_err(|e| Fatal::Precompute(e.to_string()))?;
        self.phase.start(Session::new(fd, digests))
    }

    pub fn on_digest_update(&mut self, len: usize) -> Result<UpdateOutcome, Fatal> {
        self.phase.on_update(len)
    }

    pub fn on_digest_final(&mut self) -> Result<FinalOutcome, Fatal> {
        self.phase.on_final()
    }
}

static STATE: Mutex<Option<InterceptionState>> = Mutex::new(None);

/// Starts intercepting on behalf of `target`.
pub fn init(target: PathBuf) {
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(old) = state.as_ref() {
        warn!(
            "replacing interception state for {}",
            old.target().display()
        );
    }
    debug!("intercepting signing of {}", target.display());
    *state = Some(InterceptionState::new(target));
}

pub fn teardown() {
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(old) = state.take() {
        debug!("stop intercepting {}", old.target().display());
    }
}

/// Runs `f` on the state, or returns `None` before [`init`] / after
/// [`teardown`].
pub fn with<R, F>(f: F) -> Option<R>
where
    F: FnOnce(&mut InterceptionState) -> R,
{
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    state.as_mut().map(f)
}
