//! Parallel per-page SHA-1 precomputation.
//!
//! codesign hashes the binary it signs one 4096-byte page at a time on a
//! single thread. For large binaries that loop dominates the whole signing
//! run, so we compute the same page digests up front on every core and let
//! the interposed digest calls hand them out.

use log::{debug, warn};
use sha1::{Digest, Sha1};
use simple_error::{bail, try_with};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::Instant;

use crate::mapping::with_file_bytes;
use crate::result::Result;

/// Page size codesign walks the binary with.
pub const BLOCK_SIZE: usize = 4096;
/// SHA-1, the only page hash width we substitute.
pub const DIGEST_LEN: usize = 20;

pub type BlockDigest = [u8; DIGEST_LEN];

/// Number of pages needed to cover `len` bytes, the last one possibly short.
pub fn block_count(len: u64) -> usize {
    ((len + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as usize
}

fn hash_block(block: &[u8]) -> BlockDigest {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&Sha1::digest(block));
    out
}

/// Ordered page digests covering a whole file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestSequence {
    digests: Vec<BlockDigest>,
    file_size: u64,
}

impl DigestSequence {
    /// Maps `path` and hashes it on all available cores.
    pub fn compute(path: &Path) -> Result<DigestSequence> {
        let start = Instant::now();
        let file = try_with!(File::open(path), "cannot open {}", path.display());
        disable_read_ahead(&file);

        let workers = num_cpus::get();
        let res = with_file_bytes(&file, |data| DigestSequence::from_bytes(data, workers))?;
        let sequence = try_with!(res, "cannot hash {}", path.display());

        debug!(
            "hashed {} pages of {} ({} bytes) on {} threads in {:?}",
            sequence.len(),
            path.display(),
            sequence.file_size(),
            workers,
            start.elapsed()
        );
        Ok(sequence)
    }

    /// Hashes `data` page by page, splitting the pages into `workers`
    /// contiguous ranges that are hashed concurrently.
    pub fn from_bytes(data: &[u8], workers: usize) -> Result<DigestSequence> {
        let total = block_count(data.len() as u64);
        let mut digests = vec![[0u8; DIGEST_LEN]; total];
        if total > 0 {
            let per_worker = (total + workers.max(1) - 1) / workers.max(1);
            hash_partitions(data, &mut digests, per_worker)?;
        }
        Ok(DigestSequence {
            digests,
            file_size: data.len() as u64,
        })
    }

    /// Number of page digests.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn get(&self, index: usize) -> Option<&BlockDigest> {
        self.digests.get(index)
    }

    /// Byte length of page `index`: `BLOCK_SIZE` except for a short last page.
    pub fn block_len(&self, index: usize) -> Option<usize> {
        if index >= self.digests.len() {
            return None;
        }
        let start = index as u64 * BLOCK_SIZE as u64;
        Some((self.file_size - start).min(BLOCK_SIZE as u64) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockDigest> {
        self.digests.iter()
    }
}

fn hash_partitions(data: &[u8], digests: &mut [BlockDigest], per_worker: usize) -> Result<()> {
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for (i, slots) in digests.chunks_mut(per_worker).enumerate() {
            let first = i * per_worker;
            let builder = thread::Builder::new().name(format!("digest-{}", i));
            let handle = builder.spawn_scoped(scope, move || {
                for (j, slot) in slots.iter_mut().enumerate() {
                    let start = (first + j) * BLOCK_SIZE;
                    let end = (start + BLOCK_SIZE).min(data.len());
                    *slot = hash_block(&data[start..end]);
                }
            });
            handles.push(try_with!(handle, "cannot spawn digest worker {}", i));
        }
        for handle in handles {
            if handle.join().is_err() {
                bail!("digest worker panicked");
            }
        }
        Ok(())
    })
}

#[cfg(target_vendor = "apple")]
fn disable_read_ahead(file: &File) {
    let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if res == -1 {
        warn!("cannot set F_NOCACHE: {}", nix::errno::Errno::last());
    }
}

#[cfg(not(target_vendor = "apple"))]
fn disable_read_ahead(file: &File) {
    use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};
    if let Err(e) = posix_fadvise(
        file.as_raw_fd(),
        0,
        0,
        PosixFadviseAdvice::POSIX_FADV_RANDOM,
    ) {
        warn!("cannot disable read-ahead: {}", e);
    }
}
