use libc::c_void;
use log::warn;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use simple_error::try_with;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::slice;

use crate::result::Result;

/// A private read-only view of a whole file. Unmapped on drop.
#[derive(Debug)]
pub struct Mapping {
    ptr: *mut c_void,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of `file`. Returns `None` for empty files, which
    /// cannot be mapped.
    pub fn map(file: &File, len: usize) -> Result<Option<Mapping>> {
        let length = match NonZeroUsize::new(len) {
            Some(l) => l,
            None => return Ok(None),
        };
        let res = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        let ptr = try_with!(res, "mmap of {} bytes failed", len);
        Ok(Some(Mapping { ptr, len }))
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("failed to unmap {} bytes at {:p}: {}", self.len, self.ptr, e);
        }
    }
}

/// Maps a whole file, handing an empty slice to `f` for empty files.
pub fn with_file_bytes<T, F>(file: &File, f: F) -> Result<T>
where
    F: FnOnce(&[u8]) -> T,
{
    let meta = try_with!(file.metadata(), "cannot stat mapped file");
    let len = meta.len() as usize;
    let mapping = Mapping::map(file, len)?;
    Ok(match &mapping {
        Some(m) => f(m.as_slice()),
        None => f(&[]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn maps_file_contents() {
        let mut tmp = NamedTempFile::new().expect("cannot create tempfile");
        tmp.write_all(b"mapped bytes").expect("cannot write tempfile");
        let file = File::open(tmp.path()).expect("cannot open tempfile");
        let copy = with_file_bytes(&file, |b| b.to_vec()).expect("cannot map");
        assert_eq!(copy, b"mapped bytes");
    }

    #[test]
    fn empty_file_is_not_mapped() {
        let tmp = NamedTempFile::new().expect("cannot create tempfile");
        let file = File::open(tmp.path()).expect("cannot open tempfile");
        assert!(Mapping::map(&file, 0).expect("map failed").is_none());
        assert_eq!(with_file_bytes(&file, |b| b.len()).expect("map failed"), 0);
    }
}
