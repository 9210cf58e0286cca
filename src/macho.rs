//! Just enough of the Mach-O format to find where a universal binary starts
//! executing for a given architecture.

use log::debug;
use simple_error::{bail, require_with, try_with};
use std::fmt;
use std::fs::File;
use std::path::Path;

use crate::mapping::with_file_bytes;
use crate::result::Result;

// The fat header and its arch table are big endian on disk
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;
// single-architecture images are little endian on every platform we care about
pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;

const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;
const FAT_ARCH_64_SIZE: usize = 32;
const MACH_HEADER_64_SIZE: usize = 32;
const LOAD_COMMAND_SIZE: usize = 8;
/// cmd, cmdsize, entryoff, stacksize
const ENTRY_POINT_COMMAND_SIZE: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuType(pub u32);

impl CpuType {
    pub const X86_64: CpuType = CpuType(0x0100_0007);
    pub const ARM64: CpuType = CpuType(0x0100_000c);

    pub fn from_name(name: &str) -> Option<CpuType> {
        match name {
            "arm64" | "aarch64" => Some(CpuType::ARM64),
            "x86_64" => Some(CpuType::X86_64),
            _ => None,
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub const HOST_CPU: CpuType = CpuType::X86_64;

#[cfg(not(target_arch = "x86_64"))]
pub const HOST_CPU: CpuType = CpuType::ARM64;

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CpuType::ARM64 => write!(f, "arm64"),
            CpuType::X86_64 => write!(f, "x86_64"),
            CpuType(other) => write!(f, "cputype {:#x}", other),
        }
    }
}

/// One architecture slice of a universal binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerImage {
    pub cpu_type: CpuType,
    pub cpu_subtype: u32,
    pub offset: u64,
    pub size: u64,
}

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    let end = require_with!(offset.checked_add(N), "offset {:#x} overflows", offset);
    let bytes = require_with!(
        data.get(offset..end),
        "truncated: need bytes {:#x}..{:#x}, have {:#x}",
        offset,
        end,
        data.len()
    );
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn be_u32(data: &[u8], offset: usize) -> Result<u32> {
    field(data, offset).map(u32::from_be_bytes)
}

fn be_u64(data: &[u8], offset: usize) -> Result<u64> {
    field(data, offset).map(u64::from_be_bytes)
}

fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    field(data, offset).map(u32::from_le_bytes)
}

fn le_u64(data: &[u8], offset: usize) -> Result<u64> {
    field(data, offset).map(u64::from_le_bytes)
}

/// Lists the architecture table of a universal binary in container order.
pub fn container_images(data: &[u8]) -> Result<Vec<ContainerImage>> {
    let magic = be_u32(data, 0)?;
    let entry_size = match magic {
        FAT_MAGIC => FAT_ARCH_SIZE,
        FAT_MAGIC_64 => FAT_ARCH_64_SIZE,
        _ => bail!("not a fat Mach-O binary (magic {:#x})", magic),
    };
    let nfat_arch = be_u32(data, 4)? as usize;

    let mut images = Vec::with_capacity(nfat_arch);
    for i in 0..nfat_arch {
        let base = FAT_HEADER_SIZE + i * entry_size;
        let cpu_type = CpuType(be_u32(data, base)?);
        let cpu_subtype = be_u32(data, base + 4)?;
        let (offset, size) = if magic == FAT_MAGIC {
            (
                u64::from(be_u32(data, base + 8)?),
                u64::from(be_u32(data, base + 12)?),
            )
        } else {
            (be_u64(data, base + 8)?, be_u64(data, base + 16)?)
        };
        images.push(ContainerImage {
            cpu_type,
            cpu_subtype,
            offset,
            size,
        });
    }
    Ok(images)
}

/// First image in container order built for `cpu_type`.
pub fn find_image(data: &[u8], cpu_type: CpuType) -> Result<ContainerImage> {
    let images = container_images(data)?;
    let image = require_with!(
        images.into_iter().find(|i| i.cpu_type == cpu_type),
        "no {} image in fat binary",
        cpu_type
    );
    Ok(image)
}

/// Walks the load commands of a 64-bit image and returns the `LC_MAIN`
/// entry offset.
pub fn entry_offset(image: &[u8]) -> Result<u64> {
    let magic = le_u32(image, 0)?;
    if magic != MH_MAGIC_64 {
        bail!("not a 64-bit Mach-O image (magic {:#x})", magic);
    }
    let ncmds = le_u32(image, 16)?;

    let mut offset = MACH_HEADER_64_SIZE;
    for _ in 0..ncmds {
        let cmd = le_u32(image, offset)?;
        let cmdsize = le_u32(image, offset + 4)? as usize;
        if cmdsize < LOAD_COMMAND_SIZE {
            bail!("load command at {:#x} has invalid size {}", offset, cmdsize);
        }
        if cmd == LC_MAIN {
            if cmdsize < ENTRY_POINT_COMMAND_SIZE {
                bail!("LC_MAIN at {:#x} is too short ({} bytes)", offset, cmdsize);
            }
            return le_u64(image, offset + 8);
        }
        offset += cmdsize;
    }
    bail!("no LC_MAIN load command in {} load commands", ncmds)
}

/// Entry offset of the `cpu_type` slice of an in-memory universal binary.
pub fn entry_offset_for(data: &[u8], cpu_type: CpuType) -> Result<u64> {
    let image = find_image(data, cpu_type)?;
    let start = image.offset as usize;
    let end = require_with!(
        start.checked_add(image.size as usize),
        "{} image size overflows",
        cpu_type
    );
    let bytes = require_with!(
        data.get(start..end),
        "{} image {:#x}..{:#x} is outside of the file ({:#x} bytes)",
        cpu_type,
        start,
        end,
        data.len()
    );
    entry_offset(bytes)
}

/// Resolves where execution starts for the `cpu_type` slice of the universal
/// binary at `path`. The file is mapped only for the duration of the parse.
pub fn resolve_entry_offset(path: &Path, cpu_type: CpuType) -> Result<u64> {
    let file = try_with!(File::open(path), "cannot open {}", path.display());
    let res = with_file_bytes(&file, |data| entry_offset_for(data, cpu_type))?;
    let offset = try_with!(res, "cannot find entry point of {}", path.display());
    debug!(
        "{}: {} entry point at offset {:#x}",
        path.display(),
        cpu_type,
        offset
    );
    Ok(offset)
}
