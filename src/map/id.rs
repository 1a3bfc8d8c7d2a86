//! # Map Id File
//!
//! A 32-byte little-endian record at `<dir>/multimap.id` pinning the
//! map's immutable shape and the library version that wrote it:
//!
//! ```text
//! Offset  Field
//! 0       block_size
//! 8       num_partitions
//! 16      major_version
//! 24      minor_version
//! ```
//!
//! Opening fails with `version_mismatch` unless the major version matches
//! exactly and the minor version is not newer than this library's.

use std::path::Path;

use eyre::{Result, WrapErr};
use zerocopy::{
    byteorder::{LittleEndian, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::config::{MAJOR_VERSION, MINOR_VERSION};
use crate::error::{report, ErrorKind};

/// Size of the serialized record in bytes.
pub const ID_RECORD_SIZE: usize = 32;

/// The map's identity record.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MapId {
    block_size: U64<LittleEndian>,
    num_partitions: U64<LittleEndian>,
    major_version: U64<LittleEndian>,
    minor_version: U64<LittleEndian>,
}

const _: () = assert!(
    std::mem::size_of::<MapId>() == ID_RECORD_SIZE,
    "MapId layout drifted from the on-disk format"
);

impl MapId {
    pub fn new(block_size: u32, num_partitions: u32) -> Self {
        Self {
            block_size: U64::new(block_size as u64),
            num_partitions: U64::new(num_partitions as u64),
            major_version: U64::new(MAJOR_VERSION),
            minor_version: U64::new(MINOR_VERSION),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.get() as u32
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions.get() as u32
    }

    pub fn major_version(&self) -> u64 {
        self.major_version.get()
    }

    pub fn minor_version(&self) -> u64 {
        self.minor_version.get()
    }

    /// Fails unless this record was written by a compatible library.
    pub fn check_version(&self) -> Result<()> {
        if self.major_version.get() != MAJOR_VERSION || self.minor_version.get() > MINOR_VERSION {
            return Err(report(
                ErrorKind::VersionMismatch,
                format!(
                    "map was created by version {}.{}, this library is {}.{}",
                    self.major_version.get(),
                    self.minor_version.get(),
                    MAJOR_VERSION,
                    MINOR_VERSION
                ),
            ));
        }
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read id file '{}'", path.display()))?;
        if bytes.len() != ID_RECORD_SIZE {
            return Err(report(
                ErrorKind::Corrupt,
                format!(
                    "id file '{}' has {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    ID_RECORD_SIZE
                ),
            ));
        }
        MapId::read_from_bytes(&bytes)
            .map_err(|e| report(ErrorKind::Corrupt, format!("bad id record: {e:?}")))
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.as_bytes())
            .wrap_err_with(|| format!("failed to write id file '{}'", path.display()))
    }
}
