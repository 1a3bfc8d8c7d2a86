//! # Open Options
//!
//! [`Options`] configures how a map is opened or created. The block size
//! and partition count only matter when a new map is created; for an
//! existing map the values recorded in the id file win.

mod constants;

pub use constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE, DEFAULT_NUM_PARTITIONS, FILE_PREFIX, MAJOR_VERSION,
    MAX_KEY_SIZE, MAX_UINT_DELTA, MINOR_VERSION,
};

use eyre::Result;

use crate::error::{report, ErrorKind};

/// Options for opening or creating a map.
#[derive(Clone, Debug)]
pub struct Options {
    /// Size of a value block in bytes; must be a power of two. Applies to
    /// newly created maps only. Zero means "keep the source value" for
    /// operations that rewrite a map.
    pub block_size: u32,
    /// Number of partitions; applies to newly created maps only. Zero
    /// means "keep the source value" for operations that rewrite a map.
    pub num_partitions: u32,
    /// Size of each partition's write buffer; rounded to a multiple of
    /// the block size at open.
    pub buffer_size: u32,
    /// Create the map if the directory holds none.
    pub create_if_missing: bool,
    /// Fail with `already_exists` if the directory already holds a map.
    pub error_if_exists: bool,
    /// Open without write access; mutating operations fail and close does
    /// not rewrite any file.
    pub readonly: bool,
    /// Suppress progress messages from long-running tool operations.
    pub quiet: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_partitions: DEFAULT_NUM_PARTITIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            create_if_missing: false,
            error_if_exists: false,
            readonly: false,
            quiet: false,
        }
    }
}

impl Options {
    /// Validates the creation-relevant fields. Called before a new map is
    /// written to disk, not when opening an existing one.
    pub fn validate_for_create(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(report(
                ErrorKind::InvalidArgument,
                format!("block size {} is not a power of two", self.block_size),
            ));
        }
        if self.num_partitions == 0 {
            return Err(report(
                ErrorKind::InvalidArgument,
                "number of partitions must be positive",
            ));
        }
        Ok(())
    }

    /// The write-buffer size actually used for a given block size: at
    /// least one block, rounded down to a whole number of blocks.
    pub fn effective_buffer_size(&self, block_size: u32) -> u32 {
        let blocks = (self.buffer_size / block_size).max(1);
        blocks * block_size
    }
}
