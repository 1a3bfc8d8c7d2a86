//! # Configuration Constants
//!
//! Central home for the on-disk format limits and default tuning values.
//! Constants that depend on each other are co-located and guarded by
//! compile-time assertions so a change to one cannot silently break a
//! dependent value.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_BLOCK_SIZE (512)
//!       │
//!       ├─> must be a power of two (runtime-checked for configured sizes)
//!       │
//!       └─> max value size = block_size - worst-case header
//!             The per-value header is the varint of (len << 1), so its
//!             size depends on the block size itself.
//!
//! DEFAULT_BUFFER_SIZE (1 MiB)
//!       │
//!       └─> must be a multiple of the block size; the store's write
//!           buffer holds buffer_size / block_size blocks.
//!
//! MAX_KEY_SIZE (65535)
//!       │
//!       └─> keys are length-prefixed with a u16 in the keys file
//!
//! MAX_UINT_DELTA (2^28 - 1)
//!       │
//!       └─> largest value a 4-byte varint can carry; block-ID deltas
//!           beyond this are rejected by the uint sequence
//! ```

/// Default size of a value block in bytes. Chosen at map creation and
/// immutable for the map's lifetime.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Default number of partitions for a new map.
pub const DEFAULT_NUM_PARTITIONS: u32 = 23;

/// Default size of each partition store's write buffer.
pub const DEFAULT_BUFFER_SIZE: u32 = 1024 * 1024;

/// Largest allowed key, bounded by the u16 length prefix in the keys file.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Largest value a 4-byte varint can encode; the ceiling for block-ID
/// deltas inside a list head.
pub const MAX_UINT_DELTA: u32 = (1 << 28) - 1;

/// Format version stored in the id file. Opening fails unless the file's
/// major version matches and its minor version is not newer.
pub const MAJOR_VERSION: u64 = 1;
pub const MINOR_VERSION: u64 = 0;

/// Shared prefix of every file a map places in its directory.
pub const FILE_PREFIX: &str = "multimap";

const _: () = assert!(
    DEFAULT_BLOCK_SIZE.is_power_of_two(),
    "DEFAULT_BLOCK_SIZE must be a power of two"
);

const _: () = assert!(
    DEFAULT_BUFFER_SIZE % DEFAULT_BLOCK_SIZE == 0,
    "DEFAULT_BUFFER_SIZE must be a multiple of DEFAULT_BLOCK_SIZE"
);

const _: () = assert!(DEFAULT_NUM_PARTITIONS > 0);
