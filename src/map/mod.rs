//! # Map
//!
//! The top-level store: a fixed array of partitions selected by key hash,
//! an exclusive directory lock, and the persistent id record. Single-key
//! operations route to exactly one partition; whole-map scans visit the
//! partitions in index order.
//!
//! ## Directory Layout
//!
//! ```text
//! map_dir/
//! ├── multimap.id          # 32-byte shape + version record
//! ├── multimap.lock        # advisory directory lock sentinel
//! ├── multimap.0.keys      # partition 0: key table + list heads
//! ├── multimap.0.values    # partition 0: block store
//! ├── multimap.0.stats     # partition 0: counters
//! └── ...                  # one triple per partition
//! ```
//!
//! ## Dispatch
//!
//! `partition_of(key) = fnv1a(key) % num_partitions`. The hash is stable
//! across runs and platforms, so the same key always lands in the same
//! partition file set.

pub mod dirlock;
pub mod id;
pub mod ops;

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::config::{Options, FILE_PREFIX};
use crate::error::{report, ErrorKind};
use crate::list::Iter;
use crate::partition::{Partition, PartitionConfig, Stats};

pub use dirlock::DirectoryLock;
pub use id::MapId;

/// Stable 32-bit FNV-1a, the partition dispatch hash.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub(crate) fn id_path(directory: &Path) -> PathBuf {
    directory.join(format!("{FILE_PREFIX}.id"))
}

pub(crate) fn lock_path(directory: &Path) -> PathBuf {
    directory.join(format!("{FILE_PREFIX}.lock"))
}

pub(crate) fn partition_prefix(directory: &Path, index: u32) -> PathBuf {
    directory.join(format!("{FILE_PREFIX}.{index}"))
}

/// An open map. Thread-safe; all operations take `&self`.
pub struct Map {
    partitions: Vec<Partition>,
    id: MapId,
    directory: PathBuf,
    // Held until the map is dropped.
    _lock: DirectoryLock,
}

impl Map {
    /// Opens an existing map with default options.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(directory, &Options::default())
    }

    /// Opens a map, creating it if missing.
    pub fn create(directory: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(
            directory,
            &Options {
                create_if_missing: true,
                ..Options::default()
            },
        )
    }

    /// Opens or creates a map as directed by `options`.
    pub fn with_options(directory: impl AsRef<Path>, options: &Options) -> Result<Self> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            if !options.create_if_missing {
                return Err(report(
                    ErrorKind::NotFound,
                    format!("no map directory at '{}'", directory.display()),
                ));
            }
            std::fs::create_dir_all(directory).wrap_err_with(|| {
                format!("failed to create map directory '{}'", directory.display())
            })?;
        }

        let lock = DirectoryLock::acquire(&lock_path(directory))?;

        let id_path = id_path(directory);
        let id = if id_path.is_file() {
            if options.error_if_exists {
                return Err(report(
                    ErrorKind::AlreadyExists,
                    format!("map in '{}' already exists", directory.display()),
                ));
            }
            let id = MapId::read_from_file(&id_path)?;
            id.check_version()?;
            id
        } else {
            if !options.create_if_missing {
                return Err(report(
                    ErrorKind::NotFound,
                    format!("no map in '{}'", directory.display()),
                ));
            }
            options.validate_for_create()?;
            let id = MapId::new(options.block_size, options.num_partitions);
            id.write_to_file(&id_path)?;
            id
        };

        let config = PartitionConfig {
            block_size: id.block_size(),
            buffer_size: options.effective_buffer_size(id.block_size()),
            create_if_missing: options.create_if_missing,
            readonly: options.readonly,
        };
        let mut partitions = Vec::with_capacity(id.num_partitions() as usize);
        for index in 0..id.num_partitions() {
            let prefix = partition_prefix(directory, index);
            partitions.push(Partition::open(&prefix, config).wrap_err_with(|| {
                format!("failed to open partition {} of '{}'", index, directory.display())
            })?);
        }

        Ok(Self {
            partitions,
            id,
            directory: directory.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn block_size(&self) -> u32 {
        self.id.block_size()
    }

    pub fn num_partitions(&self) -> u32 {
        self.id.num_partitions()
    }

    pub fn is_read_only(&self) -> bool {
        self.partitions[0].is_read_only()
    }

    /// The partition index the key routes to; depends only on the key
    /// bytes and the partition count.
    pub fn partition_of(&self, key: &[u8]) -> usize {
        (fnv1a_32(key) % self.id.num_partitions()) as usize
    }

    fn partition(&self, key: &[u8]) -> &Partition {
        &self.partitions[self.partition_of(key)]
    }

    /// Appends a value to the key's list.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.partition(key).put(key, value)
    }

    /// Iterates the key's live values in insertion order. A missing key
    /// yields an empty iterator.
    pub fn get(&self, key: &[u8]) -> Result<Iter<'_>> {
        self.partition(key).get(key)
    }

    /// Whether the key has at least one live value.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.partition(key).contains(key)
    }

    /// Drops every value of the key.
    pub fn remove_key(&self, key: &[u8]) -> Result<bool> {
        self.partition(key).remove_key(key)
    }

    /// Clears every key matched by `pred`, across all partitions.
    pub fn remove_keys(
        &self,
        mut pred: impl FnMut(&[u8]) -> Result<bool>,
    ) -> Result<u32> {
        let mut removed = 0;
        for partition in &self.partitions {
            removed += partition.remove_keys(&mut pred)?;
        }
        Ok(removed)
    }

    /// Removes the first value of the key matched by `pred`.
    pub fn remove_value(
        &self,
        key: &[u8],
        mut pred: impl FnMut(&[u8]) -> Result<bool>,
    ) -> Result<bool> {
        self.partition(key).remove_value(key, &mut pred)
    }

    /// Removes every value of the key matched by `pred`.
    pub fn remove_values(
        &self,
        key: &[u8],
        mut pred: impl FnMut(&[u8]) -> Result<bool>,
    ) -> Result<u32> {
        self.partition(key).remove_values(key, &mut pred)
    }

    /// Replaces the first occurrence of `old_value` with `new_value`.
    pub fn replace_value(&self, key: &[u8], old_value: &[u8], new_value: &[u8]) -> Result<bool> {
        self.replace_value_with(key, |value| {
            Ok((value == old_value).then(|| new_value.to_vec()))
        })
    }

    /// Replaces the first value `map` maps to `Some`.
    pub fn replace_value_with(
        &self,
        key: &[u8],
        mut map: impl FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<bool> {
        self.partition(key).replace_value(key, &mut map)
    }

    /// Replaces every occurrence of `old_value` with `new_value`.
    pub fn replace_values(&self, key: &[u8], old_value: &[u8], new_value: &[u8]) -> Result<u32> {
        self.replace_values_with(key, |value| {
            Ok((value == old_value).then(|| new_value.to_vec()))
        })
    }

    /// Replaces every value `map` maps to `Some`.
    pub fn replace_values_with(
        &self,
        key: &[u8],
        mut map: impl FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<u32> {
        self.partition(key).replace_values(key, &mut map)
    }

    /// Calls `proc` for every key with a live value, partition by
    /// partition. Not an atomic snapshot of the whole map.
    pub fn for_each_key(&self, mut proc: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        for partition in &self.partitions {
            partition.for_each_key(&mut proc)?;
        }
        Ok(())
    }

    /// Calls `proc` for every live value of the key.
    pub fn for_each_value(
        &self,
        key: &[u8],
        mut proc: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut iter = self.get(key)?;
        while let Some(value) = iter.next()? {
            proc(value)?;
        }
        Ok(())
    }

    /// Calls `proc` with every non-empty key and an iterator over its
    /// values; a per-list snapshot, key by key.
    pub fn for_each_entry(
        &self,
        mut proc: impl FnMut(&[u8], &mut Iter) -> Result<()>,
    ) -> Result<()> {
        for partition in &self.partitions {
            partition.for_each_entry(&mut proc)?;
        }
        Ok(())
    }

    /// Per-partition counter snapshots, in partition order.
    pub fn get_stats(&self) -> Vec<Stats> {
        self.partitions.iter().map(Partition::get_stats).collect()
    }

    /// Aggregate counters over all partitions.
    pub fn get_total_stats(&self) -> Stats {
        Stats::total(&self.get_stats())
    }

    /// Flushes and persists every partition, then releases the directory
    /// lock. Dropping the map does the same, reporting failures to
    /// stderr instead.
    pub fn close(self) -> Result<()> {
        let mut result = Ok(());
        for partition in &self.partitions {
            let closed = partition.close();
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("directory", &self.directory)
            .field("block_size", &self.id.block_size())
            .field("num_partitions", &self.id.num_partitions())
            .finish()
    }
}
