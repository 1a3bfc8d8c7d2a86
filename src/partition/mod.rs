//! # Partitions
//!
//! A partition binds an in-memory key table to a block store. Keys are
//! interned in the partition's arena and map to [`ListCell`]s; the values
//! live in `{prefix}.values` through the store, and the key table plus
//! list heads are serialized to `{prefix}.keys` at close. Lifetime
//! counters are persisted in `{prefix}.stats`.
//!
//! ## Locking
//!
//! The key-table lock is shared for lookups and exclusive only while a
//! new key is inserted; it is never held across I/O. List cells are
//! cloned out of the table and locked afterwards, so table contention is
//! limited to the hash lookup itself.
//!
//! ## Close Protocol
//!
//! Close try-locks every list. If all lists are free it flushes their
//! tails, syncs the store, writes a fresh keys file to `{prefix}.keys.tmp`
//! and atomically renames it over `{prefix}.keys`, then rewrites the
//! stats file. If any list is still locked, the previous keys file is
//! kept untouched (recent updates may be lost, never a torn file) and the
//! affected keys are reported on stderr.

pub mod stats;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::MAX_KEY_SIZE;
use crate::encoding::base64;
use crate::error::{report, ErrorKind};
use crate::list::{Iter, List, ListCell};
use crate::memory::KeyArena;
use crate::storage::{AccessPattern, BlockStore};

pub use stats::Stats;

/// How a partition is opened; built by the map from its id file and the
/// caller's options.
#[derive(Clone, Copy, Debug)]
pub struct PartitionConfig {
    pub block_size: u32,
    pub buffer_size: u32,
    pub create_if_missing: bool,
    pub readonly: bool,
}

/// Lifetime counters for values no longer represented by a live list
/// head: carried over from the previous session's stats plus whatever
/// whole-key removal strands in the store.
#[derive(Clone, Copy, Debug, Default)]
struct Carry {
    values_added: u64,
    values_removed: u64,
    values_unowned: u64,
}

/// One shard of the map: key table + store + arena.
pub struct Partition {
    // The table must drop before the arena; its keys alias arena memory.
    table: RwLock<HashMap<&'static [u8], ListCell>>,
    arena: KeyArena,
    store: BlockStore,
    carry: Mutex<Carry>,
    prefix: PathBuf,
    read_only: bool,
    closed: AtomicBool,
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl Partition {
    pub fn keys_path(prefix: &Path) -> PathBuf {
        suffixed(prefix, ".keys")
    }

    pub fn values_path(prefix: &Path) -> PathBuf {
        suffixed(prefix, ".values")
    }

    pub fn stats_path(prefix: &Path) -> PathBuf {
        suffixed(prefix, ".stats")
    }

    /// Opens the partition with files named `{prefix}.keys`,
    /// `{prefix}.values` and `{prefix}.stats`.
    pub fn open(prefix: &Path, config: PartitionConfig) -> Result<Self> {
        let keys_path = Self::keys_path(prefix);
        let mut table = HashMap::new();
        let arena = KeyArena::new();
        let mut heads_added: u64 = 0;
        let mut heads_removed: u64 = 0;

        if keys_path.is_file() {
            let file = File::open(&keys_path)
                .wrap_err_with(|| format!("failed to open keys file '{}'", keys_path.display()))?;
            let mut reader = BufReader::new(file);
            let num_keys = read_u32(&mut reader).map_err(|e| {
                report(
                    ErrorKind::Corrupt,
                    format!("keys file '{}' lacks a count: {e}", keys_path.display()),
                )
            })?;
            for i in 0..num_keys {
                let (key, list) = read_entry(&mut reader, &arena).wrap_err_with(|| {
                    format!(
                        "failed to read entry {} of {} from '{}'",
                        i,
                        num_keys,
                        keys_path.display()
                    )
                })?;
                let stats = list.stats();
                heads_added += stats.num_values_total as u64;
                heads_removed += stats.num_values_removed as u64;
                table.insert(key, ListCell::new(RwLock::new(list)));
            }
        } else if config.create_if_missing && !config.readonly {
            write_empty_keys_file(&keys_path)?;
        } else {
            return Err(report(
                ErrorKind::NotFound,
                format!("no partition at '{}'", prefix.display()),
            ));
        }

        let mut carry = Carry::default();
        let stats_path = Self::stats_path(prefix);
        if stats_path.is_file() {
            let persisted = Stats::read_from_file(&stats_path)?;
            carry.values_added = persisted.num_values_added.saturating_sub(heads_added);
            carry.values_removed = persisted.num_values_removed.saturating_sub(heads_removed);
            carry.values_unowned = persisted.num_values_unowned;
        }

        let store = BlockStore::open(
            &Self::values_path(prefix),
            config.block_size,
            config.buffer_size,
            config.readonly,
        )?;

        Ok(Self {
            table: RwLock::new(table),
            arena,
            store,
            carry: Mutex::new(carry),
            prefix: prefix.to_path_buf(),
            read_only: config.readonly,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn block_size(&self) -> u32 {
        self.store.block_size()
    }

    pub(crate) fn store(&self) -> &BlockStore {
        &self.store
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(report(
                ErrorKind::InvalidArgument,
                "write operation on a read-only map",
            ));
        }
        Ok(())
    }

    fn find_cell(&self, key: &[u8]) -> Option<ListCell> {
        self.table.read().get(key).cloned()
    }

    fn find_or_create_cell(&self, key: &[u8]) -> Result<ListCell> {
        if key.len() > MAX_KEY_SIZE {
            return Err(report(
                ErrorKind::InvalidArgument,
                format!("key of {} bytes exceeds the maximum of {}", key.len(), MAX_KEY_SIZE),
            ));
        }
        if let Some(cell) = self.find_cell(key) {
            return Ok(cell);
        }
        let mut table = self.table.write();
        // Re-check under the exclusive lock; another writer may have
        // inserted the key between our lookups.
        if let Some(cell) = table.get(key) {
            return Ok(cell.clone());
        }
        let interned = self.arena.intern(key);
        let cell = List::new_cell();
        table.insert(interned, cell.clone());
        Ok(cell)
    }

    /// Appends a value to the key's list, creating the list if needed.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let cell = self.find_or_create_cell(key)?;
        let mut list = cell.write();
        list.append(value, &self.store)
    }

    /// Iterates the key's values; an unknown key yields an empty iterator.
    pub fn get(&self, key: &[u8]) -> Result<Iter<'_>> {
        match self.find_cell(key) {
            Some(cell) => Iter::over(&cell, &self.store),
            None => Ok(Iter::empty()),
        }
    }

    /// Whether the key currently has at least one live value.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.find_cell(key)
            .is_some_and(|cell| !cell.read().is_empty())
    }

    /// Drops every value of the key. Returns true if any live value was
    /// removed.
    pub fn remove_key(&self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        match self.find_cell(key) {
            Some(cell) => Ok(self.clear_cell(&cell)),
            None => Ok(false),
        }
    }

    fn clear_cell(&self, cell: &ListCell) -> bool {
        let mut list = cell.write();
        if list.is_empty() {
            return false;
        }
        let dropped = list.clear();
        let mut carry = self.carry.lock();
        carry.values_added += dropped.num_values_total as u64;
        carry.values_removed += dropped.num_values_removed as u64;
        carry.values_unowned += dropped.num_values_valid() as u64;
        true
    }

    /// Clears every key matched by `pred`; returns the number of keys
    /// whose list held live values.
    pub fn remove_keys(&self, pred: &mut dyn FnMut(&[u8]) -> Result<bool>) -> Result<u32> {
        self.check_writable()?;
        let mut removed = 0u32;
        let table = self.table.read();
        for (key, cell) in table.iter() {
            if pred(key)? && self.clear_cell(cell) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Tombstones the first value of the key matched by `pred`.
    pub fn remove_value(
        &self,
        key: &[u8],
        pred: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<bool> {
        self.check_writable()?;
        match self.find_cell(key) {
            Some(cell) => {
                let mut list = cell.write();
                Ok(list.remove_where(&self.store, true, pred)? > 0)
            }
            None => Ok(false),
        }
    }

    /// Tombstones every value of the key matched by `pred`.
    pub fn remove_values(
        &self,
        key: &[u8],
        pred: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<u32> {
        self.check_writable()?;
        match self.find_cell(key) {
            Some(cell) => {
                let mut list = cell.write();
                list.remove_where(&self.store, false, pred)
            }
            None => Ok(0),
        }
    }

    /// Replaces the first value `map` maps to a new one.
    pub fn replace_value(
        &self,
        key: &[u8],
        map: &mut dyn FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<bool> {
        self.check_writable()?;
        match self.find_cell(key) {
            Some(cell) => {
                let mut list = cell.write();
                Ok(list.replace_where(&self.store, true, map)? > 0)
            }
            None => Ok(false),
        }
    }

    /// Replaces every value `map` maps to a new one.
    pub fn replace_values(
        &self,
        key: &[u8],
        map: &mut dyn FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<u32> {
        self.check_writable()?;
        match self.find_cell(key) {
            Some(cell) => {
                let mut list = cell.write();
                list.replace_where(&self.store, false, map)
            }
            None => Ok(0),
        }
    }

    /// Calls `proc` for every key with at least one live value.
    pub fn for_each_key(&self, proc: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let table = self.table.read();
        for (key, cell) in table.iter() {
            let list = cell.read();
            if !list.is_empty() {
                proc(key)?;
            }
        }
        Ok(())
    }

    /// Calls `proc` with each non-empty key and a fresh iterator over its
    /// values. The store is advised for a sequential scan for the
    /// duration.
    pub fn for_each_entry(
        &self,
        proc: &mut dyn FnMut(&[u8], &mut Iter) -> Result<()>,
    ) -> Result<()> {
        self.store.advise(AccessPattern::Sequential);
        let result = (|| -> Result<()> {
            let table = self.table.read();
            for (key, cell) in table.iter() {
                let mut iter = Iter::over(cell, &self.store)?;
                if iter.has_next() {
                    proc(key, &mut iter)?;
                }
            }
            Ok(())
        })();
        self.store.advise(AccessPattern::Random);
        result
    }

    /// Counter snapshot across the whole partition.
    pub fn get_stats(&self) -> Stats {
        let table = self.table.read();
        let mut builder = self.stats_builder();
        for (key, cell) in table.iter() {
            builder.add_list(key, cell.read().stats());
        }
        builder.finish()
    }

    fn stats_builder(&self) -> StatsBuilder {
        let carry = *self.carry.lock();
        StatsBuilder {
            stats: Stats {
                block_size: self.store.block_size() as u64,
                num_blocks: self.store.num_blocks() as u64,
                num_values_added: carry.values_added,
                num_values_removed: carry.values_removed,
                num_values_unowned: carry.values_unowned,
                ..Stats::default()
            },
            key_size_sum: 0,
            list_size_sum: 0,
        }
    }

    /// Flushes all lists and persists the key table and stats. Keeps the
    /// previous keys file when a list is still locked. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) || self.read_only {
            return Ok(());
        }
        let result = self.close_inner();
        // The table aliases arena memory; clear it before the reset.
        self.table.write().clear();
        self.arena.reset();
        result
    }

    fn close_inner(&self) -> Result<()> {
        let table = self.table.read();
        let mut guards = Vec::with_capacity(table.len());
        let mut all_unlocked = true;
        for (key, cell) in table.iter() {
            match cell.try_write() {
                Some(guard) => guards.push((*key, guard)),
                None => {
                    all_unlocked = false;
                    eprintln!(
                        "multimap: list for key {} (base64) still locked at close; \
                         keeping previous keys file, recent updates may be lost",
                        base64::encode(key)
                    );
                }
            }
        }
        if !all_unlocked {
            return self.store.sync();
        }

        for (_, guard) in guards.iter_mut() {
            guard.flush(&self.store)?;
        }
        self.store.sync()?;

        let keys_path = Self::keys_path(&self.prefix);
        let tmp_path = suffixed(&self.prefix, ".keys.tmp");
        {
            let file = File::create(&tmp_path)
                .wrap_err_with(|| format!("failed to create '{}'", tmp_path.display()))?;
            let mut writer = BufWriter::new(file);
            let num_keys = guards.iter().filter(|(_, g)| !g.is_empty()).count() as u32;
            writer.write_all(&num_keys.to_le_bytes())?;
            for (key, guard) in guards.iter() {
                if guard.is_empty() {
                    continue;
                }
                writer.write_all(&(key.len() as u16).to_le_bytes())?;
                writer.write_all(key)?;
                guard.write_head(&mut writer)?;
            }
            writer
                .into_inner()
                .map_err(|e| e.into_error())
                .and_then(|file| file.sync_all())
                .wrap_err_with(|| format!("failed to finish '{}'", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &keys_path).wrap_err_with(|| {
            format!(
                "failed to move '{}' over '{}'",
                tmp_path.display(),
                keys_path.display()
            )
        })?;

        let mut builder = self.stats_builder();
        for (key, guard) in guards.iter() {
            builder.add_list(key, guard.stats());
        }
        builder.finish().write_to_file(&Self::stats_path(&self.prefix))
    }
}

/// Accumulates per-list counters into a partition [`Stats`]; the size
/// aggregates only consider lists with live values.
struct StatsBuilder {
    stats: Stats,
    key_size_sum: u64,
    list_size_sum: u64,
}

impl StatsBuilder {
    fn add_list(&mut self, key: &[u8], list_stats: crate::list::ListStats) {
        self.stats.num_values_added += list_stats.num_values_total as u64;
        self.stats.num_values_removed += list_stats.num_values_removed as u64;
        let valid = list_stats.num_values_valid() as u64;
        if valid == 0 {
            return;
        }
        self.stats.num_keys += 1;
        let key_size = key.len() as u64;
        self.key_size_sum += key_size;
        self.list_size_sum += valid;
        self.stats.key_size_max = self.stats.key_size_max.max(key_size);
        self.stats.key_size_min = if self.stats.key_size_min == 0 {
            key_size
        } else {
            self.stats.key_size_min.min(key_size)
        };
        self.stats.list_size_max = self.stats.list_size_max.max(valid);
        self.stats.list_size_min = if self.stats.list_size_min == 0 {
            valid
        } else {
            self.stats.list_size_min.min(valid)
        };
    }

    fn finish(mut self) -> Stats {
        if self.stats.num_keys > 0 {
            self.stats.key_size_avg = self.key_size_sum / self.stats.num_keys;
            self.stats.list_size_avg = self.list_size_sum / self.stats.num_keys;
        }
        self.stats
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            eprintln!(
                "multimap: failed to close partition '{}': {e:#}",
                self.prefix.display()
            );
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("prefix", &self.prefix)
            .field("num_keys", &self.table.read().len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

fn read_u32(input: &mut impl Read) -> std::io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u16(input: &mut impl Read) -> std::io::Result<u16> {
    let mut bytes = [0u8; 2];
    input.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_entry(input: &mut impl Read, arena: &KeyArena) -> Result<(&'static [u8], List)> {
    let key_size = read_u16(input)? as usize;
    let mut key = vec![0u8; key_size];
    input.read_exact(&mut key)?;
    let list = List::read_head(input)?;
    Ok((arena.intern(&key), list))
}

fn write_empty_keys_file(path: &Path) -> Result<()> {
    let file = File::create(path)
        .wrap_err_with(|| format!("failed to create keys file '{}'", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&0u32.to_le_bytes())?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|file| file.sync_all())
        .wrap_err_with(|| format!("failed to finish keys file '{}'", path.display()))?;
    Ok(())
}
