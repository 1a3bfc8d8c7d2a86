//! # Per-Key Value Lists
//!
//! A [`List`] is the per-key, append-ordered sequence of values. Its
//! durable head is two lifetime counters plus the delta-compressed IDs of
//! the blocks committed to the store; at runtime it also carries the tail
//! block still being filled in memory.
//!
//! Lists live in the partition's key table as `Arc<RwLock<List>>`
//! ([`ListCell`]); every operation runs under the appropriate guard.
//! Shared guards back iterators and stat snapshots, the unique guard backs
//! appends, flushes, removals and replacements. Guards are taken through
//! the `Arc` so handles and iterators own their lock (see [`iter`]).
//!
//! ## Removal
//!
//! Values are never rewritten in place. Removal flips the tombstone bit
//! of the matched entry — directly in the tail, or in a copy of the
//! committed block that is then written back through the store. A
//! replacement is a tombstone plus a fresh append at the end of the list.

pub mod iter;

use std::io::{Read, Write};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use smallvec::SmallVec;

use crate::encoding::UintSequence;
use crate::error::{report, ErrorKind};
use crate::storage::{block, max_value_size, Block, BlockStore};

pub use iter::Iter;

/// A list in its table cell; cloned out of the key table so list locks
/// are never taken while the table lock is held.
pub type ListCell = Arc<RwLock<List>>;

/// Shared (reader) guard of a list, owned by handles and iterators.
pub type SharedList = ArcRwLockReadGuard<RawRwLock, List>;

/// Unique (writer) guard of a list.
pub type UniqueList = ArcRwLockWriteGuard<RawRwLock, List>;

/// Counter snapshot of a list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListStats {
    pub num_values_total: u32,
    pub num_values_removed: u32,
}

impl ListStats {
    pub fn num_values_valid(&self) -> u32 {
        debug_assert!(self.num_values_total >= self.num_values_removed);
        self.num_values_total - self.num_values_removed
    }
}

/// Non-blocking counter snapshot: `None` while a writer holds the list.
pub fn try_stats(cell: &ListCell) -> Option<ListStats> {
    cell.try_read().map(|list| list.stats())
}

/// Append-ordered value list: durable head plus in-memory tail.
#[derive(Debug, Default)]
pub struct List {
    num_values_total: u32,
    num_values_removed: u32,
    block_ids: UintSequence,
    /// Kept after a flush and reused, to spare a reallocation per block.
    tail: Option<Block>,
}

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_cell() -> ListCell {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn stats(&self) -> ListStats {
        ListStats {
            num_values_total: self.num_values_total,
            num_values_removed: self.num_values_removed,
        }
    }

    pub fn num_values_valid(&self) -> u32 {
        self.stats().num_values_valid()
    }

    /// A list is empty when it holds no live value anywhere.
    pub fn is_empty(&self) -> bool {
        self.num_values_valid() == 0
    }

    pub(crate) fn block_ids(&self) -> &UintSequence {
        &self.block_ids
    }

    pub(crate) fn tail_bytes(&self) -> Option<&[u8]> {
        self.tail.as_ref().map(|tail| tail.bytes())
    }

    /// Appends a value, committing the tail block to the store whenever
    /// the next value does not fit.
    pub fn append(&mut self, value: &[u8], store: &BlockStore) -> Result<()> {
        let max = max_value_size(store.block_size()) as usize;
        if value.len() > max {
            return Err(report(
                ErrorKind::InvalidArgument,
                format!(
                    "value of {} bytes exceeds the maximum of {} for block size {}",
                    value.len(),
                    max,
                    store.block_size()
                ),
            ));
        }
        let tail = self
            .tail
            .get_or_insert_with(|| Block::new(store.block_size()));
        if !tail.try_add(value) {
            let id = store.append(tail.bytes())?;
            ensure!(
                self.block_ids.add(id),
                "block id {} is too far from its predecessor",
                id
            );
            tail.clear();
            let added = tail.try_add(value);
            debug_assert!(added, "size-checked value must fit an empty block");
        }
        self.num_values_total += 1;
        Ok(())
    }

    /// Commits a non-empty tail to the store.
    pub fn flush(&mut self, store: &BlockStore) -> Result<()> {
        if let Some(tail) = &mut self.tail {
            if !tail.is_empty() {
                let id = store.append(tail.bytes())?;
                ensure!(
                    self.block_ids.add(id),
                    "block id {} is too far from its predecessor",
                    id
                );
                tail.clear();
            }
        }
        Ok(())
    }

    /// Tombstones every live value matched by `pred` (or only the first,
    /// with `stop_after_first`), writing modified committed blocks back
    /// through the store. Returns the number of values removed.
    pub fn remove_where(
        &mut self,
        store: &BlockStore,
        stop_after_first: bool,
        pred: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<u32> {
        let mut removed = 0u32;
        let ids = self.block_ids.unpack()?;
        let mut buf = vec![0u8; store.block_size() as usize];
        'blocks: for &id in &ids {
            store.read(id, &mut buf)?;
            let mut offset = 0;
            let mut dirty = false;
            while let Some((entry, next)) = block::entry_at(&buf, offset)? {
                offset = next;
                if entry.tombstoned {
                    continue;
                }
                if pred(&buf[entry.value.clone()])? {
                    block::tombstone_entry(&mut buf, entry.header_offset);
                    dirty = true;
                    removed += 1;
                    if stop_after_first {
                        store.replace(id, &buf)?;
                        break 'blocks;
                    }
                }
            }
            if dirty {
                store.replace(id, &buf)?;
            }
        }
        if !(stop_after_first && removed > 0) {
            removed += self.remove_in_tail(stop_after_first, pred)?;
        }
        self.num_values_removed += removed;
        Ok(removed)
    }

    fn remove_in_tail(
        &mut self,
        stop_after_first: bool,
        pred: &mut dyn FnMut(&[u8]) -> Result<bool>,
    ) -> Result<u32> {
        let Some(tail) = &mut self.tail else {
            return Ok(0);
        };
        // Matching borrows the tail immutably; offsets are collected and
        // the tombstones applied afterwards.
        let mut matched: SmallVec<[usize; 8]> = SmallVec::new();
        let bytes = tail.bytes();
        let mut offset = 0;
        while let Some((entry, next)) = block::entry_at(bytes, offset)? {
            offset = next;
            if entry.tombstoned {
                continue;
            }
            if pred(&bytes[entry.value.clone()])? {
                matched.push(entry.header_offset);
                if stop_after_first {
                    break;
                }
            }
        }
        let count = matched.len() as u32;
        for header_offset in matched {
            tail.set_tombstone(header_offset);
        }
        Ok(count)
    }

    /// Replaces matched values: the old value is tombstoned and the
    /// mapped value appended at the end of the list. Returns the number
    /// of replacements.
    pub fn replace_where(
        &mut self,
        store: &BlockStore,
        stop_after_first: bool,
        map: &mut dyn FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<u32> {
        let mut replacements: Vec<Vec<u8>> = Vec::new();
        {
            let mut pred = |value: &[u8]| -> Result<bool> {
                match map(value)? {
                    Some(new_value) => {
                        replacements.push(new_value);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            };
            let removed = self.remove_where(store, stop_after_first, &mut pred)?;
            debug_assert_eq!(removed as usize, replacements.len());
        }
        for value in &replacements {
            self.append(value, store)?;
        }
        Ok(replacements.len() as u32)
    }

    /// Drops every value, returning the counters the partition folds into
    /// its unowned-value accounting. The blocks already committed stay in
    /// the store but are no longer reachable.
    pub fn clear(&mut self) -> ListStats {
        let stats = self.stats();
        self.num_values_total = 0;
        self.num_values_removed = 0;
        self.block_ids.clear();
        if let Some(tail) = &mut self.tail {
            tail.clear();
        }
        stats
    }

    /// Serializes the head: counters, then the length-prefixed block-ID
    /// blob. The tail must have been flushed first.
    pub fn write_head(&self, out: &mut impl Write) -> Result<()> {
        debug_assert!(self.tail.as_ref().map_or(true, |tail| tail.is_empty()));
        out.write_all(&self.num_values_total.to_le_bytes())?;
        out.write_all(&self.num_values_removed.to_le_bytes())?;
        let blob = self.block_ids.as_bytes();
        out.write_all(&(blob.len() as u32).to_le_bytes())?;
        out.write_all(blob)?;
        Ok(())
    }

    /// Reads a head serialized by [`Self::write_head`]; the resulting
    /// list has no tail.
    pub fn read_head(input: &mut impl Read) -> Result<Self> {
        let num_values_total = read_u32(input).wrap_err("failed to read list value count")?;
        let num_values_removed = read_u32(input).wrap_err("failed to read list removed count")?;
        if num_values_removed > num_values_total {
            return Err(report(
                ErrorKind::Corrupt,
                format!(
                    "list head has {} removed of {} total values",
                    num_values_removed, num_values_total
                ),
            ));
        }
        let blob_size = read_u32(input).wrap_err("failed to read block id blob size")? as usize;
        let mut blob = vec![0u8; blob_size];
        input
            .read_exact(&mut blob)
            .wrap_err("failed to read block id blob")?;
        let block_ids = UintSequence::from_bytes(&blob)
            .map_err(|e| report(ErrorKind::Corrupt, format!("bad block id sequence: {e}")))?;
        Ok(Self {
            num_values_total,
            num_values_removed,
            block_ids,
            tail: None,
        })
    }
}

fn read_u32(input: &mut impl Read) -> std::io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use tempfile::tempdir;

    fn test_store(block_size: u32) -> (tempfile::TempDir, BlockStore) {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(
            &dir.path().join("list.values"),
            block_size,
            block_size * 4,
            false,
        )
        .unwrap();
        (dir, store)
    }

    fn values_of(list: &ListCell, store: &BlockStore) -> Vec<Vec<u8>> {
        let mut iter = Iter::over(list, store).unwrap();
        let mut out = Vec::new();
        while let Some(value) = iter.next().unwrap() {
            out.push(value.to_vec());
        }
        out
    }

    #[test]
    fn append_and_read_back_in_order() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        {
            let mut list = cell.write();
            for i in 0..100u32 {
                list.append(format!("value-{i}").as_bytes(), &store).unwrap();
            }
        }
        let values = values_of(&cell, &store);
        assert_eq!(values.len(), 100);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(value, format!("value-{i}").as_bytes());
        }
    }

    #[test]
    fn oversize_value_is_rejected_and_list_unchanged() {
        let (_dir, store) = test_store(128);
        let cell = List::new_cell();
        let mut list = cell.write();
        list.append(b"ok", &store).unwrap();
        let before = list.stats();
        let big = vec![0u8; 128];
        let err = list.append(&big, &store).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidArgument));
        assert_eq!(list.stats(), before);
    }

    #[test]
    fn value_spanning_rule_starts_fresh_block() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        // 40 bytes + header, then another: the second cannot fit after
        // the first and must start a fresh block.
        list.append(&[1u8; 40], &store).unwrap();
        list.append(&[2u8; 40], &store).unwrap();
        assert_eq!(list.block_ids().unpack().unwrap().len(), 1);
        drop(list);
        let values = values_of(&cell, &store);
        assert_eq!(values, vec![vec![1u8; 40], vec![2u8; 40]]);
    }

    #[test]
    fn flush_commits_tail_once() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        list.append(b"a", &store).unwrap();
        list.flush(&store).unwrap();
        assert_eq!(list.block_ids().unpack().unwrap(), vec![0]);
        // A second flush with an empty tail commits nothing.
        list.flush(&store).unwrap();
        assert_eq!(list.block_ids().unpack().unwrap(), vec![0]);
    }

    #[test]
    fn remove_all_even_values() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        {
            let mut list = cell.write();
            for i in 0..1000u32 {
                list.append(i.to_string().as_bytes(), &store).unwrap();
            }
            let removed = list
                .remove_where(&store, false, &mut |value| {
                    let n: u32 = std::str::from_utf8(value)?.parse()?;
                    Ok(n % 2 == 0)
                })
                .unwrap();
            assert_eq!(removed, 500);
            assert_eq!(list.stats().num_values_total, 1000);
            assert_eq!(list.stats().num_values_removed, 500);
        }
        let values = values_of(&cell, &store);
        assert_eq!(values.len(), 500);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(value, (2 * i + 1).to_string().as_bytes());
        }
    }

    #[test]
    fn remove_first_match_only() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        for value in [b"x" as &[u8], b"y", b"x", b"x"] {
            list.append(value, &store).unwrap();
        }
        let removed = list
            .remove_where(&store, true, &mut |value| Ok(value == b"x"))
            .unwrap();
        assert_eq!(removed, 1);
        drop(list);
        assert_eq!(
            values_of(&cell, &store),
            vec![b"y".to_vec(), b"x".to_vec(), b"x".to_vec()]
        );
    }

    #[test]
    fn remove_survives_tail_and_committed_blocks() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        // Push enough to commit several blocks, leaving some in the tail.
        for i in 0..50u32 {
            list.append(format!("{i:05}").as_bytes(), &store).unwrap();
        }
        assert!(!list.block_ids().is_empty());
        let removed = list
            .remove_where(&store, false, &mut |value| Ok(value.ends_with(b"0")))
            .unwrap();
        assert_eq!(removed, 5);
        drop(list);
        let values = values_of(&cell, &store);
        assert_eq!(values.len(), 45);
        assert!(values.iter().all(|value| !value.ends_with(b"0")));
    }

    #[test]
    fn predicate_failure_propagates() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        list.append(b"boom", &store).unwrap();
        let result = list.remove_where(&store, false, &mut |_| bail!("user predicate failed"));
        assert!(result.is_err());
    }

    #[test]
    fn replace_appends_at_end() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        for value in [b"a" as &[u8], b"b", b"c"] {
            list.append(value, &store).unwrap();
        }
        let replaced = list
            .replace_where(&store, false, &mut |value| {
                Ok((value == b"b").then(|| b"B".to_vec()))
            })
            .unwrap();
        assert_eq!(replaced, 1);
        drop(list);
        assert_eq!(
            values_of(&cell, &store),
            vec![b"a".to_vec(), b"c".to_vec(), b"B".to_vec()]
        );
    }

    #[test]
    fn clear_empties_but_keeps_nothing_reachable() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        for i in 0..10u32 {
            list.append(&i.to_le_bytes(), &store).unwrap();
        }
        let dropped = list.clear();
        assert_eq!(dropped.num_values_total, 10);
        assert!(list.is_empty());
        drop(list);
        assert!(values_of(&cell, &store).is_empty());
    }

    #[test]
    fn head_roundtrip_through_bytes() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut list = cell.write();
        for i in 0..40u32 {
            list.append(format!("{i:04}").as_bytes(), &store).unwrap();
        }
        list.remove_where(&store, true, &mut |_| Ok(true)).unwrap();
        list.flush(&store).unwrap();

        let mut head = Vec::new();
        list.write_head(&mut head).unwrap();
        let restored = List::read_head(&mut head.as_slice()).unwrap();
        assert_eq!(restored.stats(), list.stats());
        assert_eq!(
            restored.block_ids().unpack().unwrap(),
            list.block_ids().unpack().unwrap()
        );
    }

    #[test]
    fn corrupt_head_counters_are_rejected() {
        let mut head = Vec::new();
        head.extend_from_slice(&1u32.to_le_bytes()); // total
        head.extend_from_slice(&2u32.to_le_bytes()); // removed > total
        head.extend_from_slice(&0u32.to_le_bytes());
        let err = List::read_head(&mut head.as_slice()).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Corrupt));
    }

    #[test]
    fn try_stats_fails_under_writer_and_succeeds_otherwise() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        cell.write().append(b"v", &store).unwrap();
        assert_eq!(try_stats(&cell).unwrap().num_values_total, 1);
        let guard = cell.write();
        assert!(try_stats(&cell).is_none());
        drop(guard);
        assert!(try_stats(&cell).is_some());
    }

    #[test]
    fn empty_values_round_trip() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        {
            let mut list = cell.write();
            list.append(b"", &store).unwrap();
            list.append(b"mid", &store).unwrap();
            list.append(b"", &store).unwrap();
        }
        assert_eq!(
            values_of(&cell, &store),
            vec![Vec::new(), b"mid".to_vec(), Vec::new()]
        );
    }
}
