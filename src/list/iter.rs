//! # List Iterators
//!
//! [`Iter`] walks a list's values in insertion order, skipping tombstoned
//! entries: first the committed blocks (each read through the store into a
//! reusable buffer), then the in-memory tail. The iterator owns the
//! list's shared lock guard, so appenders are blocked for exactly as long
//! as the iterator lives, and the value slices it yields stay valid until
//! the next advance.
//!
//! The block-ID sequence is snapshotted at construction. `available()` is
//! the number of live values remaining and decreases by at least one per
//! `next()`.

use eyre::Result;
use smallvec::SmallVec;

use crate::storage::{block, BlockStore};

use super::{ListCell, SharedList};

enum Phase {
    /// Load the block at `ids[next_block]`, or move to the tail.
    LoadBlock,
    /// Decode entries from the loaded block buffer.
    InBlock,
    /// Decode entries from the list's in-memory tail.
    Tail,
    Done,
}

struct Inner<'s> {
    guard: SharedList,
    store: &'s BlockStore,
    ids: SmallVec<[u32; 8]>,
    next_block: usize,
    buf: Vec<u8>,
    offset: usize,
    phase: Phase,
    available: u32,
}

/// Iterator over a list's live values. Holds the list's shared lock.
pub struct Iter<'s> {
    inner: Option<Inner<'s>>,
}

impl<'s> Iter<'s> {
    /// An iterator over nothing, used for missing keys.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Locks `cell` shared and snapshots its head.
    pub fn over(cell: &ListCell, store: &'s BlockStore) -> Result<Self> {
        let guard = cell.read_arc();
        let ids: SmallVec<[u32; 8]> = guard.block_ids().unpack()?.into();
        let available = guard.num_values_valid();
        Ok(Self {
            inner: Some(Inner {
                guard,
                store,
                ids,
                next_block: 0,
                buf: Vec::new(),
                offset: 0,
                phase: Phase::LoadBlock,
                available,
            }),
        })
    }

    /// Live values remaining. Zero for exhausted or empty iterators.
    pub fn available(&self) -> u32 {
        self.inner.as_ref().map_or(0, |inner| inner.available)
    }

    /// Whether another live value remains.
    pub fn has_next(&self) -> bool {
        self.available() > 0
    }

    /// Yields the next live value. The returned slice is valid until the
    /// iterator advances or is dropped.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<&[u8]>> {
        let Some(inner) = &mut self.inner else {
            return Ok(None);
        };
        if inner.available == 0 {
            return Ok(None);
        }
        loop {
            match inner.phase {
                Phase::LoadBlock => {
                    if inner.next_block < inner.ids.len() {
                        let id = inner.ids[inner.next_block];
                        inner
                            .buf
                            .resize(inner.store.block_size() as usize, 0);
                        inner.store.read(id, &mut inner.buf)?;
                        inner.next_block += 1;
                        inner.offset = 0;
                        inner.phase = Phase::InBlock;
                    } else {
                        inner.offset = 0;
                        inner.phase = Phase::Tail;
                    }
                }
                Phase::InBlock => match block::entry_at(&inner.buf, inner.offset)? {
                    Some((entry, next)) => {
                        inner.offset = next;
                        if entry.tombstoned {
                            continue;
                        }
                        inner.available -= 1;
                        return Ok(Some(&inner.buf[entry.value]));
                    }
                    None => {
                        inner.phase = Phase::LoadBlock;
                    }
                },
                Phase::Tail => {
                    let bytes = match inner.guard.tail_bytes() {
                        Some(bytes) => bytes,
                        None => {
                            inner.phase = Phase::Done;
                            continue;
                        }
                    };
                    match block::entry_at(bytes, inner.offset)? {
                        Some((entry, next)) => {
                            inner.offset = next;
                            if entry.tombstoned {
                                continue;
                            }
                            inner.available -= 1;
                            return Ok(Some(&bytes[entry.value]));
                        }
                        None => {
                            inner.phase = Phase::Done;
                        }
                    }
                }
                Phase::Done => {
                    inner.available = 0;
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::List;
    use tempfile::tempdir;

    fn test_store(block_size: u32) -> (tempfile::TempDir, BlockStore) {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(
            &dir.path().join("iter.values"),
            block_size,
            block_size * 4,
            false,
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn empty_iterator_yields_nothing() {
        let mut iter = Iter::empty();
        assert!(!iter.has_next());
        assert_eq!(iter.available(), 0);
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn iterator_over_empty_list() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        let mut iter = Iter::over(&cell, &store).unwrap();
        assert!(!iter.has_next());
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn available_decreases_per_next() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        {
            let mut list = cell.write();
            for i in 0..10u32 {
                list.append(&i.to_le_bytes(), &store).unwrap();
            }
        }
        let mut iter = Iter::over(&cell, &store).unwrap();
        for expected in (1..=10u32).rev() {
            assert_eq!(iter.available(), expected);
            assert!(iter.next().unwrap().is_some());
        }
        assert_eq!(iter.available(), 0);
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn tombstoned_values_are_skipped() {
        let (_dir, store) = test_store(64);
        let cell = List::new_cell();
        {
            let mut list = cell.write();
            for value in [b"a" as &[u8], b"b", b"c", b"d"] {
                list.append(value, &store).unwrap();
            }
            list.remove_where(&store, false, &mut |value| Ok(value == b"b" || value == b"d"))
                .unwrap();
        }
        let mut iter = Iter::over(&cell, &store).unwrap();
        assert_eq!(iter.available(), 2);
        assert_eq!(iter.next().unwrap().unwrap(), b"a");
        assert_eq!(iter.next().unwrap().unwrap(), b"c");
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn iterator_blocks_writers_while_alive() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let (_dir, store) = test_store(64);
        let store = Arc::new(store);
        let cell = List::new_cell();
        cell.write().append(b"v", &store).unwrap();

        let iter = Iter::over(&cell, &store).unwrap();
        let appended = Arc::new(AtomicBool::new(false));
        let handle = {
            let cell = Arc::clone(&cell);
            let store = Arc::clone(&store);
            let appended = Arc::clone(&appended);
            std::thread::spawn(move || {
                let mut list = cell.write();
                appended.store(true, Ordering::SeqCst);
                list.append(b"w", &store).unwrap();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!appended.load(Ordering::SeqCst), "writer ran under reader lock");
        drop(iter);
        handle.join().unwrap();
        assert!(appended.load(Ordering::SeqCst));
        assert_eq!(cell.read().num_values_valid(), 2);
    }
}
