//! # Block Store
//!
//! Append-only file of fixed-size block slots with an in-memory write
//! buffer. Appends land in the buffer and are flushed to the file with one
//! sequential write when the buffer fills; reads hit the buffer for
//! not-yet-flushed blocks and use positioned reads otherwise. Block IDs
//! are assigned monotonically: `id = num_blocks_on_disk + buffer_index`.
//!
//! ## Concurrency
//!
//! All operations are thread-safe. An internal mutex protects the write
//! buffer and the block counter and is held across the file I/O of the
//! operation, so readers never observe a half-flushed buffer.
//!
//! ## Access Pattern Advice
//!
//! [`BlockStore::advise`] forwards the expected access pattern to the OS
//! (`posix_fadvise` on unix, no-op elsewhere). Partition scans switch to
//! sequential around full iterations and back to random afterwards.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::error::{report, ErrorKind};

/// Expected access pattern hint for the backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessPattern {
    Random,
    Sequential,
}

struct StoreState {
    num_blocks_on_disk: u32,
    /// Staged full blocks, always a whole number of slots.
    buffer: Vec<u8>,
}

/// Append-only block file with a bounded write buffer.
pub struct BlockStore {
    file: File,
    path: PathBuf,
    block_size: u32,
    buffer_capacity: usize,
    read_only: bool,
    state: Mutex<StoreState>,
}

impl BlockStore {
    /// Opens (or creates, when writable) the block file at `path`.
    pub fn open(path: &Path, block_size: u32, buffer_size: u32, read_only: bool) -> Result<Self> {
        ensure!(block_size > 0, "block size must be positive");
        ensure!(
            buffer_size as usize % block_size as usize == 0 && buffer_size >= block_size,
            "buffer size {} is not a multiple of block size {}",
            buffer_size,
            block_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open values file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        if file_size % block_size as u64 != 0 {
            return Err(report(
                ErrorKind::Corrupt,
                format!(
                    "values file '{}' size {} is not a multiple of block size {}",
                    path.display(),
                    file_size,
                    block_size
                ),
            ));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            buffer_capacity: buffer_size as usize,
            read_only,
            state: Mutex::new(StoreState {
                num_blocks_on_disk: (file_size / block_size as u64) as u32,
                buffer: Vec::with_capacity(if read_only { 0 } else { buffer_size as usize }),
            }),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Total blocks appended so far, flushed or buffered.
    pub fn num_blocks(&self) -> u32 {
        let state = self.state.lock();
        state.num_blocks_on_disk + self.buffered_blocks(&state)
    }

    fn buffered_blocks(&self, state: &StoreState) -> u32 {
        (state.buffer.len() / self.block_size as usize) as u32
    }

    /// Appends a full block image and returns its ID.
    pub fn append(&self, block: &[u8]) -> Result<u32> {
        ensure!(
            block.len() == self.block_size as usize,
            "block of {} bytes appended to a store with block size {}",
            block.len(),
            self.block_size
        );
        if self.read_only {
            return Err(report(
                ErrorKind::InvalidArgument,
                "append on a read-only store",
            ));
        }
        let mut state = self.state.lock();
        if state.buffer.len() == self.buffer_capacity {
            self.flush_locked(&mut state)?;
        }
        let id = state.num_blocks_on_disk + self.buffered_blocks(&state);
        state.buffer.extend_from_slice(block);
        Ok(id)
    }

    /// Reads the block `id` into `out`, from the buffer if it has not been
    /// flushed yet.
    pub fn read(&self, id: u32, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() == self.block_size as usize,
            "output buffer of {} bytes for block size {}",
            out.len(),
            self.block_size
        );
        let state = self.state.lock();
        let total = state.num_blocks_on_disk + self.buffered_blocks(&state);
        ensure!(id < total, "invalid block id {} (store has {})", id, total);
        if id >= state.num_blocks_on_disk {
            let offset = (id - state.num_blocks_on_disk) as usize * self.block_size as usize;
            out.copy_from_slice(&state.buffer[offset..offset + self.block_size as usize]);
            return Ok(());
        }
        read_exact_at(&self.file, out, id as u64 * self.block_size as u64)
            .wrap_err_with(|| format!("failed to read block {} from '{}'", id, self.path.display()))
    }

    /// Rewrites an existing block in place; used when tombstones are
    /// written back into committed blocks.
    pub fn replace(&self, id: u32, block: &[u8]) -> Result<()> {
        ensure!(
            block.len() == self.block_size as usize,
            "block of {} bytes replaced in a store with block size {}",
            block.len(),
            self.block_size
        );
        if self.read_only {
            return Err(report(
                ErrorKind::InvalidArgument,
                "replace on a read-only store",
            ));
        }
        let mut state = self.state.lock();
        let total = state.num_blocks_on_disk + self.buffered_blocks(&state);
        ensure!(id < total, "invalid block id {} (store has {})", id, total);
        if id >= state.num_blocks_on_disk {
            let offset = (id - state.num_blocks_on_disk) as usize * self.block_size as usize;
            state.buffer[offset..offset + self.block_size as usize].copy_from_slice(block);
            return Ok(());
        }
        write_all_at(&self.file, block, id as u64 * self.block_size as u64).wrap_err_with(|| {
            format!("failed to rewrite block {} in '{}'", id, self.path.display())
        })
    }

    /// Drains the write buffer to disk.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut StoreState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let flushed = self.buffered_blocks(state);
        let offset = state.num_blocks_on_disk as u64 * self.block_size as u64;
        write_all_at(&self.file, &state.buffer, offset)
            .wrap_err_with(|| format!("failed to flush store '{}'", self.path.display()))?;
        state.num_blocks_on_disk += flushed;
        state.buffer.clear();
        Ok(())
    }

    /// Flushes and forces file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.flush()?;
        if !self.read_only {
            self.file
                .sync_all()
                .wrap_err_with(|| format!("failed to sync store '{}'", self.path.display()))?;
        }
        Ok(())
    }

    /// Hints the OS about the upcoming access pattern.
    pub fn advise(&self, pattern: AccessPattern) {
        advise_file(&self.file, pattern);
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks())
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn write_all_at(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

#[cfg(unix)]
fn advise_file(file: &File, pattern: AccessPattern) {
    use std::os::unix::io::AsRawFd;
    let advice = match pattern {
        AccessPattern::Random => libc::POSIX_FADV_RANDOM,
        AccessPattern::Sequential => libc::POSIX_FADV_SEQUENTIAL,
    };
    // Purely advisory; failure changes nothing observable.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
    }
}

#[cfg(not(unix))]
fn advise_file(_file: &File, _pattern: AccessPattern) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block(store: &BlockStore, fill: u8) -> Vec<u8> {
        vec![fill; store.block_size() as usize]
    }

    #[test]
    fn append_assigns_sequential_ids() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("s.values"), 64, 256, false).unwrap();
        for i in 0..10u8 {
            let id = store.append(&block(&store, i)).unwrap();
            assert_eq!(id, i as u32);
        }
        assert_eq!(store.num_blocks(), 10);
    }

    #[test]
    fn read_hits_buffer_and_disk() {
        let dir = tempdir().unwrap();
        // Buffer holds two blocks, so ids 0..2 flush when 4 are appended.
        let store = BlockStore::open(&dir.path().join("s.values"), 64, 128, false).unwrap();
        for i in 0..4u8 {
            store.append(&block(&store, i)).unwrap();
        }
        let mut out = vec![0u8; 64];
        for i in 0..4u8 {
            store.read(i as u32, &mut out).unwrap();
            assert_eq!(out, block(&store, i), "block {i}");
        }
    }

    #[test]
    fn read_of_unallocated_id_fails() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("s.values"), 64, 128, false).unwrap();
        store.append(&block(&store, 1)).unwrap();
        let mut out = vec![0u8; 64];
        assert!(store.read(1, &mut out).is_err());
    }

    #[test]
    fn replace_in_buffer_and_on_disk() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("s.values"), 64, 128, false).unwrap();
        for i in 0..3u8 {
            store.append(&block(&store, i)).unwrap();
        }
        // Block 0 was flushed when block 2 arrived; block 2 is buffered.
        store.replace(0, &block(&store, 0xF0)).unwrap();
        store.replace(2, &block(&store, 0xF2)).unwrap();
        let mut out = vec![0u8; 64];
        store.read(0, &mut out).unwrap();
        assert_eq!(out, block(&store, 0xF0));
        store.read(2, &mut out).unwrap();
        assert_eq!(out, block(&store, 0xF2));
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.values");
        {
            let store = BlockStore::open(&path, 64, 256, false).unwrap();
            for i in 0..3u8 {
                store.append(&block(&store, i)).unwrap();
            }
            store.flush().unwrap();
        }
        let store = BlockStore::open(&path, 64, 256, false).unwrap();
        assert_eq!(store.num_blocks(), 3);
        let mut out = vec![0u8; 64];
        store.read(1, &mut out).unwrap();
        assert_eq!(out, block(&store, 1));
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.values");
        {
            let store = BlockStore::open(&path, 64, 256, false).unwrap();
            store.append(&vec![7u8; 64]).unwrap();
            store.flush().unwrap();
        }
        let store = BlockStore::open(&path, 64, 256, true).unwrap();
        assert!(store.append(&vec![8u8; 64]).is_err());
        assert!(store.replace(0, &vec![8u8; 64]).is_err());
        let mut out = vec![0u8; 64];
        store.read(0, &mut out).unwrap();
        assert_eq!(out, vec![7u8; 64]);
    }

    #[test]
    fn misaligned_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.values");
        std::fs::write(&path, [0u8; 100]).unwrap();
        let err = BlockStore::open(&path, 64, 256, false).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::Corrupt)
        );
    }

    #[test]
    fn buffer_overflow_triggers_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.values");
        let store = BlockStore::open(&path, 64, 128, false).unwrap();
        for i in 0..5u8 {
            store.append(&block(&store, i)).unwrap();
        }
        // Two flushes happened; at least two blocks are on disk.
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert!(on_disk >= 2 * 64, "expected flushed blocks, got {on_disk}");
        assert_eq!(store.num_blocks(), 5);
    }
}
