//! # Partition Statistics
//!
//! Each partition persists a fixed 104-byte little-endian record of u64
//! counters next to its keys and values files. The last field is a
//! CRC-64/ECMA checksum over the preceding 96 bytes; a mismatch on read
//! reports the file as corrupt.
//!
//! ## Record Layout
//!
//! ```text
//! Offset  Field
//! 0       block_size
//! 8       num_blocks
//! 16      num_keys
//! 24      num_values_added
//! 32      num_values_removed
//! 40      num_values_unowned
//! 48      key_size_min
//! 56      key_size_max
//! 64      key_size_avg
//! 72      list_size_min
//! 80      list_size_max
//! 88      list_size_avg
//! 96      checksum
//! ```
//!
//! `num_values_added` and `num_values_removed` are lifetime counters; they
//! survive close/open cycles even for values whose list head is no longer
//! persisted. `num_values_unowned` counts values stranded in the store by
//! whole-key removal.

use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use zerocopy::{
    byteorder::{LittleEndian, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::error::{report, ErrorKind};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Size of the serialized record in bytes.
pub const STATS_RECORD_SIZE: usize = 104;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct StatsRecord {
    block_size: U64<LittleEndian>,
    num_blocks: U64<LittleEndian>,
    num_keys: U64<LittleEndian>,
    num_values_added: U64<LittleEndian>,
    num_values_removed: U64<LittleEndian>,
    num_values_unowned: U64<LittleEndian>,
    key_size_min: U64<LittleEndian>,
    key_size_max: U64<LittleEndian>,
    key_size_avg: U64<LittleEndian>,
    list_size_min: U64<LittleEndian>,
    list_size_max: U64<LittleEndian>,
    list_size_avg: U64<LittleEndian>,
    checksum: U64<LittleEndian>,
}

const _: () = assert!(
    std::mem::size_of::<StatsRecord>() == STATS_RECORD_SIZE,
    "StatsRecord layout drifted from the on-disk format"
);

/// Partition counters, also used as the aggregate over all partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub block_size: u64,
    pub num_blocks: u64,
    pub num_keys: u64,
    pub num_values_added: u64,
    pub num_values_removed: u64,
    pub num_values_unowned: u64,
    pub key_size_min: u64,
    pub key_size_max: u64,
    pub key_size_avg: u64,
    pub list_size_min: u64,
    pub list_size_max: u64,
    pub list_size_avg: u64,
}

impl Stats {
    /// Live values currently reachable through some key.
    pub fn num_values_valid(&self) -> u64 {
        self.num_values_added - self.num_values_removed - self.num_values_unowned
    }

    /// Sums counters across partitions; sizes aggregate as min/max and
    /// key-count-weighted averages.
    pub fn total(stats: &[Stats]) -> Stats {
        let mut out = Stats::default();
        let mut weighted_key_avg: u64 = 0;
        let mut weighted_list_avg: u64 = 0;
        for s in stats {
            out.block_size = out.block_size.max(s.block_size);
            out.num_blocks += s.num_blocks;
            out.num_keys += s.num_keys;
            out.num_values_added += s.num_values_added;
            out.num_values_removed += s.num_values_removed;
            out.num_values_unowned += s.num_values_unowned;
            out.key_size_max = out.key_size_max.max(s.key_size_max);
            out.list_size_max = out.list_size_max.max(s.list_size_max);
            if s.num_keys > 0 {
                out.key_size_min = if out.key_size_min == 0 {
                    s.key_size_min
                } else {
                    out.key_size_min.min(s.key_size_min)
                };
                out.list_size_min = if out.list_size_min == 0 {
                    s.list_size_min
                } else {
                    out.list_size_min.min(s.list_size_min)
                };
                weighted_key_avg += s.key_size_avg * s.num_keys;
                weighted_list_avg += s.list_size_avg * s.num_keys;
            }
        }
        if out.num_keys > 0 {
            out.key_size_avg = weighted_key_avg / out.num_keys;
            out.list_size_avg = weighted_list_avg / out.num_keys;
        }
        out
    }

    fn to_record(self) -> StatsRecord {
        let mut record = StatsRecord {
            block_size: U64::new(self.block_size),
            num_blocks: U64::new(self.num_blocks),
            num_keys: U64::new(self.num_keys),
            num_values_added: U64::new(self.num_values_added),
            num_values_removed: U64::new(self.num_values_removed),
            num_values_unowned: U64::new(self.num_values_unowned),
            key_size_min: U64::new(self.key_size_min),
            key_size_max: U64::new(self.key_size_max),
            key_size_avg: U64::new(self.key_size_avg),
            list_size_min: U64::new(self.list_size_min),
            list_size_max: U64::new(self.list_size_max),
            list_size_avg: U64::new(self.list_size_avg),
            checksum: U64::new(0),
        };
        let bytes = record.as_bytes();
        let checksum = CRC64.checksum(&bytes[..STATS_RECORD_SIZE - 8]);
        record.checksum = U64::new(checksum);
        record
    }

    fn from_record(record: &StatsRecord) -> Result<Self> {
        let bytes = record.as_bytes();
        let expected = CRC64.checksum(&bytes[..STATS_RECORD_SIZE - 8]);
        if record.checksum.get() != expected {
            return Err(report(
                ErrorKind::Corrupt,
                "stats record checksum mismatch",
            ));
        }
        Ok(Self {
            block_size: record.block_size.get(),
            num_blocks: record.num_blocks.get(),
            num_keys: record.num_keys.get(),
            num_values_added: record.num_values_added.get(),
            num_values_removed: record.num_values_removed.get(),
            num_values_unowned: record.num_values_unowned.get(),
            key_size_min: record.key_size_min.get(),
            key_size_max: record.key_size_max.get(),
            key_size_avg: record.key_size_avg.get(),
            list_size_min: record.list_size_min.get(),
            list_size_max: record.list_size_max.get(),
            list_size_avg: record.list_size_avg.get(),
        })
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let record = self.to_record();
        std::fs::write(path, record.as_bytes())
            .wrap_err_with(|| format!("failed to write stats file '{}'", path.display()))
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read stats file '{}'", path.display()))?;
        if bytes.len() != STATS_RECORD_SIZE {
            return Err(report(
                ErrorKind::Corrupt,
                format!(
                    "stats file '{}' has {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    STATS_RECORD_SIZE
                ),
            ));
        }
        let record = StatsRecord::ref_from_bytes(&bytes)
            .map_err(|e| report(ErrorKind::Corrupt, format!("bad stats record: {e:?}")))?;
        Self::from_record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use tempfile::tempdir;

    fn sample() -> Stats {
        Stats {
            block_size: 512,
            num_blocks: 10,
            num_keys: 3,
            num_values_added: 40,
            num_values_removed: 5,
            num_values_unowned: 2,
            key_size_min: 1,
            key_size_max: 9,
            key_size_avg: 4,
            list_size_min: 2,
            list_size_max: 20,
            list_size_avg: 11,
        }
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.stats");
        let stats = sample();
        stats.write_to_file(&path).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            STATS_RECORD_SIZE as u64
        );
        assert_eq!(Stats::read_from_file(&path).unwrap(), stats);
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.stats");
        sample().write_to_file(&path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[24] ^= 1;
        std::fs::write(&path, &bytes).unwrap();
        let err = Stats::read_from_file(&path).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Corrupt));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.stats");
        std::fs::write(&path, [0u8; 50]).unwrap();
        let err = Stats::read_from_file(&path).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Corrupt));
    }

    #[test]
    fn total_sums_and_weights() {
        let a = Stats {
            num_keys: 2,
            num_values_added: 10,
            key_size_min: 3,
            key_size_max: 5,
            key_size_avg: 4,
            list_size_min: 1,
            list_size_max: 8,
            list_size_avg: 5,
            ..sample()
        };
        let b = Stats {
            num_keys: 0,
            num_values_added: 0,
            num_values_removed: 0,
            num_values_unowned: 0,
            num_blocks: 0,
            key_size_min: 0,
            key_size_max: 0,
            key_size_avg: 0,
            list_size_min: 0,
            list_size_max: 0,
            list_size_avg: 0,
            ..sample()
        };
        let c = Stats {
            num_keys: 4,
            num_values_added: 20,
            key_size_min: 1,
            key_size_max: 4,
            key_size_avg: 2,
            list_size_min: 2,
            list_size_max: 3,
            list_size_avg: 3,
            ..sample()
        };
        let total = Stats::total(&[a, b, c]);
        assert_eq!(total.num_keys, 6);
        assert_eq!(total.num_values_added, 30);
        assert_eq!(total.key_size_min, 1);
        assert_eq!(total.key_size_max, 5);
        // (4*2 + 2*4) / 6 = 16/6 = 2
        assert_eq!(total.key_size_avg, 2);
        assert_eq!(total.list_size_min, 1);
        assert_eq!(total.list_size_max, 8);
    }

    #[test]
    fn valid_count_subtracts_removed_and_unowned() {
        let stats = sample();
        assert_eq!(stats.num_values_valid(), 33);
    }
}
