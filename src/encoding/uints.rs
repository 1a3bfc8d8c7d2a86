//! # Delta-Compressed Uint Sequence
//!
//! Packs a strictly increasing sequence of 32-bit block IDs into a
//! compact byte buffer: the first value and every following delta are
//! varint-encoded, and the raw last value is kept in 4 trailing bytes so
//! an append can compute the next delta without rescanning the buffer.
//!
//! ```text
//! [varint(v0)][varint(v1 - v0)]...[varint(vn - vn-1)][vn as u32 LE]
//! ```
//!
//! The serialized form (the list head's `blob`) is the buffer verbatim,
//! trailing raw word included.
//!
//! `add` rejects deltas above [`MAX_UINT_DELTA`] and leaves the sequence
//! unchanged in that case.

use eyre::{ensure, Result};

use crate::config::MAX_UINT_DELTA;
use crate::encoding::varint;

/// Strictly increasing u32 sequence with delta-varint storage.
#[derive(Clone, Debug, Default)]
pub struct UintSequence {
    /// Varint deltas followed by the raw last value, or empty.
    data: Vec<u8>,
}

impl UintSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a sequence from a serialized blob.
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        ensure!(
            blob.is_empty() || blob.len() > 4,
            "uint sequence blob of {} bytes is malformed",
            blob.len()
        );
        let sequence = Self {
            data: blob.to_vec(),
        };
        // Validate eagerly so corruption surfaces at load, not mid-scan.
        sequence.unpack()?;
        Ok(sequence)
    }

    /// The serialized form, suitable for [`Self::from_bytes`].
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends `value`, which must exceed the last stored value. Returns
    /// `false` (leaving the sequence unchanged) if the delta does not fit
    /// in a 4-byte varint.
    pub fn add(&mut self, value: u32) -> bool {
        let delta = match self.last() {
            None => value,
            Some(last) => {
                debug_assert!(value > last, "uint sequence requires ascending values");
                value - last
            }
        };
        if delta > MAX_UINT_DELTA {
            return false;
        }
        if !self.data.is_empty() {
            self.data.truncate(self.data.len() - 4);
        }
        let mut scratch = [0u8; 5];
        let nbytes = varint::encode_u32(delta, &mut scratch);
        self.data.extend_from_slice(&scratch[..nbytes]);
        self.data.extend_from_slice(&value.to_le_bytes());
        true
    }

    /// The last value, read from the raw tail word.
    pub fn last(&self) -> Option<u32> {
        if self.data.is_empty() {
            return None;
        }
        let tail = &self.data[self.data.len() - 4..];
        Some(u32::from_le_bytes(tail.try_into().unwrap()))
    }

    /// Materializes the ascending sequence.
    pub fn unpack(&self) -> Result<Vec<u32>> {
        let mut values = Vec::new();
        if self.data.is_empty() {
            return Ok(values);
        }
        let deltas = &self.data[..self.data.len() - 4];
        let mut offset = 0;
        let mut value: u32 = 0;
        while offset < deltas.len() {
            let (delta, nbytes) = varint::decode_u32(&deltas[offset..])?;
            offset += nbytes;
            value = value
                .checked_add(delta)
                .ok_or_else(|| eyre::eyre!("uint sequence overflows u32"))?;
            values.push(value);
        }
        ensure!(
            values.last() == self.last().as_ref(),
            "uint sequence tail does not match decoded values"
        );
        Ok(values)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
