//! # Wire Encodings
//!
//! Pure codecs shared by the storage layer and the tool surface:
//!
//! - [`varint`]: little-endian u32 varints and the tagged value headers
//!   that carry the tombstone bit.
//! - [`uints`]: delta-compressed ascending block-ID sequences.
//! - [`base64`]: the import/export text codec.

pub mod base64;
pub mod uints;
pub mod varint;

pub use uints::UintSequence;
