//! # Storage Layer
//!
//! The per-partition persistence primitives: [`Block`] packs values into
//! fixed-size buffers, [`BlockStore`] streams those buffers to and from
//! the partition's values file.

pub mod block;
pub mod store;

pub use block::{max_value_size, Block, BlockCursor, BlockEntry};
pub use store::{AccessPattern, BlockStore};
