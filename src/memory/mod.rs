//! # Memory Management
//!
//! [`arena`]: the bump-allocated interning arena that keeps key bytes
//! resident for the lifetime of a partition.

pub mod arena;

pub use arena::KeyArena;
