//! # Multimap - Persistent 1-to-N Key-Value Store
//!
//! An embeddable, thread-safe store mapping each key to an append-ordered
//! list of opaque byte values. Built for inverted-index workloads: keys
//! are moderate in number and kept fully in memory, while the values are
//! large in total and streamed to disk in fixed-size blocks.
//!
//! ## Quick Start
//!
//! ```ignore
//! use multimap::Map;
//!
//! let map = Map::create("./mymap")?;
//! map.put(b"word", b"doc-17")?;
//! map.put(b"word", b"doc-23")?;
//!
//! let mut iter = map.get(b"word")?;
//! while let Some(value) = iter.next()? {
//!     println!("{}", String::from_utf8_lossy(value));
//! }
//! map.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │           Public API (Map)          │  hash dispatch, dir lock, id
//! ├─────────────────────────────────────┤
//! │             Partitions              │  key table, arena, close
//! ├─────────────────────────────────────┤
//! │         Lists + Iterators           │  heads, tails, per-list locks
//! ├─────────────────────────────────────┤
//! │       Blocks + Block Store          │  value packing, write buffer
//! ├─────────────────────────────────────┤
//! │      Encodings (varint, uints)      │  headers, block-ID sequences
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! map_dir/
//! ├── multimap.id          # shape + version (32 bytes)
//! ├── multimap.lock        # advisory directory lock
//! ├── multimap.0.keys      # per-partition key table + list heads
//! ├── multimap.0.values    # per-partition block store
//! ├── multimap.0.stats     # per-partition counters (104 bytes)
//! └── ...
//! ```
//!
//! ## Concurrency
//!
//! Parallel OS threads over `&Map`. Readers of the same key share the
//! list's lock; a writer takes it exclusively. Iterators hold the shared
//! lock for their whole lifetime, so the values they yield stay valid and
//! appenders wait. Nothing times out; callers needing cancellation build
//! it above this crate.
//!
//! ## Module Overview
//!
//! - [`map`]: partition dispatch, directory lock, id file, offline ops
//! - [`partition`]: key table, open/close lifecycle, stats
//! - [`list`]: per-key lists and their iterators
//! - [`storage`]: value blocks and the append-only block store
//! - [`encoding`]: varints, block-ID sequences, Base64
//! - [`memory`]: the key-interning arena

pub mod cli;
pub mod config;
pub mod encoding;
pub mod error;
pub mod list;
pub mod map;
pub mod memory;
pub mod partition;
pub mod storage;

pub use config::{Options, MAX_KEY_SIZE};
pub use error::ErrorKind;
pub use list::Iter;
pub use storage::max_value_size;
pub use map::ops::{export_to_base64, import_from_base64, optimize, stats};
pub use map::Map;
pub use partition::Stats;
