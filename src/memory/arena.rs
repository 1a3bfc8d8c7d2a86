//! # Key Arena
//!
//! Bump allocator that interns key bytes for the lifetime of a partition.
//! Keys are inserted once and never freed individually; the whole arena is
//! reset when the partition closes, after the key table has been cleared.
//!
//! The arena hands out `&'static [u8]` so interned keys can sit in a
//! `HashMap` without tying the map's type to an arena lifetime. The
//! `'static` is a promise kept by the owning partition, not by the type
//! system — see the safety notes on [`KeyArena::intern`].

use bumpalo::Bump;
use parking_lot::Mutex;

/// Interning arena for key bytes.
///
/// Thread-safe: interning takes an internal lock; the returned slices are
/// immutable and can be read from any thread.
#[derive(Default)]
pub struct KeyArena {
    bump: Mutex<Bump>,
}

impl KeyArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes` into the arena and returns a stable slice.
    ///
    /// # Safety contract
    ///
    /// The returned slice is *not* truly `'static`: it is valid until
    /// [`Self::reset`] or drop. The partition upholds this by declaring
    /// its key table before the arena (so the table drops first) and by
    /// clearing the table before any reset. No interned slice may escape
    /// the partition's public API by reference beyond a callback scope.
    pub fn intern(&self, bytes: &[u8]) -> &'static [u8] {
        let bump = self.bump.lock();
        let slice = bump.alloc_slice_copy(bytes);
        // SAFETY: Bump never moves or frees an allocation until reset()
        // or drop, and the Mutex only guards allocation, not access. The
        // owning partition guarantees every interned slice is unreachable
        // before the arena is reset or dropped.
        unsafe { std::slice::from_raw_parts(slice.as_ptr(), slice.len()) }
    }

    /// Total bytes handed out since the last reset.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.lock().allocated_bytes()
    }

    /// Frees every allocation. Callers must have dropped all interned
    /// slices first.
    pub fn reset(&self) {
        self.bump.lock().reset();
    }
}

impl std::fmt::Debug for KeyArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyArena")
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_bytes_are_stable_copies() {
        let arena = KeyArena::new();
        let mut source = b"hello".to_vec();
        let interned = arena.intern(&source);
        source[0] = b'X';
        assert_eq!(interned, b"hello");
    }

    #[test]
    fn many_interned_keys_stay_valid() {
        let arena = KeyArena::new();
        let keys: Vec<&[u8]> = (0..1000u32)
            .map(|i| arena.intern(format!("key-{i}").as_bytes()))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(*key, format!("key-{i}").as_bytes());
        }
        assert!(arena.allocated_bytes() > 0);
    }

    #[test]
    fn reset_reclaims_space() {
        let arena = KeyArena::new();
        arena.intern(&[0u8; 4096]);
        assert!(arena.allocated_bytes() >= 4096);
        arena.reset();
        assert_eq!(arena.allocated_bytes(), 0);
    }

    #[test]
    fn empty_key_is_representable() {
        let arena = KeyArena::new();
        let interned = arena.intern(b"");
        assert!(interned.is_empty());
    }
}
