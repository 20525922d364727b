//! Crate-wide tunables.
//!
//! The on-disk inode geometry (direct table size, indirect fan-out, magic
//! number) is a fixed binary format, not a runtime knob, so it lives as
//! `const`s next to [`crate::inode`] rather than here. `Config` only
//! covers the one thing that is legitimately a deployment choice: how
//! many frames the buffer cache holds.

/// Runtime configuration for a [`crate::cache::BufferCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of cache slots (N). A reference deployment uses 64.
    pub cache_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { cache_slots: 64 }
    }
}

impl Config {
    /// Returns a config with `cache_slots` set to `n`.
    pub fn with_cache_slots(n: usize) -> Self {
        Self { cache_slots: n }
    }
}
