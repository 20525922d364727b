//! Structured error kinds.
//!
//! Recoverable conditions are reported as short counts or booleans at the
//! public `cache`/`inode` API, per the error handling policy: a sector
//! going missing is not an exception, it is a number smaller than the
//! caller asked for. `FsError` is the currency these layers use internally,
//! and the one payload a [`DeviceError`] or [`AllocError`] from an external
//! collaborator gets folded into before it crosses the inode API boundary.

use thiserror::Error;

/// Error returned by a [`crate::device::BlockDevice`] implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("sector {0} is out of range for this device")]
    OutOfRange(u32),
    #[error("device I/O failure: {0}")]
    Io(String),
}

/// Error returned by a [`crate::alloc::SectorAllocator`] implementation.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no free sector available")]
    OutOfSectors,
}

/// Unified error currency for the cache and inode modules.
///
/// Invariant violations (magic mismatch, `open_count` underflow,
/// `deny_write_count > open_count`) are *not* represented here: those are
/// programming errors and the implementation panics on them directly,
/// per the error handling policy.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("no free sector available")]
    NoFreeSector,
    #[error("offset/length out of range")]
    OutOfRange,
}

impl From<AllocError> for FsError {
    fn from(_: AllocError) -> Self {
        FsError::NoFreeSector
    }
}
