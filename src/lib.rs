//! A sector buffer cache and multi-level inode core for a small
//! educational file system.
//!
//! Two pieces compose into a storage stack:
//!
//! * [`cache::BufferCache`] sits in front of one or more
//!   [`device::BlockDevice`]s, holding a fixed number of 512-byte frames
//!   and evicting under a second-chance (clock-sweep) policy.
//! * [`inode::InodeTable`] maps a sector to an extensible multi-level
//!   inode (direct table, singly-indirect, doubly-indirect) built on top
//!   of a [`cache::BufferCache`], with reference-counted open handles
//!   and deferred delete.
//!
//! [`alloc::SectorAllocator`] is the inode module's only dependency on
//! free-space tracking, which is out of scope here; [`alloc::BitmapAllocator`]
//! is a reference implementation used by this crate's own test suite.

pub mod alloc;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod inode;
pub mod lock;

pub use cache::BufferCache;
pub use config::Config;
pub use device::{BlockDevice, DeviceId, MemDevice, SectorId};
pub use error::{AllocError, DeviceError, FsError};
pub use inode::{InodeHandle, InodeTable};
