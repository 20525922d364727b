//! Named lock wrappers.
//!
//! The cache and inode modules distinguish locks by the role they play
//! rather than by implementation: a [`SpinLock`] guards a short critical
//! section (index lookups, registry bookkeeping) that never blocks on
//! device I/O, while a [`SleepLock`] guards state that may be held across
//! a block device call (a cache slot's frame, an inode's growth). On a
//! hosted target both are plain `std::sync::Mutex`es; the distinction is
//! kept because it documents which locks are safe to nest under which:
//! no thread holds two slot locks at once outside of [`crate::cache::BufferCache::flush`].

use std::sync::{Mutex, MutexGuard};

mod sealed {
    pub trait Sealed {}
}

/// Marker distinguishing lock roles. Not implementable outside this crate.
pub trait LockKind: sealed::Sealed {}

/// Role marker for short, non-blocking critical sections.
pub struct Spin;
/// Role marker for locks that may be held across device I/O.
pub struct Sleep;

impl sealed::Sealed for Spin {}
impl sealed::Sealed for Sleep {}
impl LockKind for Spin {}
impl LockKind for Sleep {}

/// A lock tagged with its intended role. See the module documentation.
pub struct RoleLock<K: LockKind, T> {
    inner: Mutex<T>,
    _role: core::marker::PhantomData<K>,
}

impl<K: LockKind, T> RoleLock<K, T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
            _role: core::marker::PhantomData,
        }
    }

    /// Acquires the lock, recovering from poisoning.
    ///
    /// A panic while holding one of these locks during a test indicates a
    /// bug severe enough that the data may be inconsistent; recovering
    /// instead of propagating the poison keeps the rest of the test suite
    /// from cascading into unrelated failures.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A lock for short critical sections that never block on I/O
/// (cache index lookups, inode registry bookkeeping).
pub type SpinLock<T> = RoleLock<Spin, T>;

/// A lock for state that may be held across a block device call
/// (a cache slot's frame, an inode's growth protocol).
pub type SleepLock<T> = RoleLock<Sleep, T>;
