//! Multi-reader / single-writer guard around the live engine handle.
//!
//! Every access to the handle goes through a scoped guard, so the lock is
//! released on every exit path. Restore takes the write side for the whole
//! close + reopen transition; everything else reads.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct ConcurrencyGuard<T> {
    inner: RwLock<T>,
}

impl<T> ConcurrencyGuard<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Block until no writer holds the lock
    pub fn acquire_read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// `None` if a writer holds the lock
    pub fn try_acquire_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    /// Block until every reader and writer is gone
    pub fn acquire_write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
