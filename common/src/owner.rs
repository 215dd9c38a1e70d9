//! Single-writer owners for the replicated metadata maps. Readers take a
//! cheap snapshot (`Arc` clone) and never observe a partially applied
//! update; the write lock is held only for the pointer swap.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub trait Versioned {
    fn version(&self) -> i64;
    fn set_version(&mut self, v: i64);
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum OwnerError {
    #[error("stale version: have {have}, got {got}")]
    Stale { have: i64, got: i64 },
    #[error("divergent copy at version {0}")]
    Divergent(i64),
}

pub struct MetaOwner<T> {
    cur: RwLock<Arc<T>>,
}

impl<T: Versioned + PartialEq + Clone> MetaOwner<T> {
    pub fn new(init: T) -> Self {
        Self {
            cur: RwLock::new(Arc::new(init)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<T>> {
        self.cur.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<T>> {
        self.cur.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the current map. Stays valid and immutable even if a
    /// newer version is published while the caller holds it.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.read())
    }

    /// Apply a replicated copy. Accepted iff strictly newer; an equal
    /// version must be an identical copy (no-op) or the put is rejected.
    /// Returns whether the copy was applied.
    pub fn put(&self, next: T) -> Result<bool, OwnerError> {
        let mut cur = self.write();
        let have = cur.version();
        let got = next.version();
        if got < have {
            return Err(OwnerError::Stale { have, got });
        }
        if got == have {
            if **cur == next {
                return Ok(false);
            }
            return Err(OwnerError::Divergent(got));
        }
        *cur = Arc::new(next);
        Ok(true)
    }

    /// Primary-only read-modify-write: clones the current map, applies
    /// `mutate`, bumps the version by one and publishes atomically. The
    /// closure must not suspend.
    pub fn publish<F: FnOnce(&mut T)>(&self, mutate: F) -> Arc<T> {
        let mut cur = self.write();
        let mut next = (**cur).clone();
        let v = next.version();
        mutate(&mut next);
        next.set_version(v + 1);
        let next = Arc::new(next);
        *cur = Arc::clone(&next);
        next
    }
}
