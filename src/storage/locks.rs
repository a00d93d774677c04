// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Keyed lock registry: one mutex per storage key, created on first use and
//! dropped from the registry once nobody holds or waits for it.
//!
//! Every slot carries a holder count that is only touched under the registry
//! mutex. Acquire bumps it before blocking on the slot; release decrements it,
//! unlocks the slot and removes it at zero, all under that same mutex. A key
//! can therefore never map to two live slots at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::error;

use crate::error::{Result, StoreError};

struct Slot {
    lock: Arc<Mutex<()>>,
    /// Handles held plus acquirers currently blocked on `lock`.
    holders: usize,
}

/// Registry of named locks.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `key` is held by the caller.
    pub fn acquire(&self, key: &str) -> LockHandle<'_> {
        let lock = self.checkout(key);
        let guard = lock.lock_arc();
        LockHandle { registry: self, key: key.to_string(), guard: Some(guard) }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn try_acquire_for(&self, key: &str, timeout: Duration) -> Option<LockHandle<'_>> {
        let lock = self.checkout(key);
        match lock.try_lock_arc_for(timeout) {
            Some(guard) => Some(LockHandle { registry: self, key: key.to_string(), guard: Some(guard) }),
            None => {
                if let Err(e) = self.checkin(key, None) {
                    error!(key, error = %e, "Lock registry out of balance after timed-out acquire");
                }
                None
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn checkout(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.to_string())
            .or_insert_with(|| Slot { lock: Arc::new(Mutex::new(())), holders: 0 });
        slot.holders += 1;
        slot.lock.clone()
    }

    /// Return one holder count for `key`, unlocking `guard` while the
    /// registry mutex is still held.
    fn checkin(&self, key: &str, guard: Option<ArcMutexGuard<RawMutex, ()>>) -> Result<()> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            drop(guard);
            return Err(StoreError::Lock {
                key: key.to_string(),
                reason: "released a key missing from the registry".into(),
            });
        };
        slot.holders -= 1;
        drop(guard);
        if slot.holders == 0 {
            slots.remove(key);
        }
        Ok(())
    }
}

/// Exclusive hold on one key. Released explicitly or on drop.
pub struct LockHandle<'a> {
    registry: &'a KeyedLocks,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl LockHandle<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        match self.guard.take() {
            Some(guard) => self.registry.checkin(&self.key, Some(guard)),
            None => Ok(()),
        }
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            error!(key = %self.key, error = %e, "Lock release failed");
        }
    }
}
