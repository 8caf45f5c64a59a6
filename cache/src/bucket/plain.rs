// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use super::{BucketState, BucketView, BUCKET_SIZE};
use crate::{hasher::Hasher, value::CachedValue};

pub const SLOTS: usize = 5;

/// Bucket layout of the plain cache: five hash/value slot pairs.
///
/// All methods require the bucket lock to be held; the atomics exist for
/// soundness of the shared-reference overlay, not for lock-free access, and
/// consistently use relaxed ordering -- the lock word publishes the data.
/// An empty slot holds a null value pointer (the hash slot is then
/// meaningless and kept at zero).
#[repr(C, align(64))]
pub struct PlainBucket {
    state: BucketState,
    hashes: [AtomicU32; SLOTS],
    values: [AtomicPtr<CachedValue>; SLOTS],
}

const _: () = assert!(mem::size_of::<PlainBucket>() == BUCKET_SIZE);

unsafe impl BucketView for PlainBucket {
    const SLOTS: usize = SLOTS;
}

impl PlainBucket {
    pub(crate) fn state(&self) -> &BucketState {
        &self.state
    }

    fn hash_at(&self, slot: usize) -> u32 {
        self.hashes[slot].load(Ordering::Relaxed)
    }

    pub(crate) fn value_at(&self, slot: usize) -> *mut CachedValue {
        self.values[slot].load(Ordering::Relaxed)
    }

    pub(crate) fn slot(&self, slot: usize) -> (u32, *mut CachedValue) {
        (self.hash_at(slot), self.value_at(slot))
    }

    fn set_slot(&self, slot: usize, hash: u32, value: *mut CachedValue) {
        self.hashes[slot].store(hash, Ordering::Relaxed);
        self.values[slot].store(value, Ordering::Relaxed);
    }

    pub(crate) fn is_full(&self) -> bool {
        !self.value_at(SLOTS - 1).is_null()
    }

    /// Slot index of the entry with the given key, if present.
    pub(crate) fn position<H: Hasher>(&self, hash: u32, key: &[u8]) -> Option<usize> {
        for slot in 0..SLOTS {
            let value = self.value_at(slot);
            if value.is_null() {
                break;
            }
            if self.hash_at(slot) == hash && H::same_key(unsafe { (*value).key() }, key) {
                return Some(slot);
            }
        }
        None
    }

    pub(crate) fn find<H: Hasher>(&self, hash: u32, key: &[u8]) -> Option<NonNull<CachedValue>> {
        self.position::<H>(hash, key)
            .and_then(|slot| NonNull::new(self.value_at(slot)))
    }

    /// Place a value into the first empty slot. The caller must have ensured
    /// there is space.
    pub(crate) fn insert(&self, hash: u32, value: *mut CachedValue) {
        debug_assert!(!value.is_null());
        for slot in 0..SLOTS {
            if self.value_at(slot).is_null() {
                self.set_slot(slot, hash, value);
                return;
            }
        }
        debug_assert!(false, "bucket full on insert");
    }

    /// Remove the entry at `slot`, compacting the occupied prefix, and return
    /// the evicted pointer.
    pub(crate) fn extract(&self, slot: usize) -> *mut CachedValue {
        let value = self.value_at(slot);
        debug_assert!(!value.is_null());

        let mut last = slot;
        for candidate in slot + 1..SLOTS {
            if self.value_at(candidate).is_null() {
                break;
            }
            last = candidate;
        }
        self.set_slot(slot, self.hash_at(last), self.value_at(last));
        self.set_slot(last, 0, ptr::null_mut());
        value
    }

    pub(crate) fn remove<H: Hasher>(&self, hash: u32, key: &[u8]) -> Option<*mut CachedValue> {
        self.position::<H>(hash, key).map(|slot| self.extract(slot))
    }

    /// Zero out all slots without touching the values they pointed to.
    /// Ownership must have been transferred or released beforehand.
    pub(crate) fn reset_slots(&self) {
        for slot in 0..SLOTS {
            self.set_slot(slot, 0, ptr::null_mut());
        }
    }

    /// First slot whose value no reader holds on to. Entries with a nonzero
    /// reference count are never eligible.
    pub(crate) fn eviction_candidate(&self) -> Option<usize> {
        for slot in 0..SLOTS {
            let value = self.value_at(slot);
            if value.is_null() {
                break;
            }
            if unsafe { (*value).is_freeable() } {
                return Some(slot);
            }
        }
        None
    }
}
