// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering},
};

use super::{BucketState, BucketView, Flag, BUCKET_SIZE};
use crate::{hasher::Hasher, value::CachedValue};

pub const SLOTS: usize = 3;
pub const BANISH_SLOTS: usize = 3;

/// Bucket layout of the transactional cache.
///
/// Next to three hash/value slot pairs the bucket records up to three
/// banished hashes, versioned by `banish_term`. When the recorded term is
/// older than the transaction manager's current one the whole banish list is
/// stale and reset in one step -- the structure heals itself lazily on first
/// touch instead of requiring a global sweep at term changes.
///
/// All methods require the bucket lock to be held (relaxed atomics, the lock
/// publishes). Empty value slots hold null; empty banish slots hold zero,
/// which no hasher ever produces.
#[repr(C, align(64))]
pub struct TransactionalBucket {
    state: BucketState,
    banish_term: AtomicU64,
    hashes: [AtomicU32; SLOTS],
    banish_hashes: [AtomicU32; BANISH_SLOTS],
    values: [AtomicPtr<CachedValue>; SLOTS],
}

const _: () = assert!(mem::size_of::<TransactionalBucket>() == BUCKET_SIZE);

unsafe impl BucketView for TransactionalBucket {
    const SLOTS: usize = SLOTS;
}

impl TransactionalBucket {
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

    pub(crate) fn banish_term(&self) -> u64 {
        self.banish_term.load(Ordering::Relaxed)
    }

    /// Refresh the bucket's banish state for the given term. A term newer
    /// than the recorded one invalidates the entire banish list.
    pub(crate) fn update_banish_term(&self, term: u64) {
        if self.banish_term.load(Ordering::Relaxed) < term {
            self.banish_term.store(term, Ordering::Relaxed);
            for slot in 0..BANISH_SLOTS {
                self.banish_hashes[slot].store(0, Ordering::Relaxed);
            }
            if self.state.is_set(Flag::Banished) {
                self.state.toggle(Flag::Banished);
            }
        }
    }

    /// Whether `hash` is banished at `term`.
    pub(crate) fn is_banished(&self, hash: u32, term: u64) -> bool {
        self.update_banish_term(term);
        if !self.state.is_set(Flag::Banished) {
            return false;
        }
        self.banish_hashes
            .iter()
            .any(|h| h.load(Ordering::Relaxed) == hash)
    }

    /// Record `hash` as banished at `term`, dropping the oldest entry when
    /// the list is full.
    pub(crate) fn banish(&self, hash: u32, term: u64) {
        self.update_banish_term(term);

        let mut free = None;
        for slot in 0..BANISH_SLOTS {
            let current = self.banish_hashes[slot].load(Ordering::Relaxed);
            if current == hash {
                return;
            }
            if current == 0 && free.is_none() {
                free = Some(slot);
            }
        }

        match free {
            Some(slot) => self.banish_hashes[slot].store(hash, Ordering::Relaxed),
            None => {
                // full: age out the oldest entry
                for slot in 1..BANISH_SLOTS {
                    let next = self.banish_hashes[slot].load(Ordering::Relaxed);
                    self.banish_hashes[slot - 1].store(next, Ordering::Relaxed);
                }
                self.banish_hashes[BANISH_SLOTS - 1].store(hash, Ordering::Relaxed);
            },
        }

        if !self.state.is_set(Flag::Banished) {
            self.state.toggle(Flag::Banished);
        }
    }

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

    /// Zero out all value slots without touching the values they pointed to.
    /// Ownership must have been transferred or released beforehand. Banish
    /// state is left in place.
    pub(crate) fn reset_slots(&self) {
        for slot in 0..SLOTS {
            self.set_slot(slot, 0, ptr::null_mut());
        }
    }

    /// Reset value slots, banish list and banish term. Used when the bucket
    /// is wiped for table reuse.
    pub(crate) fn reset_all(&self) {
        self.reset_slots();
        for slot in 0..BANISH_SLOTS {
            self.banish_hashes[slot].store(0, Ordering::Relaxed);
        }
        self.banish_term.store(0, Ordering::Relaxed);
    }

    pub(crate) fn banish_hash_at(&self, slot: usize) -> u32 {
        self.banish_hashes[slot].load(Ordering::Relaxed)
    }

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
