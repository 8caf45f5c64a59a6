// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    hash::Hash,
    mem,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use rustc_hash::FxHashMap;

use crate::prng::SharedPrng;

/// Record types a [`FrequencyBuffer`] can store.
///
/// The backing store is an array of atomics of the same width as the record,
/// with `Default` as the "empty" sentinel.
pub trait Entry: Copy + Default + Eq + Ord + Hash + Send + Sync + 'static {
    type Atomic: Default + Send + Sync;

    fn load(atomic: &Self::Atomic) -> Self;
    fn store(atomic: &Self::Atomic, value: Self);
    fn compare_exchange(atomic: &Self::Atomic, current: Self, new: Self) -> bool;
}

impl Entry for u8 {
    type Atomic = AtomicU8;

    fn load(atomic: &AtomicU8) -> u8 {
        atomic.load(Ordering::Relaxed)
    }

    fn store(atomic: &AtomicU8, value: u8) {
        atomic.store(value, Ordering::Relaxed)
    }

    fn compare_exchange(atomic: &AtomicU8, current: u8, new: u8) -> bool {
        atomic
            .compare_exchange(current, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl Entry for u64 {
    type Atomic = AtomicU64;

    fn load(atomic: &AtomicU64) -> u64 {
        atomic.load(Ordering::Relaxed)
    }

    fn store(atomic: &AtomicU64, value: u64) {
        atomic.store(value, Ordering::Relaxed)
    }

    fn compare_exchange(atomic: &AtomicU64, current: u64, new: u64) -> bool {
        atomic
            .compare_exchange(current, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Find-statistics event records.
pub mod stat {
    pub const FIND_HIT: u8 = 1;
    pub const FIND_MISS: u8 = 2;
}

/// Lossy, lock-free sampler of recent events.
///
/// Writers drop their record at a PRNG-chosen slot; concurrent writes may
/// overwrite each other and readers may observe a mix of old and new values.
/// All of that is fine -- the buffer computes approximate relative
/// frequencies, nothing more. Capacity is rounded up to a power of two so a
/// mask drives the slot choice.
pub struct FrequencyBuffer<T: Entry> {
    prng: Arc<SharedPrng>,
    capacity: usize,
    mask: usize,
    buffer: Box<[T::Atomic]>,
}

impl<T: Entry> FrequencyBuffer<T> {
    pub fn new(prng: Arc<SharedPrng>, capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| T::Atomic::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            prng,
            capacity,
            mask: capacity - 1,
            buffer,
        }
    }

    /// The hidden allocation for a buffer of `capacity` records.
    pub const fn allocation_size(capacity: usize) -> usize {
        capacity * mem::size_of::<T>()
    }

    pub fn memory_usage(&self) -> usize {
        Self::allocation_size(self.capacity) + mem::size_of::<Self>()
    }

    pub fn insert(&self, record: T) {
        let slot = (self.prng.next() as usize) & self.mask;
        T::store(&self.buffer[slot], record);
    }

    /// Remove all occurrences of `record`.
    pub fn purge(&self, record: T) {
        let empty = T::default();
        for slot in self.buffer.iter() {
            let current = T::load(slot);
            if current == record {
                T::compare_exchange(slot, current, empty);
            }
        }
    }

    /// All recorded events with their approximate counts, sorted ascending by
    /// count with ties broken by the record itself.
    ///
    /// The ordering is part of the contract: both the windowed hit-rate
    /// reader and the manager's priority list rely on it.
    pub fn frequencies(&self) -> Vec<(T, u64)> {
        let empty = T::default();
        let mut counts: FxHashMap<T, u64> = FxHashMap::default();
        for slot in self.buffer.iter() {
            let record = T::load(slot);
            if record != empty {
                *counts.entry(record).or_insert(0) += 1;
            }
        }

        let mut data: Vec<(T, u64)> = counts.into_iter().collect();
        data.sort_unstable_by(|left, right| {
            left.1.cmp(&right.1).then_with(|| left.0.cmp(&right.0))
        });
        data
    }

    pub fn clear(&self) {
        let empty = T::default();
        for slot in self.buffer.iter() {
            T::store(slot, empty);
        }
    }
}
