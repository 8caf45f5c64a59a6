// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    cell::UnsafeCell,
    hint,
    mem,
    sync::atomic::{AtomicU32, Ordering},
};

pub mod plain;
pub mod transactional;

pub use plain::PlainBucket;
pub use transactional::TransactionalBucket;

/// Every bucket occupies exactly one cache line.
pub const BUCKET_SIZE: usize = 64;

/// Flags of a [`BucketState`] word. Each flag is a single bit; the lock flag
/// is the least significant one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Flag {
    Locked = 0x01,
    Migrated = 0x02,
    Banished = 0x04,
}

/// A 32-bit lock word with state flags for a bucket.
///
/// The lock is a plain spin lock with a tries budget; any flag access
/// requires the lock to be held. `triesGuarantee` semantics are inherited
/// from [`crate::sync::TRIES_GUARANTEE`].
pub struct BucketState {
    state: AtomicU32,
}

impl Default for BucketState {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }
}

impl BucketState {
    pub fn lock(&self, max_tries: u64) -> bool {
        let mut tries: u64 = 0;
        while tries < max_tries {
            let state = self.state.load(Ordering::Relaxed);
            if state & Flag::Locked as u32 == 0
                && self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | Flag::Locked as u32,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return true;
            }
            tries = tries.saturating_add(1);
            hint::spin_loop();
        }
        false
    }

    pub fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.state
            .fetch_and(!(Flag::Locked as u32), Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & Flag::Locked as u32 != 0
    }

    /// Requires the lock to be held.
    pub fn is_set(&self, flag: Flag) -> bool {
        debug_assert!(self.is_locked());
        self.state.load(Ordering::Relaxed) & flag as u32 != 0
    }

    /// Requires the lock to be held.
    pub fn toggle(&self, flag: Flag) {
        debug_assert!(self.is_locked());
        debug_assert!(flag != Flag::Locked);
        self.state.fetch_xor(flag as u32, Ordering::Relaxed);
    }

    /// Reset all flags but keep the lock held. Requires the lock to be held.
    pub fn clear(&self) {
        debug_assert!(self.is_locked());
        self.state.store(Flag::Locked as u32, Ordering::Relaxed);
    }
}

/// The type-erased bucket stored in a table.
///
/// A table does not know which cache flavor populates it; the cache
/// reinterprets locked buckets as [`PlainBucket`] or [`TransactionalBucket`].
/// Both overlays are `repr(C)` with this exact prefix, their mutable fields
/// are atomics, and an all-zero byte pattern is a valid empty bucket of
/// either flavor, so the reinterpretation is sound for shared references.
#[repr(C, align(64))]
pub struct GenericBucket {
    pub(crate) state: BucketState,
    // interior-mutable from the typed overlays' atomics
    _payload: UnsafeCell<[u8; BUCKET_SIZE - mem::size_of::<BucketState>()]>,
}

// payload mutation happens only through the overlays' atomics, under the
// bucket lock
unsafe impl Send for GenericBucket {}
unsafe impl Sync for GenericBucket {}

impl Default for GenericBucket {
    fn default() -> Self {
        Self {
            state: BucketState::default(),
            _payload: UnsafeCell::new([0; BUCKET_SIZE - mem::size_of::<BucketState>()]),
        }
    }
}

impl GenericBucket {
    pub(crate) fn state(&self) -> &BucketState {
        &self.state
    }

    /// Requires the lock to be held.
    pub(crate) fn is_migrated(&self) -> bool {
        self.state.is_set(Flag::Migrated)
    }
}

/// Marker for the typed overlays of [`GenericBucket`].
///
/// # Safety
///
/// Implementors must be `repr(C)`, 64 bytes, 64-byte aligned, start with a
/// [`BucketState`], and be valid for the all-zero byte pattern.
pub unsafe trait BucketView {
    /// Number of value slots per bucket.
    const SLOTS: usize;
}

const _: () = assert!(mem::size_of::<GenericBucket>() == BUCKET_SIZE);
const _: () = assert!(mem::align_of::<GenericBucket>() == BUCKET_SIZE);
