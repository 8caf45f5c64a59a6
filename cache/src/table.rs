// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    mem,
    ptr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    bucket::{BucketView, GenericBucket, BUCKET_SIZE},
    sync::{ReadWriteSpinLock, TRIES_GUARANTEE},
};

pub const MIN_LOG_SIZE: u32 = 8;
pub const MAX_LOG_SIZE: u32 = 32;

/// Bucket addressing: either a key hash or a raw bucket index.
#[derive(Debug, Clone, Copy)]
pub enum HashOrId {
    Hash(u32),
    Id(usize),
}

/// An open-addressed array of `2^log_size` buckets.
///
/// A table is either enabled (serving lookups) or disabled (construction,
/// clearing, shutdown); lookups against a disabled table uniformly come back
/// empty-handed. During migration a second table is attached as "auxiliary":
/// a bucket carrying the MIGRATED flag redirects the lookup there, so readers
/// never wait on a migration in progress.
///
/// The table lock guards the shape fields (disabled, evictions, auxiliary,
/// slot bookkeeping); bucket contents are guarded by the per-bucket locks
/// alone. Lookups hold the table lock only for the read-mostly instant it
/// takes to locate and lock a bucket.
pub struct Table {
    lock: ReadWriteSpinLock<Shape>,
    log_size: u32,
    size: u64,
    shift: u32,
    mask: u32,
    ideal_lower_ratio: f64,
    ideal_upper_ratio: f64,
    buckets: Box<[GenericBucket]>,
    slots_total: AtomicU64,
    slots_used: AtomicU64,
}

struct Shape {
    disabled: bool,
    evictions: bool,
    auxiliary: Option<Arc<Table>>,
}

impl Table {
    pub fn new(log_size: u32, ideal_lower_ratio: f64, ideal_upper_ratio: f64) -> Self {
        let log_size = log_size.min(MAX_LOG_SIZE);
        let size = 1u64 << log_size;
        let buckets = (0..size)
            .map(|_| GenericBucket::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            lock: ReadWriteSpinLock::new(Shape {
                disabled: true,
                evictions: false,
                auxiliary: None,
            }),
            log_size,
            size,
            shift: 32 - log_size,
            mask: ((size - 1) as u32) << (32 - log_size),
            ideal_lower_ratio,
            ideal_upper_ratio,
            buckets,
            slots_total: AtomicU64::new(size),
            slots_used: AtomicU64::new(0),
        }
    }

    /// Memory footprint of a table with the given `log_size`.
    pub const fn allocation_size(log_size: u32) -> u64 {
        (mem::size_of::<Table>() as u64) + (BUCKET_SIZE as u64) * (1u64 << log_size)
    }

    pub fn memory_usage(&self) -> u64 {
        Self::allocation_size(self.log_size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    fn bucket_index(&self, hash: u32) -> usize {
        ((hash & self.mask) >> self.shift) as usize
    }

    /// Locate and lock the bucket for `bucket`, redirecting to the auxiliary
    /// table when the primary bucket has been migrated. An unlocked guard is
    /// a valid outcome once the tries budget is spent.
    pub fn fetch_and_lock_bucket(self: &Arc<Self>, bucket: HashOrId, max_tries: u64) -> BucketLocker {
        let (index, hash) = match bucket {
            HashOrId::Hash(hash) => (self.bucket_index(hash), Some(hash)),
            HashOrId::Id(index) => (index, None),
        };

        let auxiliary = {
            let guard = match self.lock.try_read(max_tries) {
                Some(guard) => guard,
                None => return BucketLocker::unlocked(),
            };
            if guard.disabled {
                return BucketLocker::unlocked();
            }

            let locker = BucketLocker::lock(Arc::clone(self), &self.buckets[index], max_tries);
            if !locker.is_locked() {
                return locker;
            }
            if !locker.generic().is_migrated() {
                return locker;
            }

            // primary bucket has moved; retry against the auxiliary table
            drop(locker);
            guard.auxiliary.clone()
        };

        match (auxiliary, hash) {
            (Some(auxiliary), Some(hash)) => {
                auxiliary.fetch_and_lock_bucket(HashOrId::Hash(hash), max_tries)
            },
            _ => BucketLocker::unlocked(),
        }
    }

    /// Lock the bucket at `index` in this table, ignoring its migration
    /// status. Used by the migration driver itself.
    pub(crate) fn lock_primary(self: &Arc<Self>, index: usize) -> BucketLocker {
        BucketLocker::lock(Arc::clone(self), &self.buckets[index], TRIES_GUARANTEE)
    }

    /// Install or clear the auxiliary table.
    ///
    /// Installing succeeds only when no auxiliary is attached yet; the
    /// rejected table is handed back to the caller. Passing `None` detaches
    /// and returns the current auxiliary.
    pub fn set_auxiliary(&self, table: Option<Arc<Table>>) -> Option<Arc<Table>> {
        let mut guard = self.lock.write();
        match table {
            None => guard.auxiliary.take(),
            Some(table) => {
                if guard.auxiliary.is_none() && !ptr::eq(table.as_ref(), self) {
                    guard.auxiliary = Some(table);
                    None
                } else {
                    Some(table)
                }
            },
        }
    }

    /// The sub-range of auxiliary buckets a primary bucket migrates into:
    /// a single bucket of a smaller auxiliary, or `2^diff` buckets of a
    /// larger one.
    pub(crate) fn auxiliary_buckets(&self, index: usize) -> Option<Subtable> {
        let guard = self.lock.read();
        let auxiliary = guard.auxiliary.clone()?;

        let subtable = if self.log_size > auxiliary.log_size {
            let diff = self.log_size - auxiliary.log_size;
            Subtable {
                base: index >> diff,
                len: 1,
                mask: 0,
                shift: 0,
                source: auxiliary,
            }
        } else {
            let diff = auxiliary.log_size - self.log_size;
            let len = 1usize << diff;
            Subtable {
                base: index << diff,
                len,
                mask: ((len - 1) as u32) << auxiliary.shift,
                shift: auxiliary.shift,
                source: auxiliary,
            }
        };
        Some(subtable)
    }

    /// Register how many value slots each bucket of the tenant cache offers.
    pub(crate) fn set_slots_per_bucket(&self, slots_per_bucket: usize) {
        let _guard = self.lock.write();
        self.slots_total
            .store(self.size * slots_per_bucket as u64, Ordering::Relaxed);
    }

    /// Reset to the empty, disabled state. The tenant cache must free bucket
    /// contents through `clearer` (values are owned by buckets, and the table
    /// does not know their type).
    pub(crate) fn clear(&self, clearer: &dyn Fn(&GenericBucket)) {
        {
            let mut guard = self.lock.write();
            debug_assert!(guard.auxiliary.is_none());
            guard.disabled = true;
            guard.evictions = false;
        }
        for bucket in self.buckets.iter() {
            clearer(bucket);
        }
        self.slots_used.store(0, Ordering::Relaxed);
        self.slots_total.store(self.size, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        self.lock.write().disabled = false;
    }

    pub fn disable(&self) {
        self.lock.write().disabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        !self.lock.read().disabled
    }

    /// Report a newly filled slot. True means the fill ratio crossed the
    /// upper bound and the cache should ask for a larger table.
    pub(crate) fn slot_filled(&self) -> bool {
        let used = self.slots_used.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.slots_total.load(Ordering::Relaxed);
        (used as f64 / total as f64) > self.ideal_upper_ratio && self.log_size < MAX_LOG_SIZE
    }

    pub(crate) fn slots_filled(&self, count: u64) {
        self.slots_used.fetch_add(count, Ordering::AcqRel);
    }

    /// Report a newly emptied slot. True means the fill ratio fell below the
    /// lower bound and the cache should ask for a smaller table.
    pub(crate) fn slot_emptied(&self) -> bool {
        let previous = self.slots_used.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        let total = self.slots_total.load(Ordering::Relaxed);
        ((previous - 1) as f64 / total as f64) < self.ideal_lower_ratio
            && self.log_size > MIN_LOG_SIZE
    }

    pub(crate) fn slots_emptied(&self, count: u64) {
        let previous = self.slots_used.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(previous >= count);
    }

    /// Force the next `ideal_size()` to request growth.
    pub(crate) fn signal_evictions(&self) {
        self.lock.write().evictions = true;
    }

    /// The log size this table should have, judged by fill ratio and the
    /// eviction signal. Consumes the eviction signal.
    pub(crate) fn ideal_size(&self) -> u32 {
        let force_growth = {
            let mut guard = self.lock.write();
            mem::replace(&mut guard.evictions, false)
        };
        if force_growth {
            return (self.log_size + 1).min(MAX_LOG_SIZE);
        }

        let ratio =
            self.slots_used.load(Ordering::Relaxed) as f64 / self.slots_total.load(Ordering::Relaxed) as f64;
        if ratio > self.ideal_upper_ratio {
            (self.log_size + 1).min(MAX_LOG_SIZE)
        } else if ratio < self.ideal_lower_ratio {
            (self.log_size - 1).max(MIN_LOG_SIZE)
        } else {
            self.log_size
        }
    }
}

/// RAII guard over a locked bucket.
///
/// Obtained via [`Table::fetch_and_lock_bucket`]; holds the owning table
/// alive, unlocks on drop, and hands out typed views of the bucket.
pub struct BucketLocker {
    bucket: *const GenericBucket,
    source: Option<Arc<Table>>,
    locked: bool,
}

impl BucketLocker {
    fn unlocked() -> Self {
        Self {
            bucket: ptr::null(),
            source: None,
            locked: false,
        }
    }

    fn lock(source: Arc<Table>, bucket: &GenericBucket, max_tries: u64) -> Self {
        if bucket.state().lock(max_tries) {
            Self {
                bucket: bucket as *const GenericBucket,
                source: Some(source),
                locked: true,
            }
        } else {
            Self::unlocked()
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn source(&self) -> &Arc<Table> {
        self.source.as_ref().expect("locker holds no bucket")
    }

    pub(crate) fn generic(&self) -> &GenericBucket {
        debug_assert!(self.locked);
        unsafe { &*self.bucket }
    }

    /// View the locked bucket as its cache-flavor type.
    pub(crate) fn bucket<B: BucketView>(&self) -> &B {
        debug_assert!(self.locked);
        // sound per the BucketView contract: same size, alignment and prefix,
        // all mutable fields interior-mutable
        unsafe { &*(self.bucket as *const B) }
    }

    pub(crate) fn release(&mut self) {
        if self.locked {
            unsafe { &*self.bucket }.state().unlock();
            self.locked = false;
        }
        self.bucket = ptr::null();
        self.source = None;
    }
}

impl Drop for BucketLocker {
    fn drop(&mut self) {
        self.release()
    }
}

/// The auxiliary-side counterpart of one primary bucket during migration.
pub(crate) struct Subtable {
    source: Arc<Table>,
    base: usize,
    len: usize,
    mask: u32,
    shift: u32,
}

impl Subtable {
    /// Index (into [`Subtable::lock_all`]'s guard vector) of the bucket the
    /// given hash maps to.
    pub fn index_of(&self, hash: u32) -> usize {
        ((hash & self.mask) >> self.shift) as usize
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.source
    }

    pub fn lock_all(&self) -> Vec<BucketLocker> {
        (0..self.len)
            .map(|i| {
                BucketLocker::lock(
                    Arc::clone(&self.source),
                    &self.source.buckets[self.base + i],
                    TRIES_GUARANTEE,
                )
            })
            .collect()
    }
}
