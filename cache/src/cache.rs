// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
        Weak,
    },
    thread,
    time::Duration,
};

use arc_swap::ArcSwapOption;
use once_cell::sync::OnceCell;

use crate::{
    bucket::GenericBucket,
    clock::now_micros,
    error::Error,
    manager::{Manager, FIND_STATS_CAPACITY},
    metadata::Metadata,
    stats::{stat, FrequencyBuffer},
    sync::ReadWriteSpinLock,
    table::{BucketLocker, HashOrId, Table, MAX_LOG_SIZE},
    value::{Finding, Value},
};

pub mod plain;
pub mod transactional;

pub use plain::PlainCache;
pub use transactional::TransactionalCache;

/// Smallest usage limit a cache starts out with, in bytes.
pub const MIN_CACHE_SIZE: u64 = 16384;

/// Reporting granularity for memory usage changes. A cache buffers its
/// allocation delta locally and only reports to the manager once the
/// absolute value crosses this threshold, limiting pressure on the
/// manager's lock.
pub const MEMORY_REPORT_GRANULARITY: i64 = 4096;

pub(crate) const TRIES_FAST: u64 = 200;
pub(crate) const TRIES_SLOW: u64 = 10_000;

// sample roughly every 4096 insertions
const EVICTION_MASK: u64 = 4095;
// migrate if more than 1% of sampled inserts had to evict
const EVICTION_RATE_THRESHOLD: f64 = 0.01;

/// The flavors a [`Manager`] can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Plain,
    Transactional,
}

/// The common contract of all caches managed by a [`Manager`].
///
/// Keys are arbitrary byte sequences; interpretation (hashing, equality) is
/// the business of the cache's [`Hasher`]. All operations are safe to call
/// from any thread and never block on IO; lock acquisition is bounded, and
/// [`Error::Busy`] is a normal, retryable outcome.
///
/// [`Hasher`]: crate::hasher::Hasher
pub trait Cache: Send + Sync {
    /// Look up `key`.
    ///
    /// May report a false negative when a lock could not be acquired within
    /// the tries budget; the [`Finding`]'s result distinguishes that from a
    /// genuine miss.
    fn find(&self, key: &[u8]) -> Finding;

    /// Insert `value`, consuming it.
    ///
    /// The value is dropped (and its allocation released) when insertion is
    /// refused, whether for banishment, memory limits or lock contention.
    fn insert(&self, value: Value) -> Result<(), Error>;

    /// Remove `key`. Succeeds also when the key is absent.
    fn remove(&self, key: &[u8]) -> Result<(), Error>;

    /// Banish `key` for the current term. A no-op on plain caches.
    fn banish(&self, key: &[u8]) -> Result<(), Error>;

    /// Hint that roughly `num_elements` entries are about to arrive, so the
    /// table can migrate to a fitting size up front.
    fn size_hint(&self, num_elements: u64);

    fn id(&self) -> u64;

    /// Total memory allocated to this cache, in bytes.
    fn size(&self) -> u64;

    /// Current data memory usage, in bytes.
    fn usage(&self) -> u64;

    /// Current limit on data memory usage, in bytes.
    fn usage_limit(&self) -> u64;

    /// Allocated size and usage, read under a single lock.
    fn size_and_usage(&self) -> (u64, u64);

    /// Lifetime and windowed hit rates, in percent. Either is NaN when no
    /// data is available (the windowed one also when disabled).
    fn hit_rates(&self) -> (f64, f64);

    fn is_resizing(&self) -> bool;

    fn is_migrating(&self) -> bool;

    fn is_shutdown(&self) -> bool;
}

/// Crate-internal face of a cache: what the manager and its background tasks
/// need beyond the public contract.
pub(crate) trait Managed: Cache {
    fn core(&self) -> &Core;

    /// Evict entries, reporting each reclaimed size, while the callback asks
    /// for more.
    fn free_memory_while(&self, cb: &mut dyn FnMut(u64) -> bool);

    /// Move the contents of primary bucket `index` into the auxiliary table
    /// and mark the bucket migrated.
    fn migrate_bucket(&self, table: &Arc<Table>, index: usize, new_table: &Arc<Table>);

    /// Free all values held by `bucket` and reset it. Runs under the bucket
    /// lock taken by the implementation.
    fn clear_bucket(&self, bucket: &GenericBucket);

    fn can_resize(&self) -> bool {
        let core = self.core();
        if core.is_shutdown() {
            return false;
        }
        !core.is_resizing_or_migrating_flag_set()
    }

    /// Shut the cache down: wait out in-flight resize/migrate work, release
    /// the tables to the manager pool, unregister. Idempotent.
    fn shutdown_managed(&self) {
        let core = self.core();
        let mut task_guard = core.task_lock.write();

        if !core.shutdown.swap(true, Ordering::AcqRel) {
            loop {
                if !core.is_resizing_or_migrating_flag_set() {
                    break;
                }
                // wait without holding the task lock
                drop(task_guard);
                thread::sleep(Duration::from_micros(20));
                task_guard = core.task_lock.write();
            }

            if let Some(table) = core.table.load_full() {
                if let Some(extra) = table.set_auxiliary(None) {
                    extra.clear(&|bucket| self.clear_bucket(bucket));
                    core.manager.reclaim_table(extra);
                }
                table.clear(&|bucket| self.clear_bucket(bucket));
                core.manager.reclaim_table(table);
            }

            let remaining = {
                let mut metadata = core.metadata.write();
                metadata.change_table(0);
                metadata.allocated_size
            };
            core.manager.unregister_cache(core.id, remaining);
            core.table.store(None);
        }

        drop(task_guard);

        // flush whatever allocation delta is still buffered
        core.adjust_global_allocation(0, true);
    }

    /// Evict until usage is back under the soft limit. Returns whether the
    /// limit was reached. The metadata resizing flag must be set on entry
    /// and is still set on exit.
    fn free_memory(&self) -> bool {
        let core = self.core();
        debug_assert!(core.is_resizing_flag_set());

        if core.is_shutdown() {
            return false;
        }

        if !core.reclaim_memory(0) {
            self.free_memory_while(&mut |reclaimed| {
                debug_assert!(reclaimed > 0);
                // keep evicting only while still over the limit
                !core.reclaim_memory(reclaimed)
            });
        }

        core.reclaim_memory(0)
    }

    /// Move all entries into `new_table` and swap it in. The metadata
    /// migrating flag must be set on entry and is clear on exit.
    fn migrate(&self, new_table: Arc<Table>) -> bool {
        let core = self.core();
        debug_assert!(core.is_migrating_flag_set());

        let abort = |core: &Core| {
            let mut metadata = core.metadata.write();
            debug_assert!(metadata.is_migrating());
            metadata.toggle_migrating();
            false
        };

        if core.is_shutdown() {
            return abort(core);
        }

        new_table.set_slots_per_bucket(core.slots_per_bucket);
        new_table.enable();

        let table = match core.table.load_full() {
            Some(table) => table,
            None => return abort(core),
        };

        let rejected = table.set_auxiliary(Some(Arc::clone(&new_table)));
        debug_assert!(rejected.is_none());

        for index in 0..table.size() as usize {
            self.migrate_bucket(&table, index, &new_table);
        }

        let old_table = {
            let _task_guard = core.task_lock.write();
            let old_table = core.table.load_full().expect("table present while migrating");
            core.table.store(Some(Arc::clone(&new_table)));
            old_table.set_auxiliary(None);
            old_table
        };

        {
            let mut metadata = core.metadata.write();
            metadata.change_table(new_table.memory_usage());
            debug_assert!(metadata.is_migrating());
            metadata.toggle_migrating();
        }

        old_table.clear(&|bucket| self.clear_bucket(bucket));
        core.manager.reclaim_table(old_table);

        true
    }
}

struct FindStats {
    hits: AtomicU64,
    misses: AtomicU64,
    windowed: Option<FrequencyBuffer<u8>>,
}

#[derive(Default)]
struct EvictionStats {
    inserts_total: AtomicU64,
    insert_evictions: AtomicU64,
}

/// State and behavior shared by all cache flavors.
pub(crate) struct Core {
    pub(crate) manager: Arc<Manager>,
    pub(crate) id: u64,
    pub(crate) metadata: Metadata,
    self_ref: Weak<dyn Managed>,

    shutdown: AtomicBool,
    pub(crate) task_lock: ReadWriteSpinLock<()>,

    // locally buffered allocation delta, flushed to the manager once it
    // crosses MEMORY_REPORT_GRANULARITY (or on force)
    memory_usage_diff: AtomicI64,

    pub(crate) table: ArcSwapOption<Table>,
    pub(crate) slots_per_bucket: usize,
    enable_windowed_stats: bool,

    find_stats: OnceCell<FindStats>,
    eviction_stats: OnceCell<EvictionStats>,

    // earliest instants (micros) at which the next migrate/resize request
    // may be forwarded to the manager
    migrate_request_time: AtomicU64,
    resize_request_time: AtomicU64,
}

impl Core {
    pub(crate) fn new(
        manager: Arc<Manager>,
        id: u64,
        metadata: Metadata,
        table: Arc<Table>,
        enable_windowed_stats: bool,
        slots_per_bucket: usize,
        self_ref: Weak<dyn Managed>,
    ) -> Self {
        let now = now_micros();
        Self {
            manager,
            id,
            metadata,
            self_ref,
            shutdown: AtomicBool::new(false),
            task_lock: ReadWriteSpinLock::new(()),
            memory_usage_diff: AtomicI64::new(0),
            table: ArcSwapOption::new(Some(table)),
            slots_per_bucket,
            enable_windowed_stats,
            find_stats: OnceCell::new(),
            eviction_stats: OnceCell::new(),
            migrate_request_time: AtomicU64::new(now),
            resize_request_time: AtomicU64::new(now),
        }
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn Managed>> {
        self.self_ref.upgrade()
    }

    pub(crate) fn table(&self) -> Option<Arc<Table>> {
        self.table.load_full()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn size(&self) -> u64 {
        if self.is_shutdown() {
            return 0;
        }
        self.metadata.read().allocated_size
    }

    pub(crate) fn usage_limit(&self) -> u64 {
        if self.is_shutdown() {
            return 0;
        }
        self.metadata.read().soft_usage_limit
    }

    pub(crate) fn usage(&self) -> u64 {
        if self.is_shutdown() {
            return 0;
        }
        self.metadata.read().usage()
    }

    pub(crate) fn size_and_usage(&self) -> (u64, u64) {
        if self.is_shutdown() {
            return (0, 0);
        }
        let metadata = self.metadata.read();
        (metadata.allocated_size, metadata.usage())
    }

    pub(crate) fn is_resizing(&self) -> bool {
        !self.is_shutdown() && self.is_resizing_flag_set()
    }

    pub(crate) fn is_migrating(&self) -> bool {
        !self.is_shutdown() && self.is_migrating_flag_set()
    }

    pub(crate) fn is_resizing_flag_set(&self) -> bool {
        self.metadata.read().is_resizing()
    }

    pub(crate) fn is_migrating_flag_set(&self) -> bool {
        self.metadata.read().is_migrating()
    }

    pub(crate) fn is_resizing_or_migrating_flag_set(&self) -> bool {
        let metadata = self.metadata.read();
        metadata.is_resizing() || metadata.is_migrating()
    }

    /// Locate and lock the bucket for an operation, observing the shutdown
    /// gate and reporting the access to the manager's statistics.
    pub(crate) fn get_bucket(
        &self,
        bucket: HashOrId,
        max_tries: u64,
        single_operation: bool,
    ) -> Result<BucketLocker, Error> {
        if self.is_shutdown() {
            return Err(Error::ShuttingDown);
        }
        if single_operation {
            self.manager.report_access(self.id);
        }

        let table = self.table().ok_or(Error::ShuttingDown)?;
        let locker = table.fetch_and_lock_bucket(bucket, max_tries);
        if locker.is_locked() {
            Ok(locker)
        } else {
            Err(Error::Busy)
        }
    }

    /// Buffer an allocation delta, informing the manager once the local
    /// balance crosses the reporting granularity (always, with `force`).
    pub(crate) fn adjust_global_allocation(&self, value: i64, force: bool) {
        if value == 0 && !force {
            return;
        }

        let mut expected = self.memory_usage_diff.fetch_add(value, Ordering::Relaxed) + value;
        let force = force
            || expected >= MEMORY_REPORT_GRANULARITY
            || expected <= -MEMORY_REPORT_GRANULARITY;

        if force {
            loop {
                match self.memory_usage_diff.compare_exchange_weak(
                    expected,
                    0,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        if expected != 0 {
                            self.manager.adjust_global_allocation(expected);
                        }
                        break;
                    },
                    Err(actual) => expected = actual,
                }
            }
        }
    }

    /// Give back `size` bytes of usage. Returns whether usage is at or under
    /// the soft limit afterwards.
    pub(crate) fn reclaim_memory(&self, size: u64) -> bool {
        let metadata = self.metadata.read();
        if size != 0 {
            metadata.adjust_usage_if_allowed(-(size as i64));
        }
        metadata.soft_usage_limit >= metadata.usage()
    }

    fn ensure_find_stats(&self) -> &FindStats {
        self.find_stats.get_or_init(|| {
            let windowed = if self.enable_windowed_stats {
                Some(FrequencyBuffer::<u8>::new(
                    Arc::clone(self.manager.prng()),
                    FIND_STATS_CAPACITY,
                ))
            } else {
                None
            };
            let footprint = mem::size_of::<FindStats>()
                + windowed.as_ref().map(|b| b.memory_usage()).unwrap_or(0);
            self.adjust_global_allocation(footprint as i64, false);
            FindStats {
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                windowed,
            }
        })
    }

    pub(crate) fn record_hit(&self) {
        if self.manager.prng().next() & 7 != 0 {
            return;
        }
        let stats = self.ensure_find_stats();
        stats.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(windowed) = &stats.windowed {
            windowed.insert(stat::FIND_HIT);
        }
        self.manager.report_hit();
    }

    pub(crate) fn record_miss(&self) {
        if self.manager.prng().next() & 7 != 0 {
            return;
        }
        let stats = self.ensure_find_stats();
        stats.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(windowed) = &stats.windowed {
            windowed.insert(stat::FIND_MISS);
        }
        self.manager.report_miss();
    }

    pub(crate) fn hit_rates(&self) -> (f64, f64) {
        let mut lifetime = f64::NAN;
        let mut windowed = f64::NAN;

        if let Some(stats) = self.find_stats.get() {
            let hits = stats.hits.load(Ordering::Relaxed);
            let misses = stats.misses.load(Ordering::Relaxed);
            if hits + misses > 0 {
                lifetime = 100.0 * (hits as f64 / (hits + misses) as f64);
            }

            if let Some(buffer) = &stats.windowed {
                let frequencies = buffer.frequencies();
                if !frequencies.is_empty() {
                    let hits = frequencies
                        .iter()
                        .find(|(record, _)| *record == stat::FIND_HIT)
                        .map(|(_, count)| *count)
                        .unwrap_or(0);
                    let misses = frequencies
                        .iter()
                        .find(|(record, _)| *record == stat::FIND_MISS)
                        .map(|(_, count)| *count)
                        .unwrap_or(0);
                    if hits + misses > 0 {
                        windowed = 100.0 * (hits as f64 / (hits + misses) as f64);
                    }
                }
            }
        }

        (lifetime, windowed)
    }

    /// Track an insertion and its eviction, and decide (on a sampling basis)
    /// whether the eviction rate asks for a larger table.
    pub(crate) fn report_insert(&self, table: &Table, had_eviction: bool) -> bool {
        let stats = self.eviction_stats.get_or_init(|| {
            self.adjust_global_allocation(mem::size_of::<EvictionStats>() as i64, false);
            EvictionStats::default()
        });

        if had_eviction {
            stats.insert_evictions.fetch_add(1, Ordering::Relaxed);
        }
        stats.inserts_total.fetch_add(1, Ordering::Relaxed);

        let mut should_migrate = false;
        if self.manager.prng().next() & EVICTION_MASK == 0 {
            let total = stats.inserts_total.load(Ordering::Relaxed);
            let evictions = stats.insert_evictions.load(Ordering::Relaxed);
            if total > 0
                && total > evictions
                && (evictions as f64 / total as f64) > EVICTION_RATE_THRESHOLD
            {
                should_migrate = true;
                table.signal_evictions();
            }
            stats.insert_evictions.store(0, Ordering::Relaxed);
            stats.inserts_total.store(0, Ordering::Relaxed);
        }

        should_migrate
    }

    /// Ask the manager for a larger usage limit. Rate-limited and coalesced
    /// across threads; silently does nothing when inside the banned window.
    pub(crate) fn request_grow(&self) {
        if self.is_shutdown() || now_micros() <= self.resize_request_time.load(Ordering::Relaxed)
        {
            return;
        }

        if let Some(_task_guard) = self.task_lock.try_write(TRIES_SLOW) {
            if now_micros() > self.resize_request_time.load(Ordering::Relaxed) {
                let ok = !self.metadata.read().is_resizing();
                if ok {
                    if let Some(handle) = self.handle() {
                        let (_, next_request) = self.manager.request_grow(handle);
                        self.resize_request_time
                            .store(next_request, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Ask the manager for a table of `requested_log_size`. Rate-limited
    /// like [`Core::request_grow`].
    pub(crate) fn request_migrate(&self, requested_log_size: u32, current_log_size: u32) {
        if requested_log_size == current_log_size {
            return;
        }
        if self.is_shutdown() || now_micros() <= self.migrate_request_time.load(Ordering::Relaxed)
        {
            return;
        }

        let _task_guard = self.task_lock.write();
        if now_micros() > self.migrate_request_time.load(Ordering::Relaxed) {
            let ok = {
                let metadata = self.metadata.read();
                !metadata.is_migrating()
            };
            let ok = ok
                && self
                    .table()
                    .map(|table| table.log_size() != requested_log_size)
                    .unwrap_or(false);
            if ok {
                if let Some(handle) = self.handle() {
                    let (_, next_request) = self
                        .manager
                        .request_migrate(handle, requested_log_size.min(MAX_LOG_SIZE));
                    self.migrate_request_time
                        .store(next_request, Ordering::Relaxed);
                }
            }
        }
    }

    pub(crate) fn size_hint(&self, num_elements: u64) {
        if self.is_shutdown() {
            return;
        }

        let num_buckets = num_elements as f64
            / (self.slots_per_bucket as f64 * self.manager.ideal_upper_fill_ratio());
        let mut requested_log_size = 0u32;
        while ((1u64 << requested_log_size) as f64) < num_buckets
            && requested_log_size < MAX_LOG_SIZE
        {
            requested_log_size += 1;
        }

        if let Some(table) = self.table() {
            self.request_migrate(requested_log_size, table.log_size());
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let mut footprint = 0usize;
        if let Some(stats) = self.find_stats.get() {
            footprint += mem::size_of::<FindStats>()
                + stats.windowed.as_ref().map(|b| b.memory_usage()).unwrap_or(0);
        }
        if self.eviction_stats.get().is_some() {
            footprint += mem::size_of::<EvictionStats>();
        }
        if footprint > 0 {
            self.adjust_global_allocation(-(footprint as i64), true);
        }
        debug_assert_eq!(self.memory_usage_diff.load(Ordering::Relaxed), 0);
    }
}
