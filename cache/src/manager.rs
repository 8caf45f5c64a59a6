// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    collections::BTreeMap,
    hint,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Weak,
    },
};

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::{
    cache::{
        Cache,
        CacheKind,
        Managed,
        PlainCache,
        TransactionalCache,
        MIN_CACHE_SIZE,
    },
    clock::now_micros,
    config::CacheOptions,
    error::Error,
    hasher::{BinaryKeyHasher, Hasher},
    metadata::{Metadata, MetadataInner},
    prng::SharedPrng,
    stats::{stat, FrequencyBuffer},
    sync::ReadWriteSpinLock,
    table::{Table, MAX_LOG_SIZE, MIN_LOG_SIZE},
    transaction::{Transaction, TransactionManager},
};

pub mod tasks;

use tasks::{FreeMemoryTask, MigrateTask, TaskEnvironment};

/// A job handed to the scheduler hook.
pub type Job = Box<dyn FnOnce() + Send>;

/// The scheduler hook. Must enqueue the job for asynchronous execution and
/// report acceptance; running the job synchronously from inside the hook is
/// not allowed (the manager may hold its own lock while posting).
pub type PostFn = Box<dyn Fn(Job) -> bool + Send + Sync>;

/// Bookkeeping overhead attributed to each registered cache (registry node
/// plus shared-pointer bookkeeping).
pub const CACHE_RECORD_OVERHEAD: u64 = 80;

/// Capacity of the windowed find-statistics buffers.
pub const FIND_STATS_CAPACITY: usize = 8192;

/// Smallest accepted global memory budget.
pub const MIN_GLOBAL_SIZE: u64 = 1024 * 1024;

const HIGHWATER_MULTIPLIER: f64 = 0.56;
const MAX_SPARE_TABLES_TOTAL: u64 = 16;
// single spare table size cap
const MAX_SPARE_TABLE_SIZE: u64 = 32 << 20;
// pessimistic footprint of the table pool scaffolding
const TABLE_LISTS_OVERHEAD: u64 = 32 * 16 * 8;

const TRIES_SLOW: u64 = 1000;

const REBALANCING_GRACE_PERIOD: u64 = 10_000; // micros
const REQUEST_BACKOFF: u64 = 100_000; // micros

const fn max_u64(a: u64, b: u64) -> u64 {
    if a > b {
        a
    } else {
        b
    }
}

/// Smallest allocation any registered cache can get away with: minimal usage
/// limit, minimal table, the larger cache struct, and the registry record.
pub const MIN_CACHE_ALLOCATION: u64 = MIN_CACHE_SIZE
    + Table::allocation_size(MIN_LOG_SIZE)
    + max_u64(
        PlainCache::<BinaryKeyHasher>::allocation_size(),
        TransactionalCache::<BinaryKeyHasher>::allocation_size(),
    )
    + CACHE_RECORD_OVERHEAD;

/// A snapshot of the manager's memory bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub global_limit: u64,
    pub global_allocation: u64,
    pub peak_global_allocation: u64,
    pub spare_allocation: u64,
    pub peak_spare_allocation: u64,
    pub active_tables: u64,
    pub spare_tables: u64,
    pub migrate_tasks: u64,
    pub free_memory_tasks: u64,
}

/// Coordinates a family of caches sharing one memory budget.
///
/// Clients create and destroy caches here; all of them are subject to a
/// combined global limit. Tables of retired caches are pooled and reused to
/// make short-lived caches cheap. The manager periodically rebalances the
/// per-cache allocations so frequently accessed caches get more space, and
/// achieves compliance through background tasks posted to the injected
/// scheduler hook.
///
/// The manager owns no threads and is no singleton: construct one per
/// process (or per test) and share it via [`Arc`].
pub struct Manager {
    // for handing strong handles to background tasks
    self_ref: Weak<Manager>,

    prng: Arc<SharedPrng>,
    options: CacheOptions,

    state: ReadWriteSpinLock<State>,

    // access frequency monitoring (cache ids)
    access_stats: FrequencyBuffer<u64>,

    // hit rate monitoring
    find_stats: Option<FrequencyBuffer<u8>>,
    find_hits: AtomicU64,
    find_misses: AtomicU64,

    transactions: TransactionManager,

    post: PostFn,
    outstanding_tasks: AtomicU64,
    rebalancing_tasks: AtomicU64,
    resizing_tasks: AtomicU64,
}

pub(crate) struct State {
    shutdown: bool,
    shutting_down: bool,
    resizing: bool,
    rebalancing: bool,

    caches: BTreeMap<u64, Weak<dyn Managed>>,
    next_cache_id: u64,

    // spare tables to lease out, keyed by log size
    tables: [Vec<Arc<Table>>; (MAX_LOG_SIZE + 1) as usize],

    global_soft_limit: u64,
    global_hard_limit: u64,
    global_highwater_mark: u64,
    fixed_allocation: u64,
    spare_table_allocation: u64,
    peak_spare_table_allocation: u64,
    pub(crate) global_allocation: u64,
    peak_global_allocation: u64,
    active_tables: u64,
    spare_tables: u64,
    migrate_tasks: u64,
    free_memory_tasks: u64,

    rebalance_completed: u64, // micros
}

impl State {
    fn is_operational(&self) -> bool {
        !self.shutdown && !self.shutting_down
    }

    fn global_process_running(&self) -> bool {
        self.rebalancing || self.resizing
    }

    fn past_rebalancing_grace_period(&self) -> bool {
        !self.rebalancing
            && now_micros().saturating_sub(self.rebalance_completed) >= REBALANCING_GRACE_PERIOD
    }

    fn increase_allowed(&self, increase: u64, privileged: bool) -> bool {
        if privileged {
            if self.resizing && self.global_allocation <= self.global_soft_limit {
                return increase <= self.global_soft_limit - self.global_allocation;
            }
            return increase <= self.global_hard_limit.saturating_sub(self.global_allocation);
        }
        increase <= self.global_highwater_mark.saturating_sub(self.global_allocation)
    }

    fn add_allocation(&mut self, amount: u64) {
        self.global_allocation += amount;
        self.peak_global_allocation = self.peak_global_allocation.max(self.global_allocation);
    }

    pub(crate) fn sub_allocation(&mut self, amount: u64) {
        debug_assert!(self.global_allocation >= amount + self.fixed_allocation);
        self.global_allocation -= amount;
    }

    fn adjust_global_limits_if_allowed(&mut self, new_global_limit: u64) -> bool {
        if new_global_limit < self.global_allocation {
            return false;
        }
        self.global_highwater_mark =
            (HIGHWATER_MULTIPLIER * new_global_limit as f64) as u64;
        self.global_soft_limit = new_global_limit;
        self.global_hard_limit = new_global_limit;
        true
    }
}

impl Manager {
    /// Create a manager with the given sampling PRNG, scheduler hook and
    /// options.
    pub fn new(prng: Arc<SharedPrng>, post: PostFn, options: CacheOptions) -> Arc<Self> {
        let access_capacity = if options.cache_size >= (1 << 30) {
            (1 << 20) / mem::size_of::<u64>()
        } else {
            (options.cache_size as usize / (1024 * mem::size_of::<u64>())).max(1)
        };
        let access_stats = FrequencyBuffer::<u64>::new(Arc::clone(&prng), access_capacity);

        let find_stats = if options.enable_windowed_stats {
            Some(FrequencyBuffer::<u8>::new(
                Arc::clone(&prng),
                FIND_STATS_CAPACITY,
            ))
        } else {
            None
        };

        let fixed_allocation = mem::size_of::<Manager>() as u64
            + TABLE_LISTS_OVERHEAD
            + access_stats.memory_usage() as u64
            + find_stats.as_ref().map(|b| b.memory_usage() as u64).unwrap_or(0);

        let global_soft_limit = options.cache_size;
        debug_assert!(fixed_allocation < global_soft_limit);

        let state = State {
            shutdown: false,
            shutting_down: false,
            resizing: false,
            rebalancing: false,
            caches: BTreeMap::new(),
            next_cache_id: 1,
            tables: std::array::from_fn(|_| Vec::new()),
            global_soft_limit,
            global_hard_limit: global_soft_limit,
            global_highwater_mark: (HIGHWATER_MULTIPLIER * global_soft_limit as f64) as u64,
            fixed_allocation,
            spare_table_allocation: 0,
            peak_spare_table_allocation: 0,
            global_allocation: fixed_allocation,
            peak_global_allocation: fixed_allocation,
            active_tables: 0,
            spare_tables: 0,
            migrate_tasks: 0,
            free_memory_tasks: 0,
            rebalance_completed: now_micros().saturating_sub(REBALANCING_GRACE_PERIOD),
        };

        Arc::new_cyclic(|me| Self {
            self_ref: me.clone(),
            prng,
            options,
            state: ReadWriteSpinLock::new(state),
            access_stats,
            find_stats,
            find_hits: AtomicU64::new(0),
            find_misses: AtomicU64::new(0),
            transactions: TransactionManager::new(),
            post,
            outstanding_tasks: AtomicU64::new(0),
            rebalancing_tasks: AtomicU64::new(0),
            resizing_tasks: AtomicU64::new(0),
        })
    }

    fn arc(&self) -> Arc<Manager> {
        self.self_ref.upgrade().expect("manager is alive")
    }

    /// Create a cache of the given kind.
    ///
    /// Fails with [`Error::ShuttingDown`] after [`Manager::begin_shutdown`],
    /// and with [`Error::ResourceLimit`] under memory pressure so extreme
    /// that the budget cannot host another cache. `max_size` caps the
    /// cache's allocation over its whole lifetime; windowed stats cost one
    /// extra buffer and a slight overhead per sampled find.
    pub fn create_cache<H: Hasher>(
        &self,
        kind: CacheKind,
        enable_windowed_stats: bool,
        max_size: u64,
    ) -> Result<Arc<dyn Cache>, Error> {
        let mut state = self.state.write();

        if !state.is_operational() {
            return Err(Error::ShuttingDown);
        }

        let fixed_size = match kind {
            CacheKind::Plain => PlainCache::<H>::allocation_size(),
            CacheKind::Transactional => TransactionalCache::<H>::allocation_size(),
        };

        let (metadata, table) = self.create_table(&mut state, fixed_size, max_size)?;
        let table_size = metadata.table_size;
        let cache_allocation = metadata.allocated_size - table_size;

        let id = state.next_cache_id;
        state.next_cache_id += 1;

        let metadata = Metadata::new(metadata);
        let (cache, registered): (Arc<dyn Cache>, Weak<dyn Managed>) = match kind {
            CacheKind::Plain => {
                let cache =
                    PlainCache::<H>::create(self.arc(), id, metadata, table, enable_windowed_stats);
                let weak: Weak<dyn Managed> = Arc::downgrade(&(cache.clone() as Arc<dyn Managed>));
                (cache, weak)
            },
            CacheKind::Transactional => {
                let cache = TransactionalCache::<H>::create(
                    self.arc(),
                    id,
                    metadata,
                    table,
                    enable_windowed_stats,
                );
                let weak: Weak<dyn Managed> = Arc::downgrade(&(cache.clone() as Arc<dyn Managed>));
                (cache, weak)
            },
        };

        state.caches.insert(id, registered);
        state.add_allocation(cache_allocation);

        Ok(cache)
    }

    /// Shut down the given cache and release its resources. Remaining
    /// handles to it keep working only insofar as they observe the shutdown
    /// state.
    pub fn destroy_cache(&self, cache: Arc<dyn Cache>) {
        let id = cache.id();
        let managed = {
            let state = self.state.read();
            state.caches.get(&id).and_then(Weak::upgrade)
        };
        drop(cache);
        if let Some(managed) = managed {
            managed.shutdown_managed();
        }
    }

    /// Stop accepting new caches and global operations.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.write();
        if !state.shutdown {
            state.shutting_down = true;
        }
    }

    /// Shut down all caches, drain tasks, empty the table pool.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        if state.shutdown {
            return;
        }
        state.shutting_down = true;

        // wait for rebalancing and resize/migrate tasks to complete
        while self.outstanding_tasks.load(Ordering::Acquire) > 0 {
            drop(state);
            hint::spin_loop();
            state = self.state.write();
        }

        loop {
            let next = state.caches.values().find_map(|weak| weak.upgrade());
            match next {
                Some(cache) => {
                    drop(state);
                    cache.shutdown_managed();
                    state = self.state.write();
                },
                None => break,
            }
        }
        state.caches.clear();

        debug_assert_eq!(state.active_tables, 0);
        Self::free_unused_tables(&mut state);
        debug_assert_eq!(state.spare_tables, 0);
        debug_assert!(state.tables.iter().all(Vec::is_empty));

        state.shutdown = true;
    }

    /// Change the global memory budget. Returns whether the new limit was
    /// accepted; compliance may be achieved asynchronously.
    pub fn resize(&self, new_global_limit: u64) -> bool {
        let mut state = self.state.write();

        if new_global_limit < MIN_GLOBAL_SIZE
            || ((0.5 * (1.0 - HIGHWATER_MULTIPLIER) * new_global_limit as f64) as u64)
                < state.fixed_allocation
            || ((HIGHWATER_MULTIPLIER * new_global_limit as f64) as u64)
                < state.caches.len() as u64 * MIN_CACHE_ALLOCATION
        {
            return false;
        }

        if !state.is_operational() || state.global_process_running() {
            return false;
        }

        if !state.adjust_global_limits_if_allowed(new_global_limit) {
            // actually need to shrink
            state.resizing = true;
            state.global_soft_limit = new_global_limit;
            state.global_highwater_mark =
                (HIGHWATER_MULTIPLIER * new_global_limit as f64) as u64;
            Self::free_unused_tables(&mut state);
            if !state.adjust_global_limits_if_allowed(new_global_limit) {
                let _ = self.rebalance_locked(&mut state, true);
                self.shrink_overgrown_caches(TaskEnvironment::Resizing, &mut state);
            }
            if self.resizing_tasks.load(Ordering::Acquire) == 0 {
                state.resizing = false;
                let _ = state.adjust_global_limits_if_allowed(new_global_limit);
            }
        }

        true
    }

    pub fn global_limit(&self) -> u64 {
        let state = self.state.read();
        if state.resizing {
            state.global_soft_limit
        } else {
            state.global_hard_limit
        }
    }

    /// Upper bound on the memory currently allocated to all caches combined.
    pub fn global_allocation(&self) -> u64 {
        let state = self.state.read();
        debug_assert!(state.global_allocation >= state.fixed_allocation);
        state.global_allocation
    }

    /// A consistent snapshot of the memory bookkeeping, or `None` when the
    /// manager lock could not be acquired within `max_tries`.
    pub fn memory_stats(&self, max_tries: u64) -> Option<MemoryStats> {
        let state = self.state.try_read(max_tries)?;
        Some(MemoryStats {
            global_limit: if state.resizing {
                state.global_soft_limit
            } else {
                state.global_hard_limit
            },
            global_allocation: state.global_allocation,
            peak_global_allocation: state.peak_global_allocation,
            spare_allocation: state.spare_table_allocation,
            peak_spare_allocation: state.peak_spare_table_allocation,
            active_tables: state.active_tables,
            spare_tables: state.spare_tables,
            migrate_tasks: state.migrate_tasks,
            free_memory_tasks: state.free_memory_tasks,
        })
    }

    /// Lifetime and windowed hit rates across all caches, in percent; NaN
    /// when no data is available.
    pub fn global_hit_rates(&self) -> (f64, f64) {
        let mut lifetime = f64::NAN;
        let mut windowed = f64::NAN;

        let hits = self.find_hits.load(Ordering::Relaxed);
        let misses = self.find_misses.load(Ordering::Relaxed);
        if hits + misses > 0 {
            lifetime = 100.0 * (hits as f64 / (hits + misses) as f64);
        }

        if let Some(buffer) = &self.find_stats {
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

        (lifetime, windowed)
    }

    /// Open a transaction. Read-only means guaranteed not to write to the
    /// backing store; writing to caches is still fine.
    pub fn begin_transaction(&self, read_only: bool) -> Transaction {
        self.transactions.begin(read_only)
    }

    pub fn end_transaction(&self, tx: Transaction) {
        self.transactions.end(tx)
    }

    /// Recompute every cache's deserved allocation from recent access
    /// frequency and usage, then start shrinking the overgrown ones.
    /// Intended to be invoked periodically by the embedding application.
    pub fn rebalance(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        self.rebalance_locked(&mut state, false)
    }

    /// Hand a job to the scheduler hook.
    pub fn post(&self, job: Job) -> bool {
        (self.post)(job)
    }

    pub fn ideal_lower_fill_ratio(&self) -> f64 {
        self.options.ideal_lower_fill_ratio
    }

    pub fn ideal_upper_fill_ratio(&self) -> f64 {
        self.options.ideal_upper_fill_ratio
    }

    pub fn max_cache_value_size(&self) -> u64 {
        self.options.max_cache_value_size
    }

    pub(crate) fn prng(&self) -> &Arc<SharedPrng> {
        &self.prng
    }

    pub(crate) fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    // ---------------------------------------------------------------------
    // used by caches

    pub(crate) fn adjust_global_allocation(&self, value: i64) {
        if value > 0 {
            let mut state = self.state.write();
            state.add_allocation(value as u64);
        } else if value < 0 {
            let mut state = self.state.write();
            state.sub_allocation(value.unsigned_abs());
        }
    }

    fn create_table(
        &self,
        state: &mut State,
        fixed_size: u64,
        max_size: u64,
    ) -> Result<(MetadataInner, Arc<Table>), Error> {
        let log_size = MIN_LOG_SIZE;
        let usage_limit = MIN_CACHE_SIZE;

        if state.global_highwater_mark / (state.caches.len() as u64 + 1) < MIN_CACHE_ALLOCATION {
            return Err(Error::ResourceLimit);
        }

        let table = self
            .lease_table(state, log_size)
            .ok_or(Error::ResourceLimit)?;
        let table_size = table.memory_usage();

        if usage_limit + fixed_size + table_size + CACHE_RECORD_OVERHEAD > max_size {
            self.reclaim_table_locked(state, table);
            return Err(Error::ResourceLimit);
        }

        let metadata = MetadataInner::new(usage_limit, fixed_size, table_size, max_size);
        debug_assert!(metadata.allocated_size >= table_size);

        if !state.increase_allowed(metadata.allocated_size - table_size, true) {
            self.reclaim_table_locked(state, table);
            return Err(Error::ResourceLimit);
        }

        Ok((metadata, table))
    }

    /// Remove a cache from the registry; `allocation` is what its metadata
    /// still accounts for (usage limit, struct, record overhead).
    pub(crate) fn unregister_cache(&self, id: u64, allocation: u64) {
        let mut state = self.state.write();
        self.access_stats.purge(id);
        if state.caches.remove(&id).is_some() {
            state.sub_allocation(allocation);
        }
    }

    /// A cache asks for a larger usage limit.
    pub(crate) fn request_grow(&self, cache: Arc<dyn Managed>) -> (bool, u64) {
        let mut next_request = now_micros() + REQUEST_BACKOFF;
        let mut allowed = false;

        if let Some(mut state) = self.state.try_write(TRIES_SLOW) {
            if state.is_operational() && !state.global_process_running() {
                let mut meta = cache.core().metadata.write();
                allowed = !meta.is_resizing() && !meta.is_migrating();
                if allowed {
                    if meta.allocated_size >= meta.deserved_size
                        && state.past_rebalancing_grace_period()
                    {
                        let increase = (meta.hard_usage_limit / 2)
                            .min(meta.max_size - meta.allocated_size);
                        if increase > 0 && state.increase_allowed(increase, false) {
                            let new_limit = meta.allocated_size + increase;
                            meta.adjust_deserved(new_limit);
                        } else {
                            allowed = false;
                        }
                    }

                    if allowed {
                        next_request = now_micros();
                        let new_limit = meta.new_limit();
                        self.resize_cache(
                            TaskEnvironment::None,
                            &mut state,
                            &cache,
                            meta,
                            new_limit,
                        );
                        return (allowed, next_request);
                    }
                }
            }
        }

        (allowed, next_request)
    }

    /// A cache asks for a table of `requested_log_size`.
    pub(crate) fn request_migrate(
        &self,
        cache: Arc<dyn Managed>,
        requested_log_size: u32,
    ) -> (bool, u64) {
        let mut next_request = now_micros() + REQUEST_BACKOFF;
        let mut allowed = false;

        if let Some(mut state) = self.state.try_write(TRIES_SLOW) {
            if state.is_operational() && !state.global_process_running() {
                let mut meta = cache.core().metadata.write();
                allowed = !meta.is_migrating();
                if allowed {
                    let new_table_size = Table::allocation_size(requested_log_size);
                    if meta.table_size < new_table_size {
                        let increase = new_table_size - meta.table_size;
                        if meta.allocated_size + increase >= meta.deserved_size
                            && state.past_rebalancing_grace_period()
                        {
                            if state.increase_allowed(increase, false) {
                                let new_limit = meta.allocated_size + increase;
                                let granted = meta.adjust_deserved(new_limit);
                                if granted < new_limit {
                                    allowed = false;
                                }
                            } else {
                                allowed = false;
                            }
                        }
                    }

                    if allowed {
                        allowed = meta.migration_allowed(new_table_size);
                    }
                    if allowed {
                        match self.lease_table(&mut state, requested_log_size) {
                            Some(table) => {
                                next_request = now_micros();
                                self.migrate_cache(
                                    TaskEnvironment::None,
                                    &mut state,
                                    &cache,
                                    meta,
                                    table,
                                );
                                return (allowed, next_request);
                            },
                            None => allowed = false,
                        }
                    }
                }
            }
        }

        (allowed, next_request)
    }

    pub(crate) fn report_access(&self, id: u64) {
        if self.prng.next() & 7 == 0 {
            self.access_stats.insert(id);
        }
    }

    pub(crate) fn report_hit(&self) {
        self.find_hits.fetch_add(1, Ordering::Relaxed);
        if let Some(buffer) = &self.find_stats {
            buffer.insert(stat::FIND_HIT);
        }
    }

    pub(crate) fn report_miss(&self) {
        self.find_misses.fetch_add(1, Ordering::Relaxed);
        if let Some(buffer) = &self.find_stats {
            buffer.insert(stat::FIND_MISS);
        }
    }

    // ---------------------------------------------------------------------
    // task lifecycle

    pub(crate) fn prepare_task(&self, environment: TaskEnvironment) {
        self.outstanding_tasks.fetch_add(1, Ordering::AcqRel);
        match environment {
            TaskEnvironment::Rebalancing => {
                self.rebalancing_tasks.fetch_add(1, Ordering::AcqRel);
            },
            TaskEnvironment::Resizing => {
                self.resizing_tasks.fetch_add(1, Ordering::AcqRel);
            },
            TaskEnvironment::None => {},
        }
    }

    /// Task teardown from task context (no manager lock held).
    pub(crate) fn unprepare_task(&self, environment: TaskEnvironment) {
        match environment {
            TaskEnvironment::Rebalancing => {
                if self.rebalancing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut state = self.state.write();
                    state.rebalancing = false;
                    state.rebalance_completed = now_micros();
                }
            },
            TaskEnvironment::Resizing => {
                if self.resizing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut state = self.state.write();
                    state.resizing = false;
                    let soft = state.global_soft_limit;
                    let _ = state.adjust_global_limits_if_allowed(soft);
                }
            },
            TaskEnvironment::None => {},
        }
        self.outstanding_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Task teardown while the manager lock is already held (dispatch
    /// failure path).
    pub(crate) fn unprepare_task_locked(&self, environment: TaskEnvironment, state: &mut State) {
        match environment {
            TaskEnvironment::Rebalancing => {
                if self.rebalancing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    state.rebalancing = false;
                    state.rebalance_completed = now_micros();
                }
            },
            TaskEnvironment::Resizing => {
                if self.resizing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    state.resizing = false;
                }
            },
            TaskEnvironment::None => {},
        }
        self.outstanding_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    // ---------------------------------------------------------------------
    // rebalancing

    fn rebalance_locked(
        &self,
        state: &mut State,
        only_calculate: bool,
    ) -> Result<(), Error> {
        if !only_calculate {
            if state.caches.is_empty() {
                return Ok(());
            }
            if !state.is_operational() {
                return Err(Error::ShuttingDown);
            }
            if state.global_process_running() {
                return Err(Error::Busy);
            }
            state.rebalancing = true;
        }

        let list = self.priority_list(state);
        for (cache, weight) in &list {
            let new_deserved = (weight * state.global_highwater_mark as f64).ceil() as u64;
            debug!(
                id = cache.id(),
                weight = *weight,
                new_deserved,
                "rebalancing deserved size"
            );
            let mut meta = cache.core().metadata.write();
            meta.adjust_deserved(new_deserved);
        }

        if !only_calculate {
            if state.global_allocation as f64 >= state.global_highwater_mark as f64 * 0.7 {
                self.shrink_overgrown_caches(TaskEnvironment::Rebalancing, state);
            }

            if self.rebalancing_tasks.load(Ordering::Acquire) == 0 {
                state.rebalance_completed = now_micros();
                state.rebalancing = false;
            }
        }

        Ok(())
    }

    /// Weigh every registered cache by a base share, its recent access
    /// frequency and its current usage, normalized so the weights sum to at
    /// most 1.0. Unaccessed caches come first, accessed ones follow in
    /// ascending frequency order.
    fn priority_list(&self, state: &State) -> Vec<(Arc<dyn Managed>, f64)> {
        let caches: Vec<(u64, Arc<dyn Managed>)> = state
            .caches
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|cache| (*id, cache)))
            .collect();
        if caches.is_empty() {
            return Vec::new();
        }

        let highwater = state.global_highwater_mark as f64;
        let mut minimum_weight = MIN_CACHE_ALLOCATION as f64 / highwater;
        while (((minimum_weight * highwater).ceil()) as u64) < MIN_CACHE_ALLOCATION {
            // bump by 0.1% until precision issues are overcome
            minimum_weight *= 1.001;
        }

        let uniform_marginal_weight = 0.2 / caches.len() as f64;
        let base_weight = minimum_weight.max(uniform_marginal_weight);
        let remaining_weight = (1.0 - base_weight * caches.len() as f64).max(0.0);

        debug!(base_weight, remaining_weight, "priority list weights");

        // approximate access counts, ascending by count (the buffer's
        // ordering contract)
        let stats = self.access_stats.frequencies();
        let mut accessed = FxHashSet::default();
        let mut total_accesses: u64 = 0;
        for (id, count) in &stats {
            if caches.iter().any(|(cache_id, _)| cache_id == id) {
                total_accesses += count;
                accessed.insert(*id);
            }
        }
        let total_accesses = total_accesses.max(1);

        let alloc_frac =
            0.8 * (state.global_allocation as f64 / highwater).min(1.0);

        let usages: BTreeMap<u64, u64> = caches
            .iter()
            .map(|(id, cache)| (*id, cache.usage()))
            .collect();
        let global_usage = usages.values().sum::<u64>().max(1);

        let access_normalizer =
            ((1.0 - alloc_frac) * remaining_weight) / total_accesses as f64;
        let usage_normalizer = (alloc_frac * remaining_weight) / global_usage as f64;

        let mut list = Vec::with_capacity(caches.len());

        // unaccessed caches first
        for (id, cache) in &caches {
            if !accessed.contains(id) {
                let weight = base_weight + usages[id] as f64 * usage_normalizer;
                list.push((Arc::clone(cache), weight));
            }
        }

        // accessed caches in ascending frequency order
        for (id, count) in &stats {
            if accessed.contains(id) {
                let (_, cache) = caches
                    .iter()
                    .find(|(cache_id, _)| cache_id == id)
                    .expect("accessed ids are a subset of registered caches");
                let weight = base_weight
                    + *count as f64 * access_normalizer
                    + usages[id] as f64 * usage_normalizer;
                list.push((Arc::clone(cache), weight));
            }
        }

        list
    }

    fn shrink_overgrown_caches(&self, environment: TaskEnvironment, state: &mut State) {
        let caches: Vec<Arc<dyn Managed>> =
            state.caches.values().filter_map(Weak::upgrade).collect();

        for cache in caches {
            if !cache.can_resize() {
                continue;
            }
            let meta = cache.core().metadata.write();
            if meta.allocated_size > meta.deserved_size {
                let new_limit = meta.new_limit();
                self.resize_cache(environment, state, &cache, meta, new_limit);
            }
        }
    }

    fn free_unused_tables(state: &mut State) {
        for index in 0..state.tables.len() {
            while let Some(table) = state.tables[index].pop() {
                let memory_usage = table.memory_usage();
                state.sub_allocation(memory_usage);
                debug_assert!(state.spare_table_allocation >= memory_usage);
                state.spare_table_allocation -= memory_usage;
                debug_assert!(state.spare_tables > 0);
                state.spare_tables -= 1;
            }
        }
    }

    // ---------------------------------------------------------------------
    // per-cache adjustments

    fn resize_cache(
        &self,
        environment: TaskEnvironment,
        state: &mut State,
        cache: &Arc<dyn Managed>,
        mut meta: crate::sync::WriteGuard<'_, MetadataInner>,
        new_limit: u64,
    ) {
        if meta.usage() <= new_limit {
            let old_allocated = meta.allocated_size;
            let ok = meta.adjust_limits(new_limit, new_limit);
            debug_assert!(ok);
            if ok {
                let new_allocated = meta.allocated_size;
                drop(meta);
                if new_allocated >= old_allocated {
                    state.add_allocation(new_allocated - old_allocated);
                } else {
                    state.sub_allocation(old_allocated - new_allocated);
                }
            }
            return;
        }

        let hard_limit = meta.hard_usage_limit;
        if !meta.adjust_limits(new_limit, hard_limit) {
            return;
        }
        debug_assert!(!meta.is_resizing());
        meta.toggle_resizing();
        drop(meta);

        let mut dispatched = false;
        if !cache.is_shutdown() {
            let task = FreeMemoryTask::new(environment, self.arc(), Arc::clone(cache));
            dispatched = task.dispatch(self, state);
        }

        if dispatched {
            state.free_memory_tasks += 1;
        } else {
            let mut meta = cache.core().metadata.write();
            debug_assert!(meta.is_resizing());
            meta.toggle_resizing();
        }
    }

    fn migrate_cache(
        &self,
        environment: TaskEnvironment,
        state: &mut State,
        cache: &Arc<dyn Managed>,
        mut meta: crate::sync::WriteGuard<'_, MetadataInner>,
        table: Arc<Table>,
    ) {
        debug_assert!(!meta.is_migrating());
        meta.toggle_migrating();
        drop(meta);

        let mut dispatched = false;
        if !cache.is_shutdown() {
            let task = MigrateTask::new(
                environment,
                self.arc(),
                Arc::clone(cache),
                Arc::clone(&table),
            );
            dispatched = task.dispatch(self, state);
        }

        if dispatched {
            state.migrate_tasks += 1;
        } else {
            self.reclaim_table_locked(state, table);
            let mut meta = cache.core().metadata.write();
            debug_assert!(meta.is_migrating());
            meta.toggle_migrating();
        }
    }

    fn lease_table(&self, state: &mut State, log_size: u32) -> Option<Arc<Table>> {
        debug_assert!(log_size <= MAX_LOG_SIZE);

        let table = match state.tables[log_size as usize].pop() {
            Some(table) => {
                let memory_usage = table.memory_usage();
                debug_assert!(state.spare_table_allocation >= memory_usage);
                state.spare_table_allocation -= memory_usage;
                debug_assert!(state.spare_tables > 0);
                state.spare_tables -= 1;
                Some(table)
            },
            None => {
                if state.increase_allowed(Table::allocation_size(log_size), true) {
                    let table = Arc::new(Table::new(
                        log_size,
                        self.options.ideal_lower_fill_ratio,
                        self.options.ideal_upper_fill_ratio,
                    ));
                    state.add_allocation(table.memory_usage());
                    Some(table)
                } else {
                    None
                }
            },
        };

        if table.is_some() {
            state.active_tables += 1;
        }
        table
    }

    /// Return a table no cache uses any more: pool it if the spare rules
    /// admit it, free it otherwise.
    pub(crate) fn reclaim_table(&self, table: Arc<Table>) {
        let mut state = self.state.write();
        self.reclaim_table_locked(&mut state, table);
    }

    fn reclaim_table_locked(&self, state: &mut State, table: Arc<Table>) {
        debug_assert!(state.active_tables > 0);
        state.active_tables -= 1;

        let memory_usage = table.memory_usage();
        let log_size = table.log_size();
        let max_tables: usize = if log_size < 18 {
            1usize << (18 - log_size)
        } else {
            1
        };

        if state.tables[log_size as usize].len() < max_tables
            && memory_usage <= MAX_SPARE_TABLE_SIZE
            && memory_usage + state.spare_table_allocation <= self.options.max_spare_allocation
            && state.spare_tables < MAX_SPARE_TABLES_TOTAL
            && memory_usage + state.spare_table_allocation
                < (state.global_soft_limit - state.global_highwater_mark) / 2
        {
            state.tables[log_size as usize].push(table);
            state.spare_table_allocation += memory_usage;
            state.peak_spare_table_allocation =
                state.peak_spare_table_allocation.max(state.spare_table_allocation);
            state.spare_tables += 1;
            debug_assert!(state.spare_tables <= MAX_SPARE_TABLES_TOTAL);
        } else {
            state.sub_allocation(memory_usage);
            drop(table);
        }
    }
}
