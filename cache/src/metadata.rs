// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    cmp,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    cache::MIN_CACHE_SIZE,
    manager::CACHE_RECORD_OVERHEAD,
    sync::{ReadGuard, ReadWriteSpinLock, WriteGuard},
};

/// Accounting record shared between a cache and the manager.
///
/// Invariant after every mutation:
/// `allocated_size == hard_usage_limit + fixed_size + table_size + CACHE_RECORD_OVERHEAD`
/// and `allocated_size <= max_size`.
pub struct Metadata {
    inner: ReadWriteSpinLock<MetadataInner>,
}

pub struct MetadataInner {
    pub fixed_size: u64,
    pub table_size: u64,
    pub max_size: u64,
    pub allocated_size: u64,
    pub deserved_size: u64,

    pub usage: AtomicU64,
    pub soft_usage_limit: u64,
    pub hard_usage_limit: u64,

    migrating: bool,
    resizing: bool,
}

impl Metadata {
    pub fn new(inner: MetadataInner) -> Self {
        Self {
            inner: ReadWriteSpinLock::new(inner),
        }
    }

    pub fn read(&self) -> ReadGuard<MetadataInner> {
        self.inner.read()
    }

    pub fn write(&self) -> WriteGuard<MetadataInner> {
        self.inner.write()
    }

    pub fn try_read(&self, max_tries: u64) -> Option<ReadGuard<MetadataInner>> {
        self.inner.try_read(max_tries)
    }
}

impl MetadataInner {
    pub fn new(usage_limit: u64, fixed_size: u64, table_size: u64, max_size: u64) -> Self {
        let allocated_size = usage_limit + fixed_size + table_size + CACHE_RECORD_OVERHEAD;
        debug_assert!(allocated_size <= max_size);
        let this = Self {
            fixed_size,
            table_size,
            max_size,
            allocated_size,
            deserved_size: allocated_size,
            usage: AtomicU64::new(0),
            soft_usage_limit: usage_limit,
            hard_usage_limit: usage_limit,
            migrating: false,
            resizing: false,
        };
        this.check_invariants();
        this
    }

    fn check_invariants(&self) {
        debug_assert_eq!(
            self.allocated_size,
            self.hard_usage_limit + self.table_size + self.fixed_size + CACHE_RECORD_OVERHEAD
        );
        debug_assert!(self.allocated_size <= self.max_size);
    }

    /// Adjust usage by `change` unless that would cross a limit.
    ///
    /// Growth is refused when it would exceed the hard limit, or when it
    /// would cross the soft limit from below (a cache that is being shrunk
    /// may keep using memory it already had, but not claim back ground it
    /// has ceded). Shrinking always succeeds. The check-and-set runs as one
    /// CAS loop so concurrent writers cannot overshoot together.
    pub fn adjust_usage_if_allowed(&self, change: i64) -> bool {
        loop {
            let expected = self.usage.load(Ordering::Acquire);
            let desired = if change < 0 {
                expected.saturating_sub(change.unsigned_abs())
            } else {
                expected + change as u64
            };

            if desired > self.hard_usage_limit
                || (expected <= self.soft_usage_limit && desired > self.soft_usage_limit)
            {
                return false;
            }

            if self
                .usage
                .compare_exchange_weak(expected, desired, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Set the soft and hard usage limits.
    ///
    /// Only the explicit transitions of the resize state machine are
    /// accepted; anything else is rejected without touching state.
    pub fn adjust_limits(&mut self, soft_limit: u64, hard_limit: u64) -> bool {
        let fixed = self.table_size + self.fixed_size + CACHE_RECORD_OVERHEAD;
        let usage = self.usage.load(Ordering::Acquire);

        let accept = |this: &mut Self| {
            this.soft_usage_limit = soft_limit;
            this.hard_usage_limit = hard_limit;
            this.allocated_size = hard_limit + fixed;
            this.check_invariants();
            true
        };

        // start shrinking to the minimum, regardless of deserved/max: the
        // table may currently be too big and shrinks during the process
        if soft_limit == MIN_CACHE_SIZE && hard_limit == self.hard_usage_limit {
            return accept(self);
        }

        // finalize the shrink to minimum
        if soft_limit == MIN_CACHE_SIZE && hard_limit == MIN_CACHE_SIZE && usage <= hard_limit {
            return accept(self);
        }

        // start shrinking
        if hard_limit == self.hard_usage_limit
            && soft_limit < hard_limit
            && soft_limit + fixed <= cmp::min(self.deserved_size, self.max_size)
        {
            return accept(self);
        }

        // finish shrinking
        if soft_limit == self.soft_usage_limit && soft_limit == hard_limit && usage <= hard_limit {
            return accept(self);
        }

        // grow (or set both) above usage but below deserved/max
        if soft_limit == hard_limit
            && usage <= hard_limit
            && hard_limit + fixed <= cmp::min(self.deserved_size, self.max_size)
        {
            return accept(self);
        }

        false
    }

    pub fn adjust_deserved(&mut self, deserved: u64) -> u64 {
        self.deserved_size = cmp::min(deserved, self.max_size);
        self.deserved_size
    }

    /// The recommended hard usage limit after a deserved-size change,
    /// clamped between the minimum cache size and four times the current
    /// limit.
    pub fn new_limit(&self) -> u64 {
        let fixed = self.fixed_size + self.table_size + CACHE_RECORD_OVERHEAD;
        if MIN_CACHE_SIZE + fixed >= self.deserved_size {
            MIN_CACHE_SIZE
        } else {
            cmp::min(self.deserved_size - fixed, 4 * self.hard_usage_limit)
        }
    }

    /// Whether a table of `new_table_size` fits under deserved and max.
    pub fn migration_allowed(&self, new_table_size: u64) -> bool {
        self.hard_usage_limit + self.fixed_size + new_table_size + CACHE_RECORD_OVERHEAD
            <= cmp::min(self.deserved_size, self.max_size)
    }

    pub fn change_table(&mut self, new_table_size: u64) {
        self.table_size = new_table_size;
        self.allocated_size =
            self.hard_usage_limit + self.fixed_size + self.table_size + CACHE_RECORD_OVERHEAD;
        self.check_invariants();
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating
    }

    pub fn is_resizing(&self) -> bool {
        self.resizing
    }

    pub fn toggle_migrating(&mut self) {
        self.migrating = !self.migrating;
    }

    pub fn toggle_resizing(&mut self) {
        self.resizing = !self.resizing;
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }
}
