// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    marker::PhantomData,
    mem,
    ptr,
    sync::{Arc, Weak},
};

use super::{Cache, Core, Managed, TRIES_FAST, TRIES_SLOW};
use crate::{
    bucket::{transactional, Flag, GenericBucket, TransactionalBucket},
    error::Error,
    hasher::Hasher,
    manager::Manager,
    metadata::Metadata,
    sync::TRIES_GUARANTEE,
    table::{BucketLocker, HashOrId, Table},
    value::{free_value, Finding, Value},
};

/// A transactional, LRU-ish cache.
///
/// Behaves like [`PlainCache`] with one addition: keys about to be written
/// to the backing store must be banished here first. A banished hash makes
/// lookups fall through to the store and refuses inserts with
/// [`Error::Conflict`] until the transaction term has moved on, so readers
/// can never observe a value that is stale with respect to a concurrent
/// writer.
///
/// [`PlainCache`]: crate::cache::PlainCache
pub struct TransactionalCache<H: Hasher> {
    core: Core,
    _hasher: PhantomData<H>,
}

impl<H: Hasher> TransactionalCache<H> {
    pub(crate) const fn allocation_size() -> u64 {
        mem::size_of::<Self>() as u64
    }

    pub(crate) fn create(
        manager: Arc<Manager>,
        id: u64,
        metadata: Metadata,
        table: Arc<Table>,
        enable_windowed_stats: bool,
    ) -> Arc<Self> {
        let cache = Arc::new_cyclic(|me: &Weak<Self>| {
            let self_ref: Weak<dyn Managed> = me.clone();
            Self {
                core: Core::new(
                    manager,
                    id,
                    metadata,
                    Arc::clone(&table),
                    enable_windowed_stats,
                    transactional::SLOTS,
                    self_ref,
                ),
                _hasher: PhantomData,
            }
        });
        table.set_slots_per_bucket(transactional::SLOTS);
        table.enable();
        cache
    }

    /// Like [`Core::get_bucket`], but also refreshes the bucket's banish
    /// term to the current transaction term.
    fn get_bucket(
        &self,
        bucket: HashOrId,
        max_tries: u64,
        single_operation: bool,
    ) -> Result<(BucketLocker, u64), Error> {
        let locker = self.core.get_bucket(bucket, max_tries, single_operation)?;
        let term = self.core.manager.transactions().term();
        locker
            .bucket::<TransactionalBucket>()
            .update_banish_term(term);
        Ok((locker, term))
    }
}

impl<H: Hasher> Cache for TransactionalCache<H> {
    fn find(&self, key: &[u8]) -> Finding {
        let hash = H::hash(key);
        match self.get_bucket(HashOrId::Hash(hash), TRIES_FAST, true) {
            Ok((locker, term)) => {
                let bucket = locker.bucket::<TransactionalBucket>();
                if bucket.is_banished(hash, term) {
                    drop(locker);
                    self.core.record_miss();
                    return Finding::miss(Error::NotFound);
                }
                match bucket.find::<H>(hash, key) {
                    Some(value) => {
                        let finding = Finding::hit(value);
                        drop(locker);
                        self.core.record_hit();
                        finding
                    },
                    None => {
                        drop(locker);
                        self.core.record_miss();
                        Finding::miss(Error::NotFound)
                    },
                }
            },
            Err(error) => Finding::miss(error),
        }
    }

    fn insert(&self, value: Value) -> Result<(), Error> {
        if value.size() > self.core.manager.max_cache_value_size() {
            return Err(Error::ResourceLimit);
        }

        let hash = H::hash(value.key());
        let (locker, term) = self.get_bucket(HashOrId::Hash(hash), TRIES_FAST, true)?;
        let bucket = locker.bucket::<TransactionalBucket>();

        if bucket.is_banished(hash, term) {
            return Err(Error::Conflict);
        }

        let mut had_eviction = false;
        let candidate = match bucket.position::<H>(hash, value.key()) {
            Some(slot) => Some(slot),
            None if bucket.is_full() => {
                let slot = bucket.eviction_candidate();
                if slot.is_none() {
                    // every resident value is referenced by a reader
                    return Err(Error::Busy);
                }
                had_eviction = true;
                slot
            },
            None => None,
        };

        let candidate_size = candidate
            .map(|slot| unsafe { (*bucket.value_at(slot)).size() })
            .unwrap_or(0);
        let change = value.size() as i64 - candidate_size as i64;

        let allowed = self.core.metadata.read().adjust_usage_if_allowed(change);
        if !allowed {
            drop(locker);
            self.core.request_grow();
            return Err(Error::ResourceLimit);
        }

        if let Some(slot) = candidate {
            let evicted = bucket.extract(slot);
            free_value(evicted);
        }
        bucket.insert(hash, value.into_raw());

        let mut maybe_migrate = false;
        if candidate.is_none() {
            maybe_migrate = locker.source().slot_filled();
        }
        let table = Arc::clone(locker.source());
        drop(locker);

        maybe_migrate |= self.core.report_insert(&table, had_eviction);
        if maybe_migrate {
            self.core
                .request_migrate(table.ideal_size(), table.log_size());
        }

        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), Error> {
        let hash = H::hash(key);
        let (locker, term) = self.get_bucket(HashOrId::Hash(hash), TRIES_SLOW, true)?;
        let bucket = locker.bucket::<TransactionalBucket>();

        let mut maybe_shrink = false;
        if let Some(removed) = bucket.remove::<H>(hash, key) {
            let size = unsafe { (*removed).size() };
            maybe_shrink = locker.source().slot_emptied();
            self.core
                .metadata
                .read()
                .adjust_usage_if_allowed(-(size as i64));
            free_value(removed);
        }
        // make the removal observable: a concurrent reader must fall through
        // to the store instead of re-reading a stale value inserted by
        // another thread within the same term
        bucket.banish(hash, term);

        let table = Arc::clone(locker.source());
        drop(locker);

        if maybe_shrink {
            self.core
                .request_migrate(table.ideal_size(), table.log_size());
        }
        Ok(())
    }

    fn banish(&self, key: &[u8]) -> Result<(), Error> {
        let hash = H::hash(key);
        let (locker, term) = self.get_bucket(HashOrId::Hash(hash), TRIES_SLOW, true)?;
        let bucket = locker.bucket::<TransactionalBucket>();

        if let Some(removed) = bucket.remove::<H>(hash, key) {
            let size = unsafe { (*removed).size() };
            let _ = locker.source().slot_emptied();
            self.core
                .metadata
                .read()
                .adjust_usage_if_allowed(-(size as i64));
            free_value(removed);
        }
        bucket.banish(hash, term);
        Ok(())
    }

    fn size_hint(&self, num_elements: u64) {
        self.core.size_hint(num_elements)
    }

    fn id(&self) -> u64 {
        self.core.id
    }

    fn size(&self) -> u64 {
        self.core.size()
    }

    fn usage(&self) -> u64 {
        self.core.usage()
    }

    fn usage_limit(&self) -> u64 {
        self.core.usage_limit()
    }

    fn size_and_usage(&self) -> (u64, u64) {
        self.core.size_and_usage()
    }

    fn hit_rates(&self) -> (f64, f64) {
        self.core.hit_rates()
    }

    fn is_resizing(&self) -> bool {
        self.core.is_resizing()
    }

    fn is_migrating(&self) -> bool {
        self.core.is_migrating()
    }

    fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }
}

impl<H: Hasher> Managed for TransactionalCache<H> {
    fn core(&self) -> &Core {
        &self.core
    }

    fn free_memory_while(&self, cb: &mut dyn FnMut(u64) -> bool) {
        let table = match self.core.table() {
            Some(table) => table,
            None => return,
        };

        for index in 0..table.size() as usize {
            let locker = table.fetch_and_lock_bucket(HashOrId::Id(index), TRIES_FAST);
            if !locker.is_locked() {
                continue;
            }
            let bucket = locker.bucket::<TransactionalBucket>();
            loop {
                let slot = match bucket.eviction_candidate() {
                    Some(slot) => slot,
                    None => break,
                };
                let evicted = bucket.extract(slot);
                let size = unsafe { (*evicted).size() };
                let _ = locker.source().slot_emptied();
                free_value(evicted);
                if !cb(size) {
                    return;
                }
            }
        }
    }

    fn migrate_bucket(&self, table: &Arc<Table>, index: usize, new_table: &Arc<Table>) {
        let targets = match table.auxiliary_buckets(index) {
            Some(targets) => targets,
            None => return,
        };
        debug_assert!(ptr::eq(targets.table().as_ref(), new_table.as_ref()));

        let source_locker = table.lock_primary(index);
        let guards = targets.lock_all();
        let source = source_locker.bucket::<TransactionalBucket>();
        debug_assert!(!source_locker.generic().is_migrated());

        // carry the banish state over before any values move
        let source_term = source.banish_term();
        for guard in &guards {
            guard
                .bucket::<TransactionalBucket>()
                .update_banish_term(source_term);
        }
        for slot in 0..transactional::BANISH_SLOTS {
            let banished = source.banish_hash_at(slot);
            if banished != 0 {
                guards[targets.index_of(banished)]
                    .bucket::<TransactionalBucket>()
                    .banish(banished, source_term);
            }
        }

        let mut moved = 0u64;
        let mut emptied = 0u64;
        for slot in 0..transactional::SLOTS {
            let (hash, value) = source.slot(slot);
            if value.is_null() {
                continue;
            }
            emptied += 1;

            let target = guards[targets.index_of(hash)].bucket::<TransactionalBucket>();
            if target.is_full() {
                match target.eviction_candidate() {
                    Some(victim_slot) => {
                        let victim = target.extract(victim_slot);
                        let size = unsafe { (*victim).size() };
                        new_table.slots_emptied(1);
                        self.core
                            .metadata
                            .read()
                            .adjust_usage_if_allowed(-(size as i64));
                        free_value(victim);
                    },
                    None => {
                        let size = unsafe { (*value).size() };
                        self.core
                            .metadata
                            .read()
                            .adjust_usage_if_allowed(-(size as i64));
                        free_value(value);
                        continue;
                    },
                }
            }
            target.insert(hash, value);
            moved += 1;
        }

        source.reset_slots();
        source_locker.generic().state().toggle(Flag::Migrated);
        table.slots_emptied(emptied);
        new_table.slots_filled(moved);
    }

    fn clear_bucket(&self, bucket: &GenericBucket) {
        bucket.state().lock(TRIES_GUARANTEE);
        let transactional_bucket =
            unsafe { &*(bucket as *const GenericBucket as *const TransactionalBucket) };
        for slot in 0..transactional::SLOTS {
            let value = transactional_bucket.value_at(slot);
            if value.is_null() {
                break;
            }
            let size = unsafe { (*value).size() };
            self.core
                .metadata
                .read()
                .adjust_usage_if_allowed(-(size as i64));
            free_value(value);
        }
        transactional_bucket.reset_all();
        bucket.state().clear();
        bucket.state().unlock();
    }
}

impl<H: Hasher> Drop for TransactionalCache<H> {
    fn drop(&mut self) {
        self.shutdown_managed();
    }
}
