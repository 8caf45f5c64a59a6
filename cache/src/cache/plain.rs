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
    bucket::{plain, Flag, GenericBucket, PlainBucket},
    error::Error,
    hasher::Hasher,
    manager::Manager,
    metadata::Metadata,
    sync::TRIES_GUARANTEE,
    table::{HashOrId, Table},
    value::{free_value, Finding, Value},
};

/// A simple, LRU-ish cache.
///
/// Created through [`Manager::create_cache`]. Entries are evicted when their
/// bucket runs out of slots or when the cache is asked to free memory; an
/// entry that a [`Finding`] still refers to is never evicted.
pub struct PlainCache<H: Hasher> {
    core: Core,
    _hasher: PhantomData<H>,
}

impl<H: Hasher> PlainCache<H> {
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
                    plain::SLOTS,
                    self_ref,
                ),
                _hasher: PhantomData,
            }
        });
        table.set_slots_per_bucket(plain::SLOTS);
        table.enable();
        cache
    }
}

impl<H: Hasher> Cache for PlainCache<H> {
    fn find(&self, key: &[u8]) -> Finding {
        let hash = H::hash(key);
        match self.core.get_bucket(HashOrId::Hash(hash), TRIES_FAST, true) {
            Ok(locker) => {
                let bucket = locker.bucket::<PlainBucket>();
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
        let locker = self.core.get_bucket(HashOrId::Hash(hash), TRIES_FAST, true)?;
        let bucket = locker.bucket::<PlainBucket>();

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
        let locker = self.core.get_bucket(HashOrId::Hash(hash), TRIES_SLOW, true)?;
        let bucket = locker.bucket::<PlainBucket>();

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

        let table = Arc::clone(locker.source());
        drop(locker);

        if maybe_shrink {
            self.core
                .request_migrate(table.ideal_size(), table.log_size());
        }
        Ok(())
    }

    fn banish(&self, _key: &[u8]) -> Result<(), Error> {
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

impl<H: Hasher> Managed for PlainCache<H> {
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
            let bucket = locker.bucket::<PlainBucket>();
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
        let source = source_locker.bucket::<PlainBucket>();
        debug_assert!(!source_locker.generic().is_migrated());

        let mut moved = 0u64;
        let mut emptied = 0u64;
        for slot in 0..plain::SLOTS {
            let (hash, value) = source.slot(slot);
            if value.is_null() {
                continue;
            }
            emptied += 1;

            let target = guards[targets.index_of(hash)].bucket::<PlainBucket>();
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
                        // no eligible victim; the migrating value is dropped
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
        let plain_bucket = unsafe { &*(bucket as *const GenericBucket as *const PlainBucket) };
        for slot in 0..plain::SLOTS {
            let value = plain_bucket.value_at(slot);
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
        plain_bucket.reset_slots();
        bucket.state().clear();
        bucket.state().unlock();
    }
}

impl<H: Hasher> Drop for PlainCache<H> {
    fn drop(&mut self) {
        self.shutdown_managed();
    }
}
