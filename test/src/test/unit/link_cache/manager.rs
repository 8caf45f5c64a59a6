// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use pretty_assertions::assert_eq;

use link_cache::{
    manager::MIN_GLOBAL_SIZE,
    sync::TRIES_GUARANTEE,
    BinaryKeyHasher,
    CacheKind,
    CacheOptions,
    Error,
};

use crate::helpers::manager;

#[test]
fn allocation_bookkeeping_across_cache_lifecycles() {
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });

    let before = manager.memory_stats(TRIES_GUARANTEE).unwrap();
    assert_eq!(before.active_tables, 0);
    assert_eq!(before.spare_tables, 0);

    let cache1 = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX)
        .unwrap();
    let cache2 = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Transactional, false, u64::MAX)
        .unwrap();

    let during = manager.memory_stats(TRIES_GUARANTEE).unwrap();
    assert_eq!(during.active_tables, 2);
    // the global allocation covers exactly the caches' allocated sizes
    assert_eq!(
        during.global_allocation,
        before.global_allocation + cache1.size() + cache2.size()
    );
    assert!(during.peak_global_allocation >= during.global_allocation);

    manager.destroy_cache(cache1);
    manager.destroy_cache(cache2);

    let after = manager.memory_stats(TRIES_GUARANTEE).unwrap();
    assert_eq!(after.active_tables, 0);
    // small tables are pooled for reuse, and accounted as spare
    assert_eq!(after.spare_tables, 2);
    assert_eq!(
        after.global_allocation,
        before.global_allocation + after.spare_allocation
    );

    manager.shutdown();

    let end = manager.memory_stats(TRIES_GUARANTEE).unwrap();
    assert_eq!(end.spare_tables, 0);
    assert_eq!(end.global_allocation, before.global_allocation);
}

#[test]
fn spare_tables_are_reused() {
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });

    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX)
        .unwrap();
    manager.destroy_cache(cache);
    assert_eq!(manager.memory_stats(TRIES_GUARANTEE).unwrap().spare_tables, 1);

    // the next cache picks the pooled table up again
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Transactional, false, u64::MAX)
        .unwrap();
    let stats = manager.memory_stats(TRIES_GUARANTEE).unwrap();
    assert_eq!(stats.spare_tables, 0);
    assert_eq!(stats.active_tables, 1);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn cache_creation_is_refused_under_pressure() {
    let manager = manager(CacheOptions {
        cache_size: MIN_GLOBAL_SIZE,
        ..CacheOptions::default()
    });

    let mut caches = Vec::new();
    let refused = loop {
        match manager.create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX) {
            Ok(cache) => caches.push(cache),
            Err(error) => break error,
        }
        assert!(caches.len() < 1024, "creation never hit the budget");
    };

    assert_eq!(refused, Error::ResourceLimit);
    assert!(caches.len() >= 2);

    for cache in caches {
        manager.destroy_cache(cache);
    }
    manager.shutdown();
}

#[test]
fn global_resize() {
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });
    assert_eq!(manager.global_limit(), 16 * 1024 * 1024);

    // growing is immediate
    assert!(manager.resize(32 * 1024 * 1024));
    assert_eq!(manager.global_limit(), 32 * 1024 * 1024);

    // below the floor
    assert!(!manager.resize(MIN_GLOBAL_SIZE / 2));
    assert_eq!(manager.global_limit(), 32 * 1024 * 1024);

    // shrinking with idle caches is immediate too
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX)
        .unwrap();
    assert!(manager.resize(8 * 1024 * 1024));
    assert_eq!(manager.global_limit(), 8 * 1024 * 1024);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn shutdown_refuses_new_caches_and_is_idempotent() {
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });

    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX)
        .unwrap();

    manager.begin_shutdown();
    assert!(matches!(
        manager.create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX),
        Err(Error::ShuttingDown)
    ));

    manager.shutdown();
    assert!(cache.is_shutdown());
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.usage(), 0);

    // calling again is fine
    manager.shutdown();
}

#[test]
fn memory_stats_respects_the_tries_budget() {
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });

    assert!(manager.memory_stats(TRIES_GUARANTEE).is_some());
    assert!(manager.memory_stats(0).is_none());
}

#[test]
fn rebalance_without_caches_is_a_no_op() {
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });
    assert_eq!(manager.rebalance(), Ok(()));

    manager.begin_shutdown();
    let cache = manager.create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX);
    assert!(cache.is_err());
    manager.shutdown();
}
