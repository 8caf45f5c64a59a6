// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{sync::Arc, thread};

use link_cache::{
    cache::Cache,
    BinaryKeyHasher,
    CacheKind,
    CacheOptions,
    SharedPrng,
    Value,
};

use crate::{
    helpers::{key, manager, manager_with_scheduler, value},
    logging,
    scheduler::Pool,
};

fn hammer(cache: Arc<dyn Cache>, thread_id: u64, operations: u64) {
    let prng = SharedPrng::new();
    for i in 0..operations {
        let k = (thread_id << 32) | (prng.next() % 4096);
        match i % 4 {
            0 | 1 => {
                let _ = cache.insert(Value::new(&key(k), &key(i)).unwrap());
            },
            2 => {
                let _ = cache.find(&key(k));
            },
            _ => {
                let _ = cache.remove(&key(k));
            },
        }
    }
}

#[test]
fn concurrent_mixed_operations_keep_invariants_long_running() {
    logging::init();
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 4 * 1024 * 1024)
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || hammer(cache, thread_id, 50_000))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (size, usage) = cache.size_and_usage();
    assert!(usage <= cache.usage_limit());
    assert!(cache.usage_limit() <= size);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn concurrent_transactional_operations_with_terms_long_running() {
    logging::init();
    let manager = manager(CacheOptions {
        cache_size: 16 * 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Transactional, false, 4 * 1024 * 1024)
        .unwrap();

    let writers: Vec<_> = (0..2)
        .map(|thread_id| {
            let manager = Arc::clone(&manager);
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0u64..2_000 {
                    let k = (thread_id << 32) | (i % 512);
                    let tx = manager.begin_transaction(false);
                    let _ = cache.banish(&key(k));
                    manager.end_transaction(tx);
                    let _ = cache.insert(value(k));
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|thread_id| {
            let manager = Arc::clone(&manager);
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0u64..10_000 {
                    let k = ((thread_id % 2) << 32) | (i % 512);
                    let tx = manager.begin_transaction(true);
                    let _ = cache.find(&key(k));
                    manager.end_transaction(tx);
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    let (size, usage) = cache.size_and_usage();
    assert!(usage <= cache.usage_limit());
    assert!(cache.usage_limit() <= size);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn concurrent_inserts_while_migrating_long_running() {
    logging::init();
    let pool = Pool::new(2);
    let manager = manager_with_scheduler(
        CacheOptions {
            cache_size: 64 * 1024 * 1024,
            ..CacheOptions::default()
        },
        &pool,
    );
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, u64::MAX)
        .unwrap();

    // keep traffic up while a size hint forces a migration underneath
    let writer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for i in 0u64..100_000 {
                let _ = cache.insert(value(i));
                if i % 64 == 0 {
                    let _ = cache.find(&key(i / 2));
                }
            }
        })
    };

    thread::sleep(std::time::Duration::from_millis(5));
    cache.size_hint(200_000);
    writer.join().unwrap();

    let (size, usage) = cache.size_and_usage();
    assert!(usage <= cache.usage_limit());
    assert!(cache.usage_limit() <= size);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn prng_streams_differ_across_calls() {
    let prng = SharedPrng::new();
    let a = prng.next();
    let b = prng.next();
    let c = prng.next();
    assert!(!(a == b && b == c));
}
