// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{thread, time::Duration};

use link_cache::{BinaryKeyHasher, CacheKind, CacheOptions, Value};

use crate::{
    helpers::{key, manager, manager_with_scheduler, sized_value, value},
    logging,
    scheduler::Pool,
};

#[test]
fn basic_cache_creation() {
    let manager = manager(CacheOptions {
        cache_size: 1024 * 1024,
        ..CacheOptions::default()
    });

    let cache1 = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 256 * 1024)
        .unwrap();
    let cache2 = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 512 * 1024)
        .unwrap();

    assert_eq!(cache1.usage(), 0);
    assert!(cache1.size() <= 256 * 1024);
    assert_eq!(cache2.usage(), 0);
    assert!(cache2.size() <= 512 * 1024);
    assert_ne!(cache1.id(), cache2.id());

    manager.destroy_cache(cache1);
    manager.destroy_cache(cache2);
    manager.shutdown();
}

#[test]
fn insertion_and_replacement() {
    let cache_limit = 128 * 1024;
    let manager = manager(CacheOptions {
        cache_size: 4 * cache_limit,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, cache_limit)
        .unwrap();

    for i in 0..1024u64 {
        if cache.insert(value(i)).is_ok() {
            assert!(cache.find(&key(i)).found());
        }
    }

    // replacement: same key, new payload
    for i in 0..1024u64 {
        let replacement = Value::new(&key(i), &key(2 * i)).unwrap();
        if cache.insert(replacement).is_ok() {
            let finding = cache.find(&key(i));
            assert!(finding.found());
            assert_eq!(finding.value().unwrap().value(), &key(2 * i));
        }
    }

    // keep pushing well past the limit; the cache evicts rather than grow
    for i in 1024..16 * 1024u64 {
        if cache.insert(value(i)).is_ok() {
            assert!(cache.find(&key(i)).found());
        }
    }
    assert!(cache.size() <= cache_limit);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn removal_leaves_other_keys_alone() {
    let manager = manager(CacheOptions {
        cache_size: 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 256 * 1024)
        .unwrap();

    for i in 0..1024u64 {
        let _ = cache.insert(value(i));
    }
    let inserted = (0..1024u64).filter(|i| cache.find(&key(*i)).found()).count();
    assert!(inserted > 0);

    // removal of absent keys succeeds and disturbs nothing
    for i in 1024..1088u64 {
        assert_eq!(cache.remove(&key(i)), Ok(()));
    }
    let found = (0..1024u64).filter(|i| cache.find(&key(*i)).found()).count();
    assert_eq!(inserted, found);

    // removal of present keys is final and idempotent
    for i in 0..1024u64 {
        assert_eq!(cache.remove(&key(i)), Ok(()));
        assert_eq!(cache.remove(&key(i)), Ok(()));
        assert!(!cache.find(&key(i)).found());
    }
    assert_eq!(cache.usage(), 0);

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn findings_are_refcounted_read_handles() {
    let manager = manager(CacheOptions {
        cache_size: 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 256 * 1024)
        .unwrap();

    cache.insert(value(1)).unwrap();

    let first = cache.find(&key(1));
    let second = cache.find(&key(1));
    assert!(first.found());
    assert!(second.found());
    assert_eq!(first.result(), Ok(()));

    drop(first);
    // the remaining handle still reads the record
    assert_eq!(second.value().unwrap().key(), &key(1));
    assert_eq!(second.value().unwrap().value(), &key(1));
    drop(second);

    let missing = cache.find(&key(2));
    assert!(!missing.found());
    assert_eq!(missing.result(), Err(link_cache::Error::NotFound));

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn hit_and_miss_rates() {
    let manager = manager(CacheOptions {
        cache_size: 4 * 1024 * 1024,
        enable_windowed_stats: true,
        ..CacheOptions::default()
    });

    let hot = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, true, 1024 * 1024)
        .unwrap();
    for i in 0..1024u64 {
        let _ = hot.insert(value(i));
    }
    for i in 0..1024u64 {
        let _ = hot.find(&key(i));
    }
    let (lifetime, windowed) = hot.hit_rates();
    assert!(lifetime >= 40.0, "lifetime hit rate too low: {}", lifetime);
    assert!(windowed >= 40.0, "windowed hit rate too low: {}", windowed);

    let cold = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, true, 1024 * 1024)
        .unwrap();
    for i in 0..1024u64 {
        let _ = cold.insert(value(i));
    }
    for i in 1024..2048u64 {
        assert!(!cold.find(&key(i)).found());
    }
    let (lifetime, windowed) = cold.hit_rates();
    assert_eq!(lifetime, 0.0);
    assert_eq!(windowed, 0.0);

    let (global_lifetime, _) = manager.global_hit_rates();
    assert!(
        global_lifetime > 10.0 && global_lifetime < 60.0,
        "global hit rate out of range: {}",
        global_lifetime
    );

    manager.destroy_cache(hot);
    manager.destroy_cache(cold);
    manager.shutdown();
}

#[test]
fn bounded_usage_under_sustained_inserts() {
    let manager = manager(CacheOptions {
        cache_size: 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 128 * 1024)
        .unwrap();

    let mut inserted = 0u64;
    for i in 0..16 * 1024u64 {
        let record = Value::new(&[key(i), key(i)].concat(), &[0u8; 16]).unwrap();
        if cache.insert(record).is_ok() {
            inserted += 1;
        }
    }

    assert!(inserted > 0);
    assert!(cache.size() <= 128 * 1024);
    assert!(cache.usage() <= cache.usage_limit());
    assert!(cache.usage_limit() <= cache.size());

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn grows_when_it_runs_out_of_space_long_running() {
    logging::init();
    let pool = Pool::new(4);
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

    let initial_limit = cache.usage_limit();
    let mut next_key = 0u64;
    for _ in 0..64 {
        for _ in 0..8192 {
            let _ = cache.insert(value(next_key));
            next_key += 1;
        }
        if cache.usage_limit() > 2 * initial_limit {
            break;
        }
        thread::sleep(Duration::from_millis(110));
    }

    assert!(
        cache.usage_limit() > 2 * initial_limit,
        "usage limit never grew: {} vs initially {}",
        cache.usage_limit(),
        initial_limit
    );

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn size_hint_migrates_to_a_larger_table() {
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

    let initial_size = cache.size();
    // let the request window open
    thread::sleep(Duration::from_millis(5));
    cache.size_hint(100_000);

    let mut grown = false;
    for _ in 0..500 {
        if !cache.is_migrating() && cache.size() > initial_size {
            grown = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(grown, "table never migrated to a larger size");

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn oversized_values_are_refused() {
    let manager = manager(CacheOptions {
        cache_size: 4 * 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 1024 * 1024)
        .unwrap();

    let oversized = sized_value(1, 128 * 1024);
    assert_eq!(
        cache.insert(oversized),
        Err(link_cache::Error::ResourceLimit)
    );

    manager.destroy_cache(cache);
    manager.shutdown();
}

#[test]
fn banish_is_a_no_op() {
    let manager = manager(CacheOptions {
        cache_size: 1024 * 1024,
        ..CacheOptions::default()
    });
    let cache = manager
        .create_cache::<BinaryKeyHasher>(CacheKind::Plain, false, 256 * 1024)
        .unwrap();

    cache.insert(value(1)).unwrap();
    assert_eq!(cache.banish(&key(1)), Ok(()));
    assert!(cache.find(&key(1)).found());

    manager.destroy_cache(cache);
    manager.shutdown();
}
