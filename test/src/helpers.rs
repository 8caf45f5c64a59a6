// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::Arc;

use link_cache::{manager::Manager, CacheOptions, PostFn, SharedPrng, Value};

use crate::scheduler::Pool;

/// A post hook that rejects every job, for tests that want all resizing and
/// migration to happen synchronously or not at all.
pub fn rejecting_post() -> PostFn {
    Box::new(|_| false)
}

pub fn manager(options: CacheOptions) -> Arc<Manager> {
    Manager::new(Arc::new(SharedPrng::new()), rejecting_post(), options)
}

pub fn manager_with_scheduler(options: CacheOptions, pool: &Pool) -> Arc<Manager> {
    Manager::new(Arc::new(SharedPrng::new()), pool.post_fn(), options)
}

/// An eight-byte little-endian key, the workhorse of the test corpus.
pub fn key(i: u64) -> [u8; 8] {
    i.to_le_bytes()
}

pub fn value(i: u64) -> Value {
    Value::new(&key(i), &key(i)).expect("allocation succeeds")
}

pub fn sized_value(i: u64, value_size: usize) -> Value {
    Value::new(&key(i), &vec![0u8; value_size]).expect("allocation succeeds")
}
